// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory topology listener contract between the VMM address space
//! framework and vhost devices.
//!
//! The framework owns the guest address spaces and pushes a notification to
//! every registered listener whenever a section of an address space appears,
//! disappears or changes dirty logging state. Listeners are identified by a
//! stable tag handed out at registration, so no back pointer from the
//! framework into the device is needed.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use vm_memory::{GuestAddress, GuestUsize};

/// Address spaces a section may belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceKind {
    /// The guest system memory address space.
    SystemMemory,
    /// The guest port IO address space.
    SystemIo,
}

/// VMM view of the memory region backing a section.
pub trait GuestRegion: Send + Sync {
    /// True when the region is backed by host RAM.
    fn is_ram(&self) -> bool;

    /// True while another dirty tracking client is logging writes to the
    /// region.
    fn is_logging(&self) -> bool;

    /// Host virtual address of the first byte of the region's RAM backing.
    fn ram_host_addr(&self) -> u64;

    /// Mark `[offset, offset + len)` within the region dirty for migration.
    fn mark_dirty(&self, offset: u64, len: u64);
}

/// A contiguous piece of one guest address space.
#[derive(Clone)]
pub struct MemorySection {
    /// Address space the section lives in.
    pub address_space: AddressSpaceKind,
    /// Memory region backing the section.
    pub region: Arc<dyn GuestRegion>,
    /// Guest physical address of the first byte of the section.
    pub offset_within_address_space: GuestAddress,
    /// Offset of the section into its backing region.
    pub offset_within_region: u64,
    /// Section size in bytes.
    pub size: GuestUsize,
}

impl MemorySection {
    /// True for RAM backed sections of the system memory address space.
    pub fn is_system_ram(&self) -> bool {
        self.address_space == AddressSpaceKind::SystemMemory && self.region.is_ram()
    }
}

/// Callbacks pushed by the address space framework on topology and dirty
/// logging changes.
///
/// Every callback defaults to doing nothing so listeners only implement the
/// events they care about. Callbacks are serialised by the framework and must
/// not block.
pub trait MemoryListener: Send {
    /// A section was added to its address space.
    fn region_add(&mut self, _section: &MemorySection) {}

    /// A section is being removed from its address space.
    fn region_del(&mut self, _section: &MemorySection) {}

    /// A topology update left the section in place.
    fn region_nop(&mut self, _section: &MemorySection) {}

    /// Dirty bits covering the section should be flushed to the VMM bitmap.
    fn log_sync(&mut self, _section: &MemorySection) {}

    /// Dirty logging starts for one section.
    fn log_start(&mut self, _section: &MemorySection) {}

    /// Dirty logging stops for one section.
    fn log_stop(&mut self, _section: &MemorySection) {}

    /// Dirty logging was switched on for all of guest memory.
    fn log_global_start(&mut self) {}

    /// Dirty logging was switched off for all of guest memory.
    fn log_global_stop(&mut self) {}

    /// An ioeventfd was bound inside the section.
    fn eventfd_add(&mut self, _section: &MemorySection, _match_data: bool, _data: u64, _fd: RawFd) {
    }

    /// An ioeventfd was unbound from the section.
    fn eventfd_del(&mut self, _section: &MemorySection, _match_data: bool, _data: u64, _fd: RawFd) {
    }
}

/// Stable tag identifying a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Fans framework notifications out to the registered listeners.
///
/// Listeners are held weakly: a listener dropped without deregistering is
/// pruned on the next dispatch instead of keeping the device alive.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<(ListenerId, Weak<Mutex<dyn MemoryListener>>)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ListenerRegistry::default()
    }

    /// Register a listener and return the tag to deregister it with.
    pub fn register(&self, listener: Arc<Mutex<dyn MemoryListener>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::downgrade(&listener)));
        id
    }

    /// Drop the listener registered under `id`.
    pub fn unregister(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    /// Number of registered listeners, dead entries included.
    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// True when no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_each<F: FnMut(&mut dyn MemoryListener)>(&self, mut f: F) {
        // Collect the live listeners first so a callback may take the
        // registry lock itself.
        let live: Vec<Arc<Mutex<dyn MemoryListener>>> = {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.retain(|(_, weak)| weak.strong_count() > 0);
            listeners
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for listener in live {
            f(&mut *listener.lock().unwrap());
        }
    }

    /// Dispatch a section addition to every live listener.
    pub fn region_add(&self, section: &MemorySection) {
        self.for_each(|listener| listener.region_add(section));
    }

    /// Dispatch a section removal to every live listener.
    pub fn region_del(&self, section: &MemorySection) {
        self.for_each(|listener| listener.region_del(section));
    }

    /// Dispatch an untouched-section notification to every live listener.
    pub fn region_nop(&self, section: &MemorySection) {
        self.for_each(|listener| listener.region_nop(section));
    }

    /// Dispatch a dirty log flush request to every live listener.
    pub fn log_sync(&self, section: &MemorySection) {
        self.for_each(|listener| listener.log_sync(section));
    }

    /// Dispatch a per-section logging start to every live listener.
    pub fn log_start(&self, section: &MemorySection) {
        self.for_each(|listener| listener.log_start(section));
    }

    /// Dispatch a per-section logging stop to every live listener.
    pub fn log_stop(&self, section: &MemorySection) {
        self.for_each(|listener| listener.log_stop(section));
    }

    /// Dispatch a global logging start to every live listener.
    pub fn log_global_start(&self) {
        self.for_each(|listener| listener.log_global_start());
    }

    /// Dispatch a global logging stop to every live listener.
    pub fn log_global_stop(&self) {
        self.for_each(|listener| listener.log_global_stop());
    }

    /// Dispatch an ioeventfd binding to every live listener.
    pub fn eventfd_add(&self, section: &MemorySection, match_data: bool, data: u64, fd: RawFd) {
        self.for_each(|listener| listener.eventfd_add(section, match_data, data, fd));
    }

    /// Dispatch an ioeventfd unbinding to every live listener.
    pub fn eventfd_del(&self, section: &MemorySection, match_data: bool, data: u64, fd: RawFd) {
        self.for_each(|listener| listener.eventfd_del(section, match_data, data, fd));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// RAM backed region recording `mark_dirty` calls.
    pub(crate) struct MockRegion {
        pub(crate) ram: bool,
        pub(crate) logging: bool,
        pub(crate) host_base: u64,
        pub(crate) dirty: Mutex<Vec<(u64, u64)>>,
    }

    impl MockRegion {
        pub(crate) fn new(host_base: u64) -> Self {
            MockRegion {
                ram: true,
                logging: false,
                host_base,
                dirty: Mutex::new(Vec::new()),
            }
        }
    }

    impl GuestRegion for MockRegion {
        fn is_ram(&self) -> bool {
            self.ram
        }

        fn is_logging(&self) -> bool {
            self.logging
        }

        fn ram_host_addr(&self) -> u64 {
            self.host_base
        }

        fn mark_dirty(&self, offset: u64, len: u64) {
            self.dirty.lock().unwrap().push((offset, len));
        }
    }

    /// Build a system RAM section over `[gpa, gpa + size)` backed by `region`.
    pub(crate) fn ram_section(region: &Arc<MockRegion>, gpa: u64, size: u64) -> MemorySection {
        MemorySection {
            address_space: AddressSpaceKind::SystemMemory,
            region: region.clone(),
            offset_within_address_space: GuestAddress(gpa),
            offset_within_region: 0,
            size,
        }
    }

    #[derive(Default)]
    struct CountingListener {
        adds: usize,
        dels: usize,
        syncs: usize,
        globals: usize,
    }

    impl MemoryListener for CountingListener {
        fn region_add(&mut self, _section: &MemorySection) {
            self.adds += 1;
        }

        fn region_del(&mut self, _section: &MemorySection) {
            self.dels += 1;
        }

        fn log_sync(&mut self, _section: &MemorySection) {
            self.syncs += 1;
        }

        fn log_global_start(&mut self) {
            self.globals += 1;
        }
    }

    #[test]
    fn test_section_filter() {
        let region = Arc::new(MockRegion::new(0x1000));
        let section = ram_section(&region, 0, 0x1000);
        assert!(section.is_system_ram());

        let mut io_section = section.clone();
        io_section.address_space = AddressSpaceKind::SystemIo;
        assert!(!io_section.is_system_ram());

        let mmio = Arc::new(MockRegion {
            ram: false,
            ..MockRegion::new(0)
        });
        let mmio_section = ram_section(&mmio, 0, 0x1000);
        assert!(!mmio_section.is_system_ram());
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = ListenerRegistry::new();
        let first = Arc::new(Mutex::new(CountingListener::default()));
        let second = Arc::new(Mutex::new(CountingListener::default()));
        let first_id = registry.register(first.clone());
        let _second_id = registry.register(second.clone());
        assert_eq!(registry.len(), 2);

        let region = Arc::new(MockRegion::new(0x1000));
        let section = ram_section(&region, 0, 0x1000);
        registry.region_add(&section);
        registry.log_sync(&section);
        registry.log_global_start();

        registry.unregister(first_id);
        registry.region_del(&section);
        assert_eq!(registry.len(), 1);

        let first = first.lock().unwrap();
        assert_eq!((first.adds, first.dels, first.syncs, first.globals), (1, 0, 1, 1));
        let second = second.lock().unwrap();
        assert_eq!((second.adds, second.dels, second.syncs, second.globals), (1, 1, 1, 1));
    }

    #[test]
    fn test_registry_prunes_dropped_listeners() {
        let registry = ListenerRegistry::new();
        let listener: Arc<Mutex<dyn MemoryListener>> =
            Arc::new(Mutex::new(CountingListener::default()));
        registry.register(listener.clone());
        assert_eq!(registry.len(), 1);

        drop(listener);
        registry.log_global_stop();
        assert_eq!(registry.len(), 0);
    }
}
