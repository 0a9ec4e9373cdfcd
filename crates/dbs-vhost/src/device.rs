// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of a vhost accelerated virtio device.
//!
//! A [`VhostDevice`] couples one emulated virtio device to one accelerator
//! instance. From `init` to `cleanup` it listens to memory topology updates
//! and mirrors them into the accelerator's region table; between `start` and
//! `stop` it additionally keeps the virtqueue ring mappings honest and, when
//! migration turns dirty logging on, sizes and drains the shared dirty log.
//!
//! Every compound operation acquires in a fixed order and unwinds already
//! acquired pieces in reverse on failure, so a device is never left half
//! configured.

use std::sync::{Arc, Mutex};

use log::{debug, error};
use vm_memory::Address;

use crate::backend::{VhostBackend, VHOST_F_LOG_ALL};
use crate::dirty_log::{DirtyLog, LOG_BUFFER_CHUNKS, LOG_CHUNK_SIZE};
use crate::listener::{ListenerId, ListenerRegistry, MemoryListener, MemorySection};
use crate::mapping::GuestAddressMapper;
use crate::memory::VhostMemoryTable;
use crate::queue::{VhostVirtqueue, VirtioQueueAccess};
use crate::range::{range_last, ranges_overlap};
use crate::{Result, VhostError};

/// Host and guest notifier control exposed by the virtio transport binding.
pub trait DeviceBinding {
    /// True when the binding can reroute guest kicks to an eventfd.
    fn supports_host_notifiers(&self) -> bool;

    /// Route the kick of queue `idx` to (or away from) its eventfd.
    fn set_host_notifier(&mut self, idx: usize, enabled: bool) -> std::io::Result<()>;

    /// True when the binding can inject guest interrupts through eventfds.
    fn supports_guest_notifiers(&self) -> bool;

    /// Bind or unbind the guest interrupt eventfds.
    fn set_guest_notifiers(&mut self, enabled: bool) -> std::io::Result<()>;

    /// Whether guest notifiers are usable; `None` when the binding cannot
    /// tell.
    fn query_guest_notifiers(&self) -> Option<bool>;
}

/// A virtio device whose fast path runs in a vhost accelerator.
pub struct VhostDevice {
    control: Option<Box<dyn VhostBackend>>,
    mapper: Arc<dyn GuestAddressMapper>,
    registry: Arc<ListenerRegistry>,
    listener_id: Option<ListenerId>,
    features: u64,
    acked_features: u64,
    vqs: Vec<VhostVirtqueue>,
    mem: VhostMemoryTable,
    sections: Vec<MemorySection>,
    log: Option<DirtyLog>,
    log_enabled: bool,
    started: bool,
    force: bool,
}

impl VhostDevice {
    /// Take ownership of an accelerator instance and register for memory
    /// topology updates.
    ///
    /// `nvqs` fixes the number of virtqueues handed to the accelerator.
    /// `force` makes [`VhostDevice::query`] claim the device even when the
    /// binding cannot report guest notifier support. On error the control
    /// channel is closed again.
    pub fn init(
        control: Box<dyn VhostBackend>,
        mapper: Arc<dyn GuestAddressMapper>,
        registry: Arc<ListenerRegistry>,
        nvqs: usize,
        force: bool,
    ) -> Result<Arc<Mutex<VhostDevice>>> {
        control.set_owner()?;
        let features = control.get_features()?;

        let device = Arc::new(Mutex::new(VhostDevice {
            control: Some(control),
            mapper,
            registry: registry.clone(),
            listener_id: None,
            features,
            acked_features: 0,
            vqs: (0..nvqs).map(|_| VhostVirtqueue::default()).collect(),
            mem: VhostMemoryTable::new(),
            sections: Vec::new(),
            log: None,
            log_enabled: false,
            started: false,
            force,
        }));
        let id = registry.register(device.clone());
        device.lock().unwrap().listener_id = Some(id);
        Ok(device)
    }

    /// Deregister from topology updates, drop the region table and the
    /// section cache and close the control channel.
    pub fn cleanup(&mut self) {
        if let Some(id) = self.listener_id.take() {
            self.registry.unregister(id);
        }
        self.mem = VhostMemoryTable::new();
        self.sections.clear();
        self.control = None;
    }

    /// Features offered by the accelerator.
    pub fn features(&self) -> u64 {
        self.features
    }

    /// Features acknowledged towards the accelerator.
    pub fn acked_features(&self) -> u64 {
        self.acked_features
    }

    /// Record the feature set negotiated with the guest.
    pub fn set_acked_features(&mut self, features: u64) {
        self.acked_features = features;
    }

    /// Whether the accelerator can service the device behind `binding`.
    pub fn query<B: DeviceBinding>(&self, binding: &B) -> bool {
        binding.query_guest_notifiers().unwrap_or(true) || self.force
    }

    fn control(&self) -> &dyn VhostBackend {
        self.control
            .as_deref()
            .expect("vhost control channel is closed")
    }

    /// Stop servicing guest kicks in the VMM and let the eventfds feed the
    /// accelerator instead.
    pub fn enable_notifiers<B: DeviceBinding>(&mut self, binding: &mut B) -> Result<()> {
        if !binding.supports_host_notifiers() {
            error!(target: "vhost", "device binding does not support host notifiers");
            return Err(VhostError::NotSupported("host notifiers"));
        }
        for idx in 0..self.vqs.len() {
            if let Err(e) = binding.set_host_notifier(idx, true) {
                error!(target: "vhost", "binding host notifier for queue {} failed: {}", idx, e);
                for fixup in (0..idx).rev() {
                    binding.set_host_notifier(fixup, false).unwrap_or_else(|e| {
                        panic!("host notifier rollback failed for queue {}: {}", fixup, e)
                    });
                }
                return Err(VhostError::HostNotifier(idx, e));
            }
        }
        Ok(())
    }

    /// Hand guest kicks back to the VMM.
    ///
    /// The emulated queue handlers may run before this returns, so the
    /// emulated device must be completely set up when called. Failures are
    /// logged per queue and never fatal.
    pub fn disable_notifiers<B: DeviceBinding>(&mut self, binding: &mut B) {
        for idx in 0..self.vqs.len() {
            if let Err(e) = binding.set_host_notifier(idx, false) {
                error!(target: "vhost", "unbinding host notifier for queue {} failed: {}", idx, e);
            }
        }
    }

    /// Hand the device to the accelerator. Host notifiers must already be
    /// enabled.
    pub fn start<D>(&mut self, vdev: &mut D) -> Result<()>
    where
        D: VirtioQueueAccess + DeviceBinding,
    {
        if !vdev.supports_guest_notifiers() {
            error!(target: "vhost", "device binding does not support guest notifiers");
            return Err(VhostError::NotSupported("guest notifiers"));
        }
        vdev.set_guest_notifiers(true).map_err(|e| {
            error!(target: "vhost", "binding guest notifiers failed: {}", e);
            VhostError::GuestNotifier(e)
        })?;

        let published = self
            .set_features_to_backend(self.log_enabled)
            .and_then(|_| self.control().set_mem_table(self.mem.regions()));
        if let Err(e) = published {
            let _ = vdev.set_guest_notifiers(false);
            return Err(e);
        }

        let log_enabled = self.log_enabled;
        for idx in 0..self.vqs.len() {
            let control = self
                .control
                .as_deref()
                .expect("vhost control channel is closed");
            if let Err(e) = self.vqs[idx].setup(control, self.mapper.as_ref(), vdev, idx, log_enabled)
            {
                for fixup in (0..idx).rev() {
                    self.virtqueue_release(vdev, fixup);
                }
                let _ = vdev.set_guest_notifiers(false);
                return Err(e);
            }
        }

        if self.log_enabled {
            let size = self.get_log_size();
            self.log = if size != 0 { Some(DirtyLog::new(size)) } else { None };
            if let Err(e) = self.control().set_log_base(self.log_base()) {
                self.log = None;
                for fixup in (0..self.vqs.len()).rev() {
                    self.virtqueue_release(vdev, fixup);
                }
                let _ = vdev.set_guest_notifiers(false);
                return Err(e);
            }
        }

        self.started = true;
        debug!(target: "vhost", "device started with {} queues", self.vqs.len());
        Ok(())
    }

    /// Take the device back from the accelerator. Host notifiers must still
    /// be enabled.
    pub fn stop<D>(&mut self, vdev: &mut D)
    where
        D: VirtioQueueAccess + DeviceBinding,
    {
        for idx in 0..self.vqs.len() {
            self.virtqueue_release(vdev, idx);
        }
        // Flush every dirty bit the accelerator reported before the log goes
        // away. The queue windows survive the ring unmaps above.
        for section in &self.sections {
            self.sync_dirty_bitmap(section, 0, u64::MAX);
        }
        vdev.set_guest_notifiers(false)
            .unwrap_or_else(|e| panic!("unbinding guest notifiers failed: {}", e));
        self.started = false;
        self.log = None;
        debug!(target: "vhost", "device stopped");
    }

    fn virtqueue_release<D: VirtioQueueAccess>(&mut self, vdev: &mut D, idx: usize) {
        let control = self
            .control
            .as_deref()
            .expect("vhost control channel is closed");
        self.vqs[idx].release(control, self.mapper.as_ref(), vdev, idx);
    }

    fn set_features_to_backend(&self, enable_log: bool) -> Result<()> {
        let mut features = self.acked_features;
        if enable_log {
            features |= 1u64 << VHOST_F_LOG_ALL;
        }
        self.control().set_features(features)
    }

    /// Switch write logging on or off for the whole device: the feature bit
    /// first, then every queue. A queue failure walks the earlier queues
    /// back to the previous state and restores the features.
    fn set_log(&self, enable: bool) -> Result<()> {
        self.set_features_to_backend(enable)?;
        for idx in 0..self.vqs.len() {
            if let Err(e) = self.vqs[idx].set_addr(self.control(), idx, enable) {
                for fixup in (0..=idx).rev() {
                    self.vqs[fixup]
                        .set_addr(self.control(), fixup, self.log_enabled)
                        .unwrap_or_else(|e| {
                            panic!("restoring vring {} log state failed: {}", fixup, e)
                        });
                }
                self.set_features_to_backend(self.log_enabled)
                    .unwrap_or_else(|e| panic!("restoring features failed: {}", e));
                return Err(e);
            }
        }
        Ok(())
    }

    fn migration_log(&mut self, enable: bool) -> Result<()> {
        if enable == self.log_enabled {
            return Ok(());
        }
        if !self.started {
            self.log_enabled = enable;
            return Ok(());
        }
        if enable {
            self.log_resize(self.get_log_size())?;
            self.set_log(true)?;
        } else {
            self.set_log(false)?;
            self.log = None;
        }
        self.log_enabled = enable;
        debug!(target: "vhost", "dirty logging {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Number of log words needed to cover every table region and every
    /// used ring.
    fn get_log_size(&self) -> u64 {
        let mut log_size = 0;
        for region in self.mem.regions() {
            let last = range_last(region.guest_phys_addr, region.memory_size);
            log_size = log_size.max(last / LOG_CHUNK_SIZE + 1);
        }
        for vq in &self.vqs {
            if vq.used_size != 0 {
                let last = range_last(vq.used_phys, vq.used_size);
                log_size = log_size.max(last / LOG_CHUNK_SIZE + 1);
            }
        }
        log_size
    }

    fn log_base(&self) -> u64 {
        self.log.as_ref().map_or(0, |log| log.base_addr())
    }

    fn log_words(&self) -> u64 {
        self.log.as_ref().map_or(0, |log| log.len())
    }

    /// Swap in a log of `size` words without losing dirty bits.
    ///
    /// The new base reaches the accelerator before the old buffer is drained
    /// and dropped, so no write can land past the end of either buffer.
    fn log_resize(&mut self, size: u64) -> Result<()> {
        let new_log = if size != 0 { Some(DirtyLog::new(size)) } else { None };
        let base = new_log.as_ref().map_or(0, |log| log.base_addr());
        self.control().set_log_base(base)?;
        let old_span = self.log_words() * LOG_CHUNK_SIZE;
        if old_span != 0 {
            for section in &self.sections {
                self.sync_dirty_bitmap(section, 0, old_span - 1);
            }
        }
        self.log = new_log;
        Ok(())
    }

    /// Drain the dirty log into `section` for every tracked range that
    /// overlaps `[mfirst, mlast]`.
    fn sync_dirty_bitmap(&self, section: &MemorySection, mfirst: u64, mlast: u64) {
        if !self.log_enabled || !self.started {
            return;
        }
        let log = match self.log.as_ref() {
            Some(log) => log,
            None => return,
        };
        for region in self.mem.regions() {
            log.sync_range(
                section,
                mfirst,
                mlast,
                region.guest_phys_addr,
                range_last(region.guest_phys_addr, region.memory_size),
            );
        }
        for vq in &self.vqs {
            if vq.used_size != 0 {
                log.sync_range(
                    section,
                    mfirst,
                    mlast,
                    vq.used_phys,
                    range_last(vq.used_phys, vq.used_size),
                );
            }
        }
    }

    /// Re-map every ring overlapping the changed range and check it still
    /// lives at the recorded host address.
    fn verify_ring_mappings(&self, start_addr: u64, size: u64) -> Result<()> {
        for (idx, vq) in self.vqs.iter().enumerate() {
            if !ranges_overlap(start_addr, size, vq.ring_phys, vq.ring_size) {
                continue;
            }
            let current = match vq.ring.as_ref() {
                Some(mapping) => mapping,
                None => continue,
            };
            let mapping = match self.mapper.map(
                vm_memory::GuestAddress(vq.ring_phys),
                vq.ring_size,
                true,
            ) {
                Some(mapping) => mapping,
                None => {
                    error!(target: "vhost", "unable to map ring buffer for ring {}", idx);
                    return Err(VhostError::NoMemory(vq.ring_phys, vq.ring_size));
                }
            };
            if mapping.len() != vq.ring_size {
                self.mapper.unmap(mapping, false, 0);
                error!(target: "vhost", "unable to map ring buffer for ring {}", idx);
                return Err(VhostError::NoMemory(vq.ring_phys, vq.ring_size));
            }
            let relocated = mapping.host_addr() != current.host_addr();
            self.mapper.unmap(mapping, false, 0);
            if relocated {
                error!(target: "vhost", "ring buffer relocated for ring {}", idx);
                return Err(VhostError::RingRelocated(idx));
            }
        }
        Ok(())
    }

    /// Mirror one section change into the region table and, while running,
    /// into the accelerator.
    fn set_memory(&mut self, section: &MemorySection, add: bool) -> Result<()> {
        let start_addr = section.offset_within_address_space.raw_value();
        let size = section.size;
        assert!(size != 0);
        // A section that another client is still dirty tracking must stay
        // invisible to the accelerator.
        let log_dirty = section.region.is_logging();
        let add = if log_dirty { false } else { add };

        let uaddr = section.region.ram_host_addr() + section.offset_within_region;
        if add {
            if !self.mem.needs_update(start_addr, size, uaddr) {
                // The same mapping is already published.
                return Ok(());
            }
        } else if self.mem.find_region(start_addr, size).is_none() {
            // Removing a range the accelerator never saw.
            return Ok(());
        }

        self.mem.unassign(start_addr, size);
        if add {
            self.mem.assign(start_addr, size, uaddr);
        } else {
            self.mem.unassign(start_addr, size);
        }
        debug!(target: "vhost", "memory table now holds {} regions", self.mem.nregions());

        if !self.started {
            return Ok(());
        }
        self.verify_ring_mappings(start_addr, size)?;

        if !self.log_enabled {
            return self.control().set_mem_table(self.mem.regions());
        }
        let log_size = self.get_log_size();
        // To log more, the log must grow before the table update; to log
        // less, it may only shrink afterwards.
        if self.log_words() < log_size {
            self.log_resize(log_size + LOG_BUFFER_CHUNKS)?;
        }
        self.control().set_mem_table(self.mem.regions())?;
        if self.log_words() > log_size + LOG_BUFFER_CHUNKS {
            self.log_resize(log_size)?;
        }
        Ok(())
    }
}

impl MemoryListener for VhostDevice {
    fn region_add(&mut self, section: &MemorySection) {
        if !section.is_system_ram() {
            return;
        }
        self.sections.push(section.clone());
        if let Err(e) = self.set_memory(section, true) {
            panic!("publishing added memory section failed: {}", e);
        }
    }

    fn region_del(&mut self, section: &MemorySection) {
        if !section.is_system_ram() {
            return;
        }
        if let Err(e) = self.set_memory(section, false) {
            panic!("retiring removed memory section failed: {}", e);
        }
        let gone = section.offset_within_address_space;
        if let Some(pos) = self
            .sections
            .iter()
            .position(|s| s.offset_within_address_space == gone)
        {
            self.sections.remove(pos);
        }
    }

    fn log_sync(&mut self, section: &MemorySection) {
        if !section.is_system_ram() {
            return;
        }
        let start = section.offset_within_address_space.raw_value();
        self.sync_dirty_bitmap(section, start, start + section.size);
    }

    // Per-section logging is not wired up; migration only uses the global
    // events below.
    fn log_start(&mut self, _section: &MemorySection) {}

    fn log_stop(&mut self, _section: &MemorySection) {}

    fn log_global_start(&mut self) {
        if let Err(e) = self.migration_log(true) {
            panic!("enabling dirty logging failed: {}", e);
        }
    }

    fn log_global_stop(&mut self) {
        if let Err(e) = self.migration_log(false) {
            panic!("disabling dirty logging failed: {}", e);
        }
    }
}

impl Drop for VhostDevice {
    fn drop(&mut self) {
        self.cleanup();
    }
}
