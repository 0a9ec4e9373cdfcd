// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Binder publishing one emulated virtqueue to the accelerator.
//!
//! For every queue the accelerator takes over, the binder maps the four ring
//! areas into host memory, publishes their addresses, seeds the available
//! index and wires the kick and call eventfds. Teardown reads the queue
//! state back into the emulated device and marks the device writable ring
//! pages dirty before the mappings go away, so writes that raced with the
//! shutdown survive for migration.

use std::os::unix::io::RawFd;

use vm_memory::{Address, GuestAddress};

use crate::backend::{VhostBackend, VringConfigData, VHOST_VRING_F_LOG};
use crate::mapping::{map_exact, GuestAddressMapper, HostMapping};
use crate::Result;

/// Geometry and notifier descriptors of the emulated virtio queues.
///
/// Implemented by the virtio transport that owns the queues handed to the
/// accelerator. All addresses are guest physical; all sizes are in bytes.
pub trait VirtioQueueAccess {
    /// Element count of queue `idx`.
    fn queue_num(&self, idx: usize) -> u16;

    /// Guest address of the descriptor table of queue `idx`.
    fn desc_addr(&self, idx: usize) -> GuestAddress;

    /// Size of the descriptor table of queue `idx`.
    fn desc_size(&self, idx: usize) -> u64;

    /// Guest address of the available ring of queue `idx`.
    fn avail_addr(&self, idx: usize) -> GuestAddress;

    /// Size of the available ring of queue `idx`.
    fn avail_size(&self, idx: usize) -> u64;

    /// Guest address of the used ring of queue `idx`.
    fn used_addr(&self, idx: usize) -> GuestAddress;

    /// Size of the used ring of queue `idx`.
    fn used_size(&self, idx: usize) -> u64;

    /// Guest address of the whole ring area of queue `idx`.
    fn ring_addr(&self, idx: usize) -> GuestAddress;

    /// Size of the whole ring area of queue `idx`.
    fn ring_size(&self, idx: usize) -> u64;

    /// Next available index the emulated queue would process.
    fn last_avail_idx(&self, idx: usize) -> u16;

    /// Restore the next available index read back from the accelerator.
    fn set_last_avail_idx(&mut self, idx: usize, num: u16);

    /// Eventfd the guest kicks to notify queue `idx`.
    fn host_notifier_fd(&self, idx: usize) -> RawFd;

    /// Eventfd used to interrupt the guest for queue `idx`.
    fn guest_notifier_fd(&self, idx: usize) -> RawFd;
}

/// Accelerator side state of one virtqueue.
#[derive(Debug, Default)]
pub(crate) struct VhostVirtqueue {
    pub(crate) num: u16,
    pub(crate) desc: Option<HostMapping>,
    pub(crate) avail: Option<HostMapping>,
    pub(crate) used: Option<HostMapping>,
    pub(crate) ring: Option<HostMapping>,
    pub(crate) used_phys: u64,
    pub(crate) used_size: u64,
    pub(crate) ring_phys: u64,
    pub(crate) ring_size: u64,
}

impl VhostVirtqueue {
    /// Map the ring areas of queue `idx` and hand it to the accelerator.
    pub(crate) fn setup<D: VirtioQueueAccess>(
        &mut self,
        control: &dyn VhostBackend,
        mapper: &dyn GuestAddressMapper,
        vdev: &D,
        idx: usize,
        enable_log: bool,
    ) -> Result<()> {
        self.num = vdev.queue_num(idx);
        control.set_vring_num(idx, self.num)?;
        control.set_vring_base(idx, vdev.last_avail_idx(idx))?;

        if let Err(e) = self.map_rings(mapper, vdev, idx) {
            self.unwind_mappings(mapper);
            return Err(e);
        }

        let published = self
            .set_addr(control, idx, enable_log)
            .and_then(|_| control.set_vring_kick(idx, vdev.host_notifier_fd(idx)))
            .and_then(|_| control.set_vring_call(idx, vdev.guest_notifier_fd(idx)));
        if let Err(e) = published {
            self.unwind_mappings(mapper);
            return Err(e);
        }
        Ok(())
    }

    fn map_rings<D: VirtioQueueAccess>(
        &mut self,
        mapper: &dyn GuestAddressMapper,
        vdev: &D,
        idx: usize,
    ) -> Result<()> {
        self.desc = Some(map_exact(
            mapper,
            vdev.desc_addr(idx),
            vdev.desc_size(idx),
            false,
        )?);
        self.avail = Some(map_exact(
            mapper,
            vdev.avail_addr(idx),
            vdev.avail_size(idx),
            false,
        )?);
        self.used_size = vdev.used_size(idx);
        self.used_phys = vdev.used_addr(idx).raw_value();
        self.used = Some(map_exact(
            mapper,
            vdev.used_addr(idx),
            self.used_size,
            true,
        )?);
        self.ring_size = vdev.ring_size(idx);
        self.ring_phys = vdev.ring_addr(idx).raw_value();
        self.ring = Some(map_exact(
            mapper,
            vdev.ring_addr(idx),
            self.ring_size,
            true,
        )?);
        Ok(())
    }

    /// Publish the ring addresses of queue `idx`, toggling used ring write
    /// logging.
    pub(crate) fn set_addr(
        &self,
        control: &dyn VhostBackend,
        idx: usize,
        enable_log: bool,
    ) -> Result<()> {
        let config = VringConfigData {
            flags: if enable_log {
                1 << VHOST_VRING_F_LOG
            } else {
                0
            },
            desc_table_addr: Self::mapped_addr(&self.desc),
            used_ring_addr: Self::mapped_addr(&self.used),
            avail_ring_addr: Self::mapped_addr(&self.avail),
            log_guest_addr: self.used_phys,
        };
        control.set_vring_addr(idx, &config)
    }

    fn mapped_addr(mapping: &Option<HostMapping>) -> u64 {
        mapping.as_ref().expect("vring area is not mapped").host_addr()
    }

    /// Read the queue state of queue `idx` back and release the mappings.
    pub(crate) fn release<D: VirtioQueueAccess>(
        &mut self,
        control: &dyn VhostBackend,
        mapper: &dyn GuestAddressMapper,
        vdev: &mut D,
        idx: usize,
    ) {
        match control.get_vring_base(idx) {
            Ok(num) => vdev.set_last_avail_idx(idx, num as u16),
            Err(e) => panic!("vhost vring {} state restore failed: {}", idx, e),
        }
        // The device writable areas are marked dirty in full before the
        // mappings end.
        if let Some(mapping) = self.ring.take() {
            mapper.unmap(mapping, false, self.ring_size);
        }
        if let Some(mapping) = self.used.take() {
            mapper.unmap(mapping, true, self.used_size);
        }
        if let Some(mapping) = self.avail.take() {
            mapper.unmap(mapping, false, 0);
        }
        if let Some(mapping) = self.desc.take() {
            mapper.unmap(mapping, false, 0);
        }
    }

    fn unwind_mappings(&mut self, mapper: &dyn GuestAddressMapper) {
        if let Some(mapping) = self.ring.take() {
            mapper.unmap(mapping, false, 0);
        }
        if let Some(mapping) = self.used.take() {
            mapper.unmap(mapping, false, 0);
        }
        if let Some(mapping) = self.avail.take() {
            mapper.unmap(mapping, false, 0);
        }
        if let Some(mapping) = self.desc.take() {
            mapper.unmap(mapping, false, 0);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::backend::tests::{BackendOp, MockBackend};
    use crate::mapping::tests::MockMapper;

    pub(crate) const QUEUE_AREA_BASE: u64 = 0x8000;
    pub(crate) const QUEUE_AREA_STRIDE: u64 = 0x10000;
    pub(crate) const DESC_SIZE: u64 = 0x1000;
    pub(crate) const AVAIL_SIZE: u64 = 0x200;
    pub(crate) const USED_SIZE: u64 = 0x800;
    pub(crate) const RING_SIZE: u64 = 0x1800;

    /// Emulated device with a fixed queue layout.
    pub(crate) struct MockVirtioDevice {
        pub(crate) num: u16,
        pub(crate) last_avail: Vec<u16>,
        pub(crate) host_notifier_support: bool,
        pub(crate) guest_notifier_support: bool,
        pub(crate) guest_notifier_state: Option<bool>,
        pub(crate) host_notifier_ops: Vec<(usize, bool)>,
        pub(crate) guest_notifier_ops: Vec<bool>,
        pub(crate) fail_host_notifier_once: Option<usize>,
        pub(crate) fail_guest_notifiers: bool,
    }

    impl MockVirtioDevice {
        pub(crate) fn new(nvqs: usize) -> Self {
            MockVirtioDevice {
                num: 256,
                last_avail: vec![0; nvqs],
                host_notifier_support: true,
                guest_notifier_support: true,
                guest_notifier_state: None,
                host_notifier_ops: Vec::new(),
                guest_notifier_ops: Vec::new(),
                fail_host_notifier_once: None,
                fail_guest_notifiers: false,
            }
        }

        pub(crate) fn area(&self, idx: usize) -> u64 {
            QUEUE_AREA_BASE + idx as u64 * QUEUE_AREA_STRIDE
        }
    }

    impl VirtioQueueAccess for MockVirtioDevice {
        fn queue_num(&self, _idx: usize) -> u16 {
            self.num
        }

        fn desc_addr(&self, idx: usize) -> GuestAddress {
            GuestAddress(self.area(idx))
        }

        fn desc_size(&self, _idx: usize) -> u64 {
            DESC_SIZE
        }

        fn avail_addr(&self, idx: usize) -> GuestAddress {
            GuestAddress(self.area(idx) + 0x1000)
        }

        fn avail_size(&self, _idx: usize) -> u64 {
            AVAIL_SIZE
        }

        fn used_addr(&self, idx: usize) -> GuestAddress {
            GuestAddress(self.area(idx) + 0x2000)
        }

        fn used_size(&self, _idx: usize) -> u64 {
            USED_SIZE
        }

        fn ring_addr(&self, idx: usize) -> GuestAddress {
            GuestAddress(self.area(idx) + 0x1000)
        }

        fn ring_size(&self, _idx: usize) -> u64 {
            RING_SIZE
        }

        fn last_avail_idx(&self, idx: usize) -> u16 {
            self.last_avail[idx]
        }

        fn set_last_avail_idx(&mut self, idx: usize, num: u16) {
            self.last_avail[idx] = num;
        }

        fn host_notifier_fd(&self, idx: usize) -> RawFd {
            100 + idx as RawFd
        }

        fn guest_notifier_fd(&self, idx: usize) -> RawFd {
            200 + idx as RawFd
        }
    }

    #[test]
    fn test_setup_publishes_queue() {
        let control = MockBackend::default();
        let mapper = MockMapper::new(0x7000_0000);
        let mut vdev = MockVirtioDevice::new(1);
        vdev.last_avail[0] = 42;
        let mut vq = VhostVirtqueue::default();

        vq.setup(&control, &mapper, &vdev, 0, false).unwrap();

        assert_eq!(vq.num, 256);
        assert_eq!(vq.used_phys, 0xA000);
        assert_eq!(vq.used_size, USED_SIZE);
        assert_eq!(vq.ring_phys, 0x9000);
        assert_eq!(vq.ring_size, RING_SIZE);
        assert_eq!(
            control.ops(),
            vec![
                BackendOp::SetVringNum(0, 256),
                BackendOp::SetVringBase(0, 42),
                BackendOp::SetVringAddr {
                    index: 0,
                    flags: 0,
                    log_guest_addr: 0xA000,
                },
                BackendOp::SetVringKick(0, 100),
                BackendOp::SetVringCall(0, 200),
            ]
        );
        assert!(mapper.unmaps.lock().unwrap().is_empty());
    }

    #[test]
    fn test_setup_logs_used_ring_when_enabled() {
        let control = MockBackend::default();
        let mapper = MockMapper::new(0x7000_0000);
        let vdev = MockVirtioDevice::new(1);
        let mut vq = VhostVirtqueue::default();

        vq.setup(&control, &mapper, &vdev, 0, true).unwrap();

        assert_eq!(
            control.count(|op| matches!(
                op,
                BackendOp::SetVringAddr { flags: 1, .. }
            )),
            1
        );
    }

    #[test]
    fn test_setup_short_map_fails_with_no_memory() {
        let control = MockBackend::default();
        let mapper = MockMapper::new(0x7000_0000);
        mapper.short_by.store(0x10, Ordering::Relaxed);
        let vdev = MockVirtioDevice::new(1);
        let mut vq = VhostVirtqueue::default();

        assert!(matches!(
            vq.setup(&control, &mapper, &vdev, 0, false),
            Err(crate::VhostError::NoMemory(QUEUE_AREA_BASE, DESC_SIZE))
        ));
        assert!(vq.desc.is_none());
        // Only the partial descriptor mapping had to be released.
        assert_eq!(mapper.unmaps.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_setup_unwinds_mappings_on_ioctl_failure() {
        let control = MockBackend::default();
        control.state.lock().unwrap().fail_vring_kick_once = Some(0);
        let mapper = MockMapper::new(0x7000_0000);
        let vdev = MockVirtioDevice::new(1);
        let mut vq = VhostVirtqueue::default();

        assert!(vq.setup(&control, &mapper, &vdev, 0, false).is_err());

        let unmaps = mapper.unmaps.lock().unwrap();
        // Reverse mapping order, nothing marked dirty.
        assert_eq!(
            unmaps.as_slice(),
            &[
                (0x7000_9000, RING_SIZE, false, 0),
                (0x7000_A000, USED_SIZE, false, 0),
                (0x7000_9000, AVAIL_SIZE, false, 0),
                (0x7000_8000, DESC_SIZE, false, 0),
            ]
        );
        assert!(vq.ring.is_none());
        assert!(vq.desc.is_none());
    }

    #[test]
    fn test_release_restores_queue_state_and_dirties_rings() {
        let control = MockBackend::default();
        let mapper = MockMapper::new(0x7000_0000);
        let mut vdev = MockVirtioDevice::new(1);
        vdev.last_avail[0] = 42;
        let mut vq = VhostVirtqueue::default();
        vq.setup(&control, &mapper, &vdev, 0, false).unwrap();

        vdev.last_avail[0] = 0;
        vq.release(&control, &mapper, &mut vdev, 0);

        assert_eq!(vdev.last_avail[0], 42);
        let unmaps = mapper.unmaps.lock().unwrap();
        assert_eq!(
            unmaps.as_slice(),
            &[
                (0x7000_9000, RING_SIZE, false, RING_SIZE),
                (0x7000_A000, USED_SIZE, true, USED_SIZE),
                (0x7000_9000, AVAIL_SIZE, false, 0),
                (0x7000_8000, DESC_SIZE, false, 0),
            ]
        );
        // The guest physical window survives for the post-stop log drain.
        assert_eq!(vq.used_phys, 0xA000);
        assert_eq!(vq.used_size, USED_SIZE);
    }
}
