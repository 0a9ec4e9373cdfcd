// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interface to the vhost accelerator control channel.
//!
//! All device state reaches the accelerator through this channel: the owner
//! claim, feature negotiation, the guest memory table, the dirty log base
//! and the per queue ring setup. The kernel implementation lives in
//! [`crate::kern`]; tests drive the device against a recording mock.

use std::os::unix::io::RawFd;

use crate::memory::VhostMemoryRegion;
use crate::Result;

/// Feature bit: the accelerator logs every guest write to the dirty log.
pub const VHOST_F_LOG_ALL: u32 = 26;
/// Vring flag bit: used ring writes of the queue are logged.
pub const VHOST_VRING_F_LOG: u32 = 0;

/// Addresses of one virtqueue as published to the accelerator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VringConfigData {
    /// Vring flag bitmask; `1 << VHOST_VRING_F_LOG` enables used ring write
    /// logging for the queue.
    pub flags: u32,
    /// Host virtual address of the descriptor table.
    pub desc_table_addr: u64,
    /// Host virtual address of the used ring.
    pub used_ring_addr: u64,
    /// Host virtual address of the available ring.
    pub avail_ring_addr: u64,
    /// Guest physical address the accelerator logs used ring writes under.
    pub log_guest_addr: u64,
}

/// Operations of the vhost accelerator control channel.
///
/// Every call is synchronous: it returns once the kernel has applied the
/// update or rejected it with an errno.
pub trait VhostBackend: Send {
    /// Claim ownership of the accelerator instance for this process.
    ///
    /// Must be issued before any other call on the channel.
    fn set_owner(&self) -> Result<()>;

    /// Read the feature bitmask offered by the accelerator.
    fn get_features(&self) -> Result<u64>;

    /// Publish the negotiated feature bitmask.
    fn set_features(&self, features: u64) -> Result<()>;

    /// Replace the accelerator's guest memory table.
    fn set_mem_table(&self, regions: &[VhostMemoryRegion]) -> Result<()>;

    /// Publish the dirty log base address, 0 when no log exists.
    fn set_log_base(&self, base: u64) -> Result<()>;

    /// Publish the element count of queue `queue_index`.
    fn set_vring_num(&self, queue_index: usize, num: u16) -> Result<()>;

    /// Seed the next available index of queue `queue_index`.
    fn set_vring_base(&self, queue_index: usize, base: u16) -> Result<()>;

    /// Read back the next available index of queue `queue_index`.
    fn get_vring_base(&self, queue_index: usize) -> Result<u32>;

    /// Publish the ring addresses of queue `queue_index`.
    fn set_vring_addr(&self, queue_index: usize, config: &VringConfigData) -> Result<()>;

    /// Bind the eventfd the guest kicks to notify queue `queue_index`.
    fn set_vring_kick(&self, queue_index: usize, fd: RawFd) -> Result<()>;

    /// Bind the eventfd the accelerator signals to interrupt the guest for
    /// queue `queue_index`.
    fn set_vring_call(&self, queue_index: usize, fd: RawFd) -> Result<()>;
}
