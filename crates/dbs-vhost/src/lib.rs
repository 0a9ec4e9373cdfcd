// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Control plane for virtio devices accelerated by an in-kernel vhost backend.
//!
//! Vhost moves the virtio fast path out of the VMM: the kernel reads the
//! descriptor rings and signals completions directly, while the VMM keeps
//! every slow path responsibility. This crate implements that slow path. It
//! maintains the accelerator's table of guest physical to user virtual
//! mappings across memory topology changes, manages the shared dirty page
//! bitmap used for live migration, maps the virtqueue rings into host memory
//! and publishes their addresses and eventfds, and drives the start/stop
//! protocol of the device with strict unwind on partial failure.
//!
//! The crate talks to three collaborators it does not implement: the vhost
//! control channel (abstracted by [`VhostBackend`], with the kernel ioctl
//! implementation in [`VhostKernBackend`]), the address space framework that
//! pushes memory topology notifications (the [`MemoryListener`] contract),
//! and the emulated virtio device that owns queue geometry and notifier
//! eventfds ([`VirtioQueueAccess`] and [`DeviceBinding`]).

#[macro_use]
extern crate vmm_sys_util;

use std::io;

mod range;

pub mod backend;
pub mod device;
pub mod dirty_log;
pub mod kern;
pub mod listener;
pub mod mapping;
pub mod memory;
pub mod queue;

pub use self::backend::{VhostBackend, VringConfigData, VHOST_F_LOG_ALL, VHOST_VRING_F_LOG};
pub use self::device::{DeviceBinding, VhostDevice};
pub use self::dirty_log::{DirtyLog, LOG_CHUNK_SIZE, LOG_PAGE_SIZE};
pub use self::kern::VhostKernBackend;
pub use self::listener::{
    AddressSpaceKind, GuestRegion, ListenerId, ListenerRegistry, MemoryListener, MemorySection,
};
pub use self::mapping::{GuestAddressMapper, HostMapping};
pub use self::memory::{VhostMemoryRegion, VhostMemoryTable};
pub use self::queue::VirtioQueueAccess;

/// Errors of the vhost control plane.
#[derive(Debug, thiserror::Error)]
pub enum VhostError {
    /// The virtio device binding lacks a capability vhost depends on.
    #[error("device binding does not support {0}")]
    NotSupported(&'static str),
    /// An ioctl on the vhost control channel failed.
    #[error("vhost ioctl failed: {0}")]
    IoctlError(#[source] io::Error),
    /// Toggling a host notifier on the device binding failed.
    #[error("host notifier operation failed for queue {0}: {1}")]
    HostNotifier(usize, #[source] io::Error),
    /// Toggling the guest notifiers on the device binding failed.
    #[error("guest notifier operation failed: {0}")]
    GuestNotifier(#[source] io::Error),
    /// A guest physical range could not be mapped at its full length.
    #[error("cannot map guest memory range (0x{0:x}, 0x{1:x})")]
    NoMemory(u64, u64),
    /// Ring pages of a running queue moved to another host address.
    #[error("ring buffer for queue {0} relocated by a memory layout change")]
    RingRelocated(usize),
}

/// Specialized version of [`std::result::Result`] for vhost operations.
pub type Result<T> = std::result::Result<T, VhostError>;
