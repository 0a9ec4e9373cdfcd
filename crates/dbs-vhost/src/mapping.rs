// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the VMM primitive that pins guest physical memory into the
//! host address space.

use vm_memory::{Address, GuestAddress};

use crate::{Result, VhostError};

/// A pinned guest physical range in host virtual address space.
///
/// The handle is opaque except for the narrow conversion to the raw 64 bit
/// host address that the accelerator wire format requires.
#[derive(Debug)]
pub struct HostMapping {
    host_addr: u64,
    len: u64,
}

impl HostMapping {
    /// Wrap a mapped range starting at `host_addr` and spanning `len` bytes.
    pub fn new(host_addr: u64, len: u64) -> Self {
        HostMapping { host_addr, len }
    }

    /// Host virtual address of the first mapped byte.
    pub fn host_addr(&self) -> u64 {
        self.host_addr
    }

    /// Mapped length in bytes. May be shorter than requested.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when nothing was mapped.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Maps guest physical ranges into host virtual address space.
pub trait GuestAddressMapper: Send + Sync {
    /// Pin `[addr, addr + len)` into host memory.
    ///
    /// Returns `None` when the range is not mapped at all; the returned
    /// mapping may cover less than `len` bytes when the range straddles a
    /// region boundary.
    fn map(&self, addr: GuestAddress, len: u64, writable: bool) -> Option<HostMapping>;

    /// Release a mapping.
    ///
    /// `written` reports whether the mapping was written through and
    /// `dirty_len` the prefix to mark dirty before the pages go away.
    fn unmap(&self, mapping: HostMapping, written: bool, dirty_len: u64);
}

/// Map `[addr, addr + len)`, rejecting short maps.
pub(crate) fn map_exact(
    mapper: &dyn GuestAddressMapper,
    addr: GuestAddress,
    len: u64,
    writable: bool,
) -> Result<HostMapping> {
    let mapping = match mapper.map(addr, len, writable) {
        Some(mapping) => mapping,
        None => return Err(VhostError::NoMemory(addr.raw_value(), len)),
    };
    if mapping.len() != len {
        mapper.unmap(mapping, false, 0);
        return Err(VhostError::NoMemory(addr.raw_value(), len));
    }
    Ok(mapping)
}
