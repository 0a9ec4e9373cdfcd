// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Vhost control channel backed by the kernel ioctl interface.
//!
//! The ioctl numbers and payload layouts are the kernel vhost ABI from
//! `include/uapi/linux/vhost.h`.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::raw::c_int;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref};

use self::uapi::*;
use crate::backend::{VhostBackend, VringConfigData};
use crate::memory::VhostMemoryRegion;
use crate::{Result, VhostError};

/// Character device backing kernel vhost-net instances.
pub const VHOST_NET_PATH: &str = "/dev/vhost-net";

mod uapi {
    use super::{VhostMemoryHeader, VringAddr, VringFile, VringState};

    const VHOST: ::std::os::raw::c_uint = 0xAF;

    ioctl_ior_nr!(VHOST_GET_FEATURES, VHOST, 0x00, u64);
    ioctl_iow_nr!(VHOST_SET_FEATURES, VHOST, 0x00, u64);
    ioctl_io_nr!(VHOST_SET_OWNER, VHOST, 0x01);
    ioctl_iow_nr!(VHOST_SET_MEM_TABLE, VHOST, 0x03, VhostMemoryHeader);
    ioctl_iow_nr!(VHOST_SET_LOG_BASE, VHOST, 0x04, u64);
    ioctl_iow_nr!(VHOST_SET_VRING_NUM, VHOST, 0x10, VringState);
    ioctl_iow_nr!(VHOST_SET_VRING_ADDR, VHOST, 0x11, VringAddr);
    ioctl_iow_nr!(VHOST_SET_VRING_BASE, VHOST, 0x12, VringState);
    ioctl_iowr_nr!(VHOST_GET_VRING_BASE, VHOST, 0x12, VringState);
    ioctl_iow_nr!(VHOST_SET_VRING_KICK, VHOST, 0x20, VringFile);
    ioctl_iow_nr!(VHOST_SET_VRING_CALL, VHOST, 0x21, VringFile);
}

/// Header of the variable length SET_MEM_TABLE payload; `nregions` region
/// records follow it inline.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VhostMemoryHeader {
    nregions: u32,
    padding: u32,
}

/// Payload of the vring state ioctls.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VringState {
    index: u32,
    num: u32,
}

/// Payload of SET_VRING_ADDR.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VringAddr {
    index: u32,
    flags: u32,
    desc_user_addr: u64,
    used_user_addr: u64,
    avail_user_addr: u64,
    log_guest_addr: u64,
}

/// Payload of the vring eventfd ioctls.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VringFile {
    index: u32,
    fd: i32,
}

fn ioctl_result(rc: c_int) -> Result<()> {
    if rc < 0 {
        Err(VhostError::IoctlError(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

/// Control channel of one in-kernel vhost accelerator instance.
pub struct VhostKernBackend {
    control: File,
}

impl VhostKernBackend {
    /// Open the vhost character device at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(VhostError::IoctlError)?;
        Ok(VhostKernBackend { control })
    }

    /// Open the default vhost-net device.
    pub fn open_default() -> Result<Self> {
        Self::open(VHOST_NET_PATH)
    }
}

impl From<File> for VhostKernBackend {
    fn from(control: File) -> Self {
        VhostKernBackend { control }
    }
}

impl AsRawFd for VhostKernBackend {
    fn as_raw_fd(&self) -> RawFd {
        self.control.as_raw_fd()
    }
}

impl VhostBackend for VhostKernBackend {
    fn set_owner(&self) -> Result<()> {
        // SAFETY: VHOST_SET_OWNER carries no payload.
        ioctl_result(unsafe { ioctl(&self.control, VHOST_SET_OWNER()) })
    }

    fn get_features(&self) -> Result<u64> {
        let mut features: u64 = 0;
        // SAFETY: the kernel writes one u64 into the pointed-to value.
        let rc = unsafe { ioctl_with_mut_ref(&self.control, VHOST_GET_FEATURES(), &mut features) };
        ioctl_result(rc)?;
        Ok(features)
    }

    fn set_features(&self, features: u64) -> Result<()> {
        // SAFETY: the kernel only reads the pointed-to u64.
        ioctl_result(unsafe { ioctl_with_ref(&self.control, VHOST_SET_FEATURES(), &features) })
    }

    fn set_mem_table(&self, regions: &[VhostMemoryRegion]) -> Result<()> {
        let header_size = mem::size_of::<VhostMemoryHeader>();
        let payload_size = header_size + regions.len() * mem::size_of::<VhostMemoryRegion>();
        let mut payload: Vec<u64> = vec![0; (payload_size + 7) / 8];
        // SAFETY: payload is zero initialized, 8 byte aligned and sized for
        // the header plus the trailing region array.
        unsafe {
            let header = payload.as_mut_ptr() as *mut VhostMemoryHeader;
            (*header).nregions = regions.len() as u32;
            let array = (payload.as_mut_ptr() as *mut u8).add(header_size) as *mut VhostMemoryRegion;
            ptr::copy_nonoverlapping(regions.as_ptr(), array, regions.len());
        }
        // SAFETY: the kernel reads `nregions` records past the header, all
        // inside the payload allocation.
        let rc = unsafe { ioctl_with_ptr(&self.control, VHOST_SET_MEM_TABLE(), payload.as_ptr()) };
        ioctl_result(rc)
    }

    fn set_log_base(&self, base: u64) -> Result<()> {
        // SAFETY: the kernel only reads the pointed-to u64.
        ioctl_result(unsafe { ioctl_with_ref(&self.control, VHOST_SET_LOG_BASE(), &base) })
    }

    fn set_vring_num(&self, queue_index: usize, num: u16) -> Result<()> {
        let state = VringState {
            index: queue_index as u32,
            num: u32::from(num),
        };
        // SAFETY: the kernel only reads the pointed-to struct.
        ioctl_result(unsafe { ioctl_with_ref(&self.control, VHOST_SET_VRING_NUM(), &state) })
    }

    fn set_vring_base(&self, queue_index: usize, base: u16) -> Result<()> {
        let state = VringState {
            index: queue_index as u32,
            num: u32::from(base),
        };
        // SAFETY: the kernel only reads the pointed-to struct.
        ioctl_result(unsafe { ioctl_with_ref(&self.control, VHOST_SET_VRING_BASE(), &state) })
    }

    fn get_vring_base(&self, queue_index: usize) -> Result<u32> {
        let mut state = VringState {
            index: queue_index as u32,
            num: 0,
        };
        // SAFETY: the kernel reads the index and writes the state back into
        // the same struct.
        let rc = unsafe { ioctl_with_mut_ref(&self.control, VHOST_GET_VRING_BASE(), &mut state) };
        ioctl_result(rc)?;
        Ok(state.num)
    }

    fn set_vring_addr(&self, queue_index: usize, config: &VringConfigData) -> Result<()> {
        let addr = VringAddr {
            index: queue_index as u32,
            flags: config.flags,
            desc_user_addr: config.desc_table_addr,
            used_user_addr: config.used_ring_addr,
            avail_user_addr: config.avail_ring_addr,
            log_guest_addr: config.log_guest_addr,
        };
        // SAFETY: the kernel only reads the pointed-to struct.
        ioctl_result(unsafe { ioctl_with_ref(&self.control, VHOST_SET_VRING_ADDR(), &addr) })
    }

    fn set_vring_kick(&self, queue_index: usize, fd: RawFd) -> Result<()> {
        let file = VringFile {
            index: queue_index as u32,
            fd,
        };
        // SAFETY: the kernel only reads the pointed-to struct.
        ioctl_result(unsafe { ioctl_with_ref(&self.control, VHOST_SET_VRING_KICK(), &file) })
    }

    fn set_vring_call(&self, queue_index: usize, fd: RawFd) -> Result<()> {
        let file = VringFile {
            index: queue_index as u32,
            fd,
        };
        // SAFETY: the kernel only reads the pointed-to struct.
        ioctl_result(unsafe { ioctl_with_ref(&self.control, VHOST_SET_VRING_CALL(), &file) })
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_ioctl_numbers_match_kernel_abi() {
        assert_eq!(VHOST_GET_FEATURES(), 0x8008_AF00);
        assert_eq!(VHOST_SET_FEATURES(), 0x4008_AF00);
        assert_eq!(VHOST_SET_OWNER(), 0x0000_AF01);
        assert_eq!(VHOST_SET_MEM_TABLE(), 0x4008_AF03);
        assert_eq!(VHOST_SET_LOG_BASE(), 0x4008_AF04);
        assert_eq!(VHOST_SET_VRING_NUM(), 0x4008_AF10);
        assert_eq!(VHOST_SET_VRING_ADDR(), 0x4028_AF11);
        assert_eq!(VHOST_SET_VRING_BASE(), 0x4008_AF12);
        assert_eq!(VHOST_GET_VRING_BASE(), 0xC008_AF12);
        assert_eq!(VHOST_SET_VRING_KICK(), 0x4008_AF20);
        assert_eq!(VHOST_SET_VRING_CALL(), 0x4008_AF21);
    }

    #[test]
    fn test_payload_layouts() {
        assert_eq!(mem::size_of::<VhostMemoryHeader>(), 8);
        assert_eq!(mem::size_of::<VhostMemoryRegion>(), 32);
        assert_eq!(mem::size_of::<VringState>(), 8);
        assert_eq!(mem::size_of::<VringAddr>(), 40);
        assert_eq!(mem::size_of::<VringFile>(), 8);
    }

    #[test]
    fn test_ioctl_on_plain_file_fails() {
        let backend = VhostKernBackend::from(TempFile::new().unwrap().into_file());
        assert!(backend.as_raw_fd() >= 0);
        assert!(backend.set_owner().is_err());
        assert!(backend.get_features().is_err());
        assert!(backend
            .set_mem_table(&[VhostMemoryRegion::new(0, 0x1000, 0x2000)])
            .is_err());
        assert!(backend.get_vring_base(0).is_err());
    }
}
