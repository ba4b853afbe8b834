use core::marker::PhantomData;

use axerrno::{AxResult, ax_err_type};
use memory_addr::MemoryAddr;

use crate::hal::{HostPhysAddr, SvmVCpuHal};

pub(crate) use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// Physically contiguous 4K frames handed to the processor (VMCBs, the host
/// save area, permission maps). Returned to the HAL on drop.
#[derive(Debug)]
pub struct PhysFrames<H: SvmVCpuHal> {
    start_paddr: HostPhysAddr,
    count: usize,
    _marker: PhantomData<H>,
}

impl<H: SvmVCpuHal> PhysFrames<H> {
    /// Allocates `count` frames with every byte set to `byte`.
    pub fn alloc_filled(count: usize, byte: u8) -> AxResult<Self> {
        let start_paddr = match count {
            1 => H::alloc_frame(),
            _ => H::alloc_contiguous_frames(count),
        }
        .ok_or_else(|| ax_err_type!(NoMemory, "out of physical frames"))?;
        debug_assert_ne!(start_paddr.as_usize(), 0);
        debug_assert!(start_paddr.is_aligned_4k());

        let frames = Self {
            start_paddr,
            count,
            _marker: PhantomData,
        };
        unsafe { core::ptr::write_bytes(frames.as_mut_ptr(), byte, frames.size()) };
        Ok(frames)
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn size(&self) -> usize {
        PAGE_SIZE * self.count
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_mut_ptr()
    }
}

impl<H: SvmVCpuHal> Drop for PhysFrames<H> {
    fn drop(&mut self) {
        match self.count {
            1 => H::dealloc_frame(self.start_paddr),
            n => H::dealloc_contiguous_frames(self.start_paddr, n),
        }
        trace!("[SVM] freed {} frame(s) at {:#x}", self.count, self.start_paddr);
    }
}
