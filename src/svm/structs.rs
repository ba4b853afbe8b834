//! AMD-SVM helper structs
//! https://www.amd.com/content/dam/amd/en/documents/processor-tech-docs/programmer-references/24593.pdf

use axerrno::AxResult;

use crate::frame::{PAGE_SIZE, PhysFrames};
use crate::hal::{HostPhysAddr, SvmVCpuHal};

use super::vmcb::VmcbStruct;

/// A page holding a VMCB, or the host state VMSAVE parks around VMRUN.
#[derive(Debug)]
pub struct VmcbFrame<H: SvmVCpuHal> {
    page: PhysFrames<H>,
}

impl<H: SvmVCpuHal> VmcbFrame<H> {
    pub fn new() -> AxResult<Self> {
        Ok(Self {
            page: PhysFrames::alloc_filled(1, 0)?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.page.start_paddr()
    }

    /// The VMCB stored in this page.
    ///
    /// All VMCB fields are interior-mutable registers, so a shared reference
    /// is enough to update them.
    pub fn as_vmcb(&self) -> &VmcbStruct {
        // The page is owned, zero-initialized, 4K-aligned and exactly the
        // size of a VMCB; every bit pattern is valid for its fields.
        unsafe { &*(self.page.as_mut_ptr() as *const VmcbStruct) }
    }
}

// (AMD64 APM Vol.2, Section 15.10)
// The I/O Permissions Map (IOPM) occupies 12 Kbytes of contiguous physical memory.
// The map is structured as a linear array of 64K+3 bits (two 4-Kbyte pages, and the first three bits of a third 4-Kbyte page) and must be aligned on a 4-Kbyte boundary;
#[derive(Debug)]
pub struct IOPm<H: SvmVCpuHal> {
    frames: PhysFrames<H>, // 3 contiguous frames (12KB)
}

impl<H: SvmVCpuHal> IOPm<H> {
    pub const FRAMES: usize = 3;

    /// Every port access exits.
    pub fn intercept_all() -> AxResult<Self> {
        Ok(Self {
            frames: PhysFrames::alloc_filled(Self::FRAMES, 0xff)?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frames.start_paddr()
    }

    /// Whether an access to `port` exits.
    pub fn is_intercepted(&self, port: u16) -> bool {
        let byte = unsafe { self.frames.as_mut_ptr().add(port as usize / 8).read_volatile() };
        byte & (1 << (port % 8)) != 0
    }
}

// (AMD64 APM Vol.2, Section 15.11)
// The VMM can intercept RDMSR and WRMSR instructions by means of the SVM MSR permissions map (MSRPM) on a per-MSR basis
// The four separate bit vectors must be packed together and located in two contiguous physical pages of memory.
#[derive(Debug)]
pub struct MSRPm<H: SvmVCpuHal> {
    frames: PhysFrames<H>,
}

impl<H: SvmVCpuHal> MSRPm<H> {
    pub const FRAMES: usize = 2;

    /// Every RDMSR and WRMSR exits.
    pub fn intercept_all() -> AxResult<Self> {
        Ok(Self {
            frames: PhysFrames::alloc_filled(Self::FRAMES, 0xff)?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frames.start_paddr()
    }

    /// Byte offset and bit of the read intercept of `msr`; the write
    /// intercept is the next bit. `None` for MSRs outside the three ranges
    /// the map covers, which always exit.
    fn locate(msr: u32) -> Option<(usize, u8)> {
        let (segment, msr_low) = match msr {
            0..=0x1fff => (0usize, msr),
            0xc000_0000..=0xc000_1fff => (1, msr & 0x1fff),
            0xc001_0000..=0xc001_1fff => (2, msr & 0x1fff),
            _ => return None,
        };
        let byte = segment * 0x800 + (msr_low as usize) / 4;
        let bit = ((msr_low & 0b11) * 2) as u8;
        debug_assert!(byte < Self::FRAMES * PAGE_SIZE);
        Some((byte, bit))
    }

    pub fn set_intercept(&mut self, msr: u32, is_write: bool, intercept: bool) {
        let Some((byte, bit)) = Self::locate(msr) else {
            warn!("MSR {msr:#x} is not covered by the MSRPM");
            return;
        };
        let bit = bit + is_write as u8;

        unsafe {
            let byte_ptr = self.frames.as_mut_ptr().add(byte);
            let old = core::ptr::read_volatile(byte_ptr);
            let new = if intercept {
                old | (1u8 << bit)
            } else {
                old & !(1u8 << bit)
            };
            core::ptr::write_volatile(byte_ptr, new);
        }
    }

    /// Lets the guest read and write `msr` directly.
    pub fn passthrough(&mut self, msr: u32) {
        self.set_intercept(msr, false, false);
        self.set_intercept(msr, true, false);
    }

    /// Lets the guest read `msr` directly; writes still exit.
    pub fn passthrough_read(&mut self, msr: u32) {
        self.set_intercept(msr, false, false);
    }

    /// Whether a read (or write, if `is_write`) of `msr` exits.
    pub fn is_intercepted(&self, msr: u32, is_write: bool) -> bool {
        match Self::locate(msr) {
            Some((byte, bit)) => {
                let value = unsafe { self.frames.as_mut_ptr().add(byte).read_volatile() };
                value & (1 << (bit + is_write as u8)) != 0
            }
            None => true,
        }
    }
}
