use x86::controlregs::Xcr0;

use crate::hal::SvmVCpuHal;
use crate::state::FpuState;

/// XCR0 components the engine is able to expose, before masking with what
/// the host supports.
pub const XCR0_X87: u64 = Xcr0::XCR0_FPU_MMX_STATE.bits();
pub const XCR0_SSE: u64 = Xcr0::XCR0_SSE_STATE.bits();

/// Size of [`XSaveArea`], the largest XSAVE image the engine can hold.
pub const XSAVE_AREA_SIZE: usize = 4096;

const XSAVE_LEGACY_SIZE: u32 = 512;
const XSAVE_HEADER_SIZE: u32 = 64;

/// An XSAVE image: the legacy FXSAVE region, the XSAVE header and room for
/// the extended components.
#[repr(C, align(64))]
#[derive(Clone)]
pub struct XSaveArea {
    pub legacy: FpuState,
    pub header: [u64; 8],
    extended: [u8; XSAVE_AREA_SIZE - 576],
}

impl Default for XSaveArea {
    fn default() -> Self {
        Self {
            legacy: FpuState::default(),
            header: [0; 8],
            extended: [0; XSAVE_AREA_SIZE - 576],
        }
    }
}

impl core::fmt::Debug for XSaveArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("XSaveArea")
            .field("legacy", &self.legacy)
            .field("xstate_bv", &self.header[0])
            .finish_non_exhaustive()
    }
}

/// Size of the XSAVE image holding the components in `xcr0`, as reported by
/// CPUID leaf 0xD.
pub fn xsave_size<H: SvmVCpuHal>(xcr0: u64) -> u32 {
    let mut size = XSAVE_LEGACY_SIZE + XSAVE_HEADER_SIZE;
    for i in 2..64 {
        if xcr0 & (1 << i) == 0 {
            continue;
        }
        let res = H::cpuid(0xd, i);
        size = size.max(res.eax + res.ebx);
    }
    size
}

/// Host support for extended processor state.
#[derive(Debug, Clone, Copy)]
pub struct XAvailable {
    /// XSAVE (and XCR0) is available.
    pub xsave: bool,
    /// Components the host supports, from CPUID.(EAX=0xD,ECX=0).
    pub xcr0_supported: u64,
}

impl XAvailable {
    /// Query the host CPU features.
    pub fn new<H: SvmVCpuHal>() -> Self {
        let xsave = H::cpuid(1, 0).ecx & (1 << 26) != 0;
        let xcr0_supported = if xsave {
            let res = H::cpuid(0xd, 0);
            ((res.edx as u64) << 32) | res.eax as u64
        } else {
            0
        };
        Self {
            xsave,
            xcr0_supported,
        }
    }
}

/// MXCSR bits the host FPU implements, from an FXSAVE image.
pub fn host_mxcsr_mask<H: SvmVCpuHal>() -> u32 {
    let mut area = XSaveArea::default();
    unsafe { H::fpu_save(&mut area, 0) };
    match area.legacy.fx_mxcsr_mask {
        // Processors that leave the field zero implement the default mask.
        0 => 0xffbf,
        mask => mask,
    }
}

/// Host and guest FPU images of a vCPU, swapped around VMRUN.
#[derive(Debug)]
pub struct XState {
    pub host: XSaveArea,
    pub guest: XSaveArea,
    host_xcr0: u64,
}

impl XState {
    pub fn new() -> Self {
        Self {
            host: XSaveArea::default(),
            guest: XSaveArea::default(),
            host_xcr0: 0,
        }
    }

    /// Save the host FPU and load the guest's; `xcr0_mask` selects the
    /// components the guest may use and `gxcr0` is loaded into XCR0.
    pub fn switch_to_guest<H: SvmVCpuHal>(&mut self, xcr0_mask: u64, gxcr0: u64) {
        unsafe {
            if xcr0_mask != 0 {
                self.host_xcr0 = H::read_xcr0();
                H::fpu_save(&mut self.host, self.host_xcr0);
            } else {
                H::fpu_save(&mut self.host, 0);
            }
            H::fpu_restore(&self.guest, xcr0_mask);
            if xcr0_mask != 0 {
                H::write_xcr0(gxcr0);
            }
        }
    }

    /// Save the guest FPU and load the host's back.
    pub fn switch_to_host<H: SvmVCpuHal>(&mut self, xcr0_mask: u64) {
        unsafe {
            if xcr0_mask != 0 {
                H::write_xcr0(self.host_xcr0);
            }
            H::fpu_save(&mut self.guest, xcr0_mask);
            if xcr0_mask != 0 {
                H::fpu_restore(&self.host, self.host_xcr0);
            } else {
                H::fpu_restore(&self.host, 0);
            }
        }
    }
}
