//! Portable guest state exchanged with the caller.

use bitflags::bitflags;

use crate::regs::GeneralRegisters;

bitflags! {
    /// Groups of [`GuestState`] a get/set operation covers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StateGroups: u32 {
        const SEGS = 1 << 0;
        const GPRS = 1 << 1;
        const CRS = 1 << 2;
        const DRS = 1 << 3;
        const MSRS = 1 << 4;
        const INTR = 1 << 5;
        const FPU = 1 << 6;
    }
}

/// Unpacked segment descriptor attributes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAttributes {
    /// Segment type, 4 bits.
    pub typ: u8,
    /// Code/data (`true`) or system segment.
    pub s: bool,
    pub dpl: u8,
    pub p: bool,
    pub avl: bool,
    /// 64-bit code segment.
    pub l: bool,
    /// Default operand size (D/B).
    pub def: bool,
    /// Granularity.
    pub g: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub attrib: SegmentAttributes,
    pub limit: u32,
    pub base: u64,
}

impl Segment {
    const fn new(selector: u16, typ: u8, s: bool, limit: u32, base: u64) -> Self {
        Self {
            selector,
            attrib: SegmentAttributes {
                typ,
                s,
                dpl: 0,
                p: true,
                avl: false,
                l: false,
                def: false,
                g: false,
            },
            limit,
            base,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentState {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub gdt: Segment,
    pub idt: Segment,
    pub ldt: Segment,
    pub tr: Segment,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GprState {
    pub regs: GeneralRegisters,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrState {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub xcr0: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrState {
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MsrState {
    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub pat: u64,
    pub tsc: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntrState {
    pub int_shadow: bool,
    pub int_window_exiting: bool,
    pub nmi_window_exiting: bool,
    /// An event is waiting for the next entry. Read-only.
    pub evt_pending: bool,
}

/// The legacy FXSAVE region (512 bytes).
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpuState {
    pub fx_cw: u16,
    pub fx_sw: u16,
    pub fx_tw: u8,
    pub fx_zero: u8,
    pub fx_opcode: u16,
    pub fx_ip: u64,
    pub fx_dp: u64,
    pub fx_mxcsr: u32,
    pub fx_mxcsr_mask: u32,
    pub fx_87_ac: [[u8; 16]; 8],
    pub fx_xmm: [[u8; 16]; 16],
    pub fx_rsvd: [u8; 96],
}

impl Default for FpuState {
    fn default() -> Self {
        Self {
            fx_cw: 0,
            fx_sw: 0,
            fx_tw: 0,
            fx_zero: 0,
            fx_opcode: 0,
            fx_ip: 0,
            fx_dp: 0,
            fx_mxcsr: 0,
            fx_mxcsr_mask: 0,
            fx_87_ac: [[0; 16]; 8],
            fx_xmm: [[0; 16]; 16],
            fx_rsvd: [0; 96],
        }
    }
}

const _: () = assert!(core::mem::size_of::<FpuState>() == 512);

/// The complete guest CPU state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestState {
    pub segs: SegmentState,
    pub gprs: GprState,
    pub crs: CrState,
    pub drs: DrState,
    pub msrs: MsrState,
    pub intr: IntrState,
    pub fpu: FpuState,
}

/// CR0.CD | CR0.NW | CR0.ET
const RESET_CR0: u64 = 0x6000_0010;
const RESET_PAT: u64 = 0x0007_0406_0007_0406;
const RESET_MXCSR: u32 = 0x1f80;

impl GuestState {
    /// The state of a processor right after RESET.
    pub fn reset() -> Self {
        let data = Segment::new(0, 0x3, true, 0xffff, 0);
        let mut state = Self::default();

        state.segs = SegmentState {
            cs: Segment::new(0xf000, 0xb, true, 0xffff, 0xffff_0000),
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            gdt: Segment::new(0, 0, false, 0xffff, 0),
            idt: Segment::new(0, 0, false, 0xffff, 0),
            ldt: Segment::new(0, 0x2, false, 0xffff, 0),
            tr: Segment::new(0, 0xb, false, 0xffff, 0),
        };
        state.segs.gdt.attrib.p = false;
        state.segs.idt.attrib.p = false;

        state.gprs.rip = 0xfff0;
        state.gprs.rflags = 0x2;

        state.crs.cr0 = RESET_CR0;
        state.crs.xcr0 = x86::controlregs::Xcr0::XCR0_FPU_MMX_STATE.bits();

        state.drs.dr6 = 0xffff_0ff0;
        state.drs.dr7 = 0x400;

        state.msrs.pat = RESET_PAT;

        state.fpu.fx_cw = 0x0040;
        state.fpu.fx_tw = 0x55;
        state.fpu.fx_zero = 0x55;
        state.fpu.fx_mxcsr = RESET_MXCSR;

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_vector() {
        let state = GuestState::reset();
        assert_eq!(state.gprs.rip, 0xfff0);
        assert_eq!(state.gprs.rflags, 0x2);
        assert_eq!(state.segs.cs.selector, 0xf000);
        assert_eq!(state.segs.cs.base, 0xffff_0000);
        assert_eq!(state.segs.cs.limit, 0xffff);
        // The first fetch lands on the last 16 bytes below 4 GiB.
        assert_eq!(state.segs.cs.base + state.gprs.rip, 0xffff_fff0);
    }

    #[test]
    fn reset_is_real_mode() {
        let state = GuestState::reset();
        assert_eq!(state.crs.cr0 & 1, 0);
        assert_eq!(state.msrs.efer, 0);
        assert_eq!(state.crs.xcr0, 1);
        assert!(state.segs.cs.attrib.p && state.segs.cs.attrib.s);
    }
}
