// vmcb.rs — AMD-SVM Virtual-Machine Control Block
//
// A VMCB is a single 4-KiB page split into a 1024-byte Control Area (offset
// 0x0) and a 3-KiB State-Save Area (offset 0x400). Each field sits at a fixed
// offset inside the page, so the hypervisor touches the fields with normal
// memory operations.
//
// tock-registers gives every field a typed register proxy with bitfield
// accessors; the methods below group them the way the engine consumes them.
//
// Reference: AMD64 APM v2, Appendix B VMCB Layout

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use bit_field::BitField;
use bitflags::bitflags;
use tock_registers::fields::FieldValue;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use super::definitions::{SvmExitCode, SvmIntercept};
use crate::state::{Segment, SegmentAttributes};

// ─────────────────────────────────────────────────────────────────────────────
//  Control-area bitfields
// ─────────────────────────────────────────────────────────────────────────────

register_bitfields![u32,
    /// Vector 3  (offset 0x000C)
    pub InterceptVec3 [
        INTR            0,  NMI             1,  SMI              2,  INIT            3,
        VINTR           4,  CR0_SEL_WRITE   5,  IDTR_READ        6,  GDTR_READ       7,
        LDTR_READ       8,  TR_READ         9,  IDTR_WRITE      10,  GDTR_WRITE     11,
        LDTR_WRITE     12,  TR_WRITE       13,  RDTSC           14,  RDPMC          15,
        PUSHF          16,  POPF           17,  CPUID           18,  RSM            19,
        IRET           20,  SWINT          21,  INVD            22,  PAUSE          23,
        HLT            24,  INVLPG         25,  INVLPGA         26,  IOIO_PROT      27,
        MSR_PROT       28,  TASK_SWITCH    29,  FERR_FREEZE     30,  SHUTDOWN       31,
    ],

    /// Vector 4  (offset 0x0010)
    pub InterceptVec4 [
        VMRUN           0,  VMMCALL         1,  VMLOAD          2,  VMSAVE          3,
        STGI            4,  CLGI            5,  SKINIT          6,  RDTSCP          7,
        ICEBP           8,  WBINVD          9,  MONITOR        10,  MWAIT          11,
        MWAIT_CONDITIONAL 12, XSETBV       13,  RDPRU          14,  EFER_WRITE_TRAP 15,
    ],

    /// Vector 5  (offset 0x0014)
    pub InterceptVec5 [
        INVLPGB         0,  INVLPGB_ILLEGAL 1,  INVPCID         2,
        MCOMMIT         3,  TLBSYNC         4,
    ],
];

register_bitfields![u64,
    pub NestedCtl [
        NP_ENABLE        0,
        SEV_ENABLE       1,
        SEV_ES_ENABLE    2,
    ],

    /// Virtual interrupt control (offset 0x0060)
    pub VIntr [
        V_TPR           OFFSET(0)  NUMBITS(4) [],
        V_IRQ           OFFSET(8)  NUMBITS(1) [],
        V_GIF           OFFSET(9)  NUMBITS(1) [],
        V_INTR_PRIO     OFFSET(16) NUMBITS(4) [],
        V_IGN_TPR       OFFSET(20) NUMBITS(1) [],
        V_INTR_MASKING  OFFSET(24) NUMBITS(1) [],
        AVIC_ENABLE     OFFSET(31) NUMBITS(1) [],
        V_INTR_VECTOR   OFFSET(32) NUMBITS(8) [],
    ],

    /// Guest interrupt state (offset 0x0068)
    pub IntState [
        INTERRUPT_SHADOW      0,
        GUEST_INTERRUPT_MASK  1,
    ],

    /// EVENTINJ (offset 0x00A8) and EXITINTINFO (offset 0x0088), 15.20
    pub EventInj [
        VECTOR      OFFSET(0)  NUMBITS(8) [],
        TYPE        OFFSET(8)  NUMBITS(3) [
            External  = 0,
            Nmi       = 2,
            Exception = 3,
            Software  = 4,
        ],
        EV          OFFSET(11) NUMBITS(1) [],
        VALID       OFFSET(31) NUMBITS(1) [],
        ERROR_CODE  OFFSET(32) NUMBITS(32) [],
    ],

    /// EXITINFO1 of an IOIO intercept, 15.10.2
    pub IoExitInfo [
        IN      OFFSET(0)  NUMBITS(1) [],
        STR     OFFSET(2)  NUMBITS(1) [],
        REP     OFFSET(3)  NUMBITS(1) [],
        SZ8     OFFSET(4)  NUMBITS(1) [],
        SZ16    OFFSET(5)  NUMBITS(1) [],
        SZ32    OFFSET(6)  NUMBITS(1) [],
        A16     OFFSET(7)  NUMBITS(1) [],
        A32     OFFSET(8)  NUMBITS(1) [],
        A64     OFFSET(9)  NUMBITS(1) [],
        SEG     OFFSET(10) NUMBITS(3) [],
        PORT    OFFSET(16) NUMBITS(16) [],
    ],

    /// EXITINFO1 of a nested page fault, 15.25.6
    pub NpfExitInfo [
        P       0,
        W       1,
        US      2,
        RSV     3,
        ID      4,
    ],
];

register_bitfields![u8,
    pub VmcbTlbControl [
        CONTROL OFFSET(0) NUMBITS(3) [
            DoNothing                = 0,
            FlushAllOnVmrun          = 1,
            FlushGuestTlb            = 3,
            FlushGuestNonGlobalTlb   = 7,
        ]
    ]
];

bitflags! {
    /// VMCB clean bits (15.15.3). A set bit lets the processor skip
    /// reloading the corresponding group from the VMCB.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmcbCleanBits: u32 {
        /// Intercept vectors, TSC offset, pause filter.
        const INTERCEPTS = 1 << 0;
        /// IOPM and MSRPM base addresses.
        const IOPM = 1 << 1;
        const ASID = 1 << 2;
        /// V_TPR and the other virtual interrupt controls.
        const TPR = 1 << 3;
        /// Nested paging: NCR3, G_PAT.
        const NP = 1 << 4;
        /// CR0, CR3, CR4, EFER.
        const CRX = 1 << 5;
        /// DR6, DR7.
        const DRX = 1 << 6;
        /// GDT and IDT.
        const DT = 1 << 7;
        /// CS, DS, SS, ES and CPL.
        const SEG = 1 << 8;
        const CR2 = 1 << 9;
        const LBR = 1 << 10;
        const AVIC = 1 << 11;
        const CET = 1 << 12;
    }
}

impl VmcbCleanBits {
    /// What is left clean after a #VMEXIT: every group the engine tracks.
    pub const DEFAULT: Self = Self::from_bits_truncate(0x0fff);
}

register_structs![
    pub VmcbControlArea {
        (0x0000 => pub intercept_cr:         ReadWrite<u32>),
        (0x0004 => pub intercept_dr:         ReadWrite<u32>),
        (0x0008 => pub intercept_exceptions: ReadWrite<u32>),
        (0x000C => pub intercept_vector3:    ReadWrite<u32, InterceptVec3::Register>),
        (0x0010 => pub intercept_vector4:    ReadWrite<u32, InterceptVec4::Register>),
        (0x0014 => pub intercept_vector5:    ReadWrite<u32, InterceptVec5::Register>),
        (0x0018 => _reserved_0018),
        (0x003C => pub pause_filter_thresh:   ReadWrite<u16>),
        (0x003E => pub pause_filter_count:    ReadWrite<u16>),

        (0x0040 => pub iopm_base_pa:          ReadWrite<u64>),
        (0x0048 => pub msrpm_base_pa:         ReadWrite<u64>),
        (0x0050 => pub tsc_offset:            ReadWrite<u64>),

        (0x0058 => pub guest_asid:            ReadWrite<u32>),
        (0x005C => pub tlb_control:           ReadWrite<u8, VmcbTlbControl::Register>),
        (0x005D => _reserved_005D),

        (0x0060 => pub int_control:           ReadWrite<u64, VIntr::Register>),
        (0x0068 => pub int_state:             ReadWrite<u64, IntState::Register>),

        // ───── VMEXIT  ---------------------------------------------------
        (0x0070 => pub exit_code:             ReadWrite<u64>),
        (0x0078 => pub exit_info_1:           ReadWrite<u64>),
        (0x0080 => pub exit_info_2:           ReadWrite<u64>),
        (0x0088 => pub exit_int_info:         ReadWrite<u64, EventInj::Register>),

        // ───── Nested Paging / AVIC -----------------------------------------
        (0x0090 => pub nested_ctl:         ReadWrite<u64, NestedCtl::Register>),
        (0x0098 => pub avic_vapic_bar:     ReadWrite<u64>),
        (0x00A0 => pub ghcb_gpa:           ReadWrite<u64>),

        // ── Event-injection / Nested CR3 / LBR --------------------------------
        (0x00A8 => pub event_inj:          ReadWrite<u64, EventInj::Register>),
        (0x00B0 => pub nested_cr3:         ReadWrite<u64>),
        (0x00B8 => pub virt_ext:           ReadWrite<u64>),

        // ── Clean-bits & Next-RIP --------------------------------------------
        (0x00C0 => pub clean_bits:         ReadWrite<u32>),
        (0x00C4 => _reserved_00C4),
        (0x00C8 => pub next_rip:           ReadWrite<u64>),

        // ── Decoded-instruction cache ----------------------------------------
        (0x00D0 => pub insn_len:           ReadWrite<u8>),
        (0x00D1 => pub insn_bytes:         [ReadWrite<u8>; 15]),

        // ── AVIC extra --------------------------------------------------------
        (0x00E0 => pub avic_backing_page:  ReadWrite<u64>),
        (0x00E8 => _reserved_00E8),
        (0x00F0 => pub avic_logical_id:    ReadWrite<u64>),
        (0x00F8 => pub avic_physical_id:   ReadWrite<u64>),
        (0x0100 => _reserved_0100),
        (0x0108 => pub vmsa_pa:            ReadWrite<u64>),
        (0x0110 => _reserved_0110),

        (0x0400 => @END),
    }
];

register_structs![
    pub VmcbSegment {
        (0x0 => pub selector: ReadWrite<u16>),
        (0x2 => pub attr:     ReadWrite<u16>),
        (0x4 => pub limit:    ReadWrite<u32>),
        (0x8 => pub base:     ReadWrite<u64>),
        (0x10 => @END),
    }
];

register_structs![
    pub VmcbStateSaveArea {
        (0x0000 => pub es:   VmcbSegment),
        (0x0010 => pub cs:   VmcbSegment),
        (0x0020 => pub ss:   VmcbSegment),
        (0x0030 => pub ds:   VmcbSegment),
        (0x0040 => pub fs:   VmcbSegment),
        (0x0050 => pub gs:   VmcbSegment),
        (0x0060 => pub gdtr: VmcbSegment),
        (0x0070 => pub ldtr: VmcbSegment),
        (0x0080 => pub idtr: VmcbSegment),
        (0x0090 => pub tr:   VmcbSegment),
        (0x00A0 => _reserved_00A0),

        (0x00CB => pub cpl:  ReadWrite<u8>),
        (0x00CC => _reserved_00CC),

        (0x00D0 => pub efer: ReadWrite<u64>),
        (0x00D8 => _reserved_00D8),

        (0x0148 => pub cr4:   ReadWrite<u64>),
        (0x0150 => pub cr3:   ReadWrite<u64>),
        (0x0158 => pub cr0:   ReadWrite<u64>),
        (0x0160 => pub dr7:   ReadWrite<u64>),
        (0x0168 => pub dr6:   ReadWrite<u64>),
        (0x0170 => pub rflags:ReadWrite<u64>),
        (0x0178 => pub rip:   ReadWrite<u64>),
        (0x0180 => _reserved_0180),

        (0x01D8 => pub rsp:          ReadWrite<u64>),
        (0x01E0 => pub s_cet:        ReadWrite<u64>),
        (0x01E8 => pub ssp:          ReadWrite<u64>),
        (0x01F0 => pub isst_addr:    ReadWrite<u64>),
        (0x01F8 => pub rax:          ReadWrite<u64>),

        (0x0200 => pub star:          ReadWrite<u64>),
        (0x0208 => pub lstar:         ReadWrite<u64>),
        (0x0210 => pub cstar:         ReadWrite<u64>),
        (0x0218 => pub sfmask:        ReadWrite<u64>),
        (0x0220 => pub kernel_gs_base:ReadWrite<u64>),
        (0x0228 => pub sysenter_cs:   ReadWrite<u64>),
        (0x0230 => pub sysenter_esp:  ReadWrite<u64>),
        (0x0238 => pub sysenter_eip:  ReadWrite<u64>),
        (0x0240 => pub cr2:           ReadWrite<u64>),
        (0x0248 => _reserved_0248),

        (0x0268 => pub g_pat:         ReadWrite<u64>),
        (0x0270 => pub dbgctl:        ReadWrite<u64>),
        (0x0278 => pub br_from:       ReadWrite<u64>),
        (0x0280 => pub br_to:         ReadWrite<u64>),
        (0x0288 => pub last_excp_from:ReadWrite<u64>),
        (0x0290 => pub last_excp_to:  ReadWrite<u64>),
        (0x0298 => _reserved_0298),

        (0x0C00 => @END),
    }
];

register_structs![
    pub VmcbStruct {
        (0x0000 => pub control: VmcbControlArea),
        (0x0400 => pub state:   VmcbStateSaveArea),
        (0x1000 => @END),
    }
];

impl VmcbSegment {
    /// Loads `seg`, packing its attributes into the 12-bit VMCB form.
    pub fn set(&self, seg: &Segment) {
        self.selector.set(seg.selector);
        self.attr.set(pack_attributes(&seg.attrib));
        self.limit.set(seg.limit);
        self.base.set(seg.base);
    }

    pub fn get(&self) -> Segment {
        Segment {
            selector: self.selector.get(),
            attrib: unpack_attributes(self.attr.get()),
            limit: self.limit.get(),
            base: self.base.get(),
        }
    }
}

fn pack_attributes(attrib: &SegmentAttributes) -> u16 {
    let mut attr = 0u16;
    attr.set_bits(0..4, attrib.typ as u16)
        .set_bit(4, attrib.s)
        .set_bits(5..7, attrib.dpl as u16)
        .set_bit(7, attrib.p)
        .set_bit(8, attrib.avl)
        .set_bit(9, attrib.l)
        .set_bit(10, attrib.def)
        .set_bit(11, attrib.g);
    attr
}

fn unpack_attributes(attr: u16) -> SegmentAttributes {
    SegmentAttributes {
        typ: attr.get_bits(0..4) as u8,
        s: attr.get_bit(4),
        dpl: attr.get_bits(5..7) as u8,
        p: attr.get_bit(7),
        avl: attr.get_bit(8),
        l: attr.get_bit(9),
        def: attr.get_bit(10),
        g: attr.get_bit(11),
    }
}

macro_rules! intercept_table {
    ($self:ident, $intc:ident, $on:ident; $($reg:ident : $bf:ident [$($name:ident),* $(,)?]);* $(;)?) => {
        match $intc {
            $($(SvmIntercept::$name => $self.$reg.modify($bf::$name.val($on)),)*)*
        }
    };
}

impl VmcbControlArea {
    /// Enables or disables the intercept `intc`.
    pub fn set_intercept(&self, intc: SvmIntercept, enable: bool) {
        let on = enable as u32;
        intercept_table!(self, intc, on;
            intercept_vector3: InterceptVec3 [
                INTR, NMI, SMI, INIT, VINTR, CR0_SEL_WRITE, IDTR_READ, GDTR_READ, LDTR_READ,
                TR_READ, IDTR_WRITE, GDTR_WRITE, LDTR_WRITE, TR_WRITE, RDTSC, RDPMC, PUSHF,
                POPF, CPUID, RSM, IRET, SWINT, INVD, PAUSE, HLT, INVLPG, INVLPGA, IOIO_PROT,
                MSR_PROT, TASK_SWITCH, FERR_FREEZE, SHUTDOWN,
            ];
            intercept_vector4: InterceptVec4 [
                VMRUN, VMMCALL, VMLOAD, VMSAVE, STGI, CLGI, SKINIT, RDTSCP, ICEBP, WBINVD,
                MONITOR, MWAIT, MWAIT_CONDITIONAL, XSETBV, RDPRU, EFER_WRITE_TRAP,
            ];
            intercept_vector5: InterceptVec5 [
                INVLPGB, INVLPGB_ILLEGAL, INVPCID, MCOMMIT, TLBSYNC,
            ];
        )
    }

    /// The groups the processor may currently skip reloading.
    pub fn clean(&self) -> VmcbCleanBits {
        VmcbCleanBits::from_bits_truncate(self.clean_bits.get())
    }

    /// Marks `groups` as modified since the last VMRUN.
    pub fn mark_dirty(&self, groups: VmcbCleanBits) {
        self.clean_bits.set(self.clean().difference(groups).bits());
    }

    /// Forces the processor to reload everything, e.g. after migrating to
    /// another physical CPU.
    pub fn flush_clean(&self) {
        self.clean_bits.set(0);
    }

    /// Restores the clean bits after a #VMEXIT.
    pub fn reset_clean(&self) {
        self.clean_bits.set(VmcbCleanBits::DEFAULT.bits());
    }

    /// Installs a raw EVENTINJ value for the next VMRUN.
    pub fn set_event_injection(&self, value: u64) {
        self.event_inj.set(value);
    }

    /// Whether EVENTINJ holds an event not yet delivered.
    pub fn event_pending(&self) -> bool {
        self.event_inj.is_set(EventInj::VALID)
    }

    pub fn set_tlb_control(&self, value: FieldValue<u8, VmcbTlbControl::Register>) {
        self.tlb_control.write(value);
    }
}

#[derive(Debug)]
pub struct SvmExitInfo {
    pub exit_code: core::result::Result<SvmExitCode, u64>,
    pub exit_info_1: u64,
    pub exit_info_2: u64,
    pub exit_int_info: u64,
    pub guest_rip: u64,
    pub guest_next_rip: u64,
}

impl VmcbStruct {
    pub fn exit_info(&self) -> SvmExitInfo {
        SvmExitInfo {
            exit_code: self.control.exit_code.get().try_into(),
            exit_info_1: self.control.exit_info_1.get(),
            exit_info_2: self.control.exit_info_2.get(),
            exit_int_info: self.control.exit_int_info.get(),
            guest_rip: self.state.rip.get(),
            guest_next_rip: self.control.next_rip.get(),
        }
    }

    /// The instruction bytes the processor fetched before a nested page
    /// fault, with decode assists.
    pub fn insn_bytes(&self) -> (u8, [u8; 15]) {
        let mut bytes = [0u8; 15];
        for (dst, src) in bytes.iter_mut().zip(self.control.insn_bytes.iter()) {
            *dst = src.get();
        }
        (self.control.insn_len.get().min(15), bytes)
    }
}
