//! Tests for the guest GPR block and its diff.

use crate::regs::{GeneralRegisters, GeneralRegistersDiff};

fn numbered() -> GeneralRegisters {
    let mut regs = GeneralRegisters::default();
    for i in (0..16u8).filter(|&i| i != 4) {
        regs.set_reg_of_index(i, 0x100 + i as u64);
    }
    regs
}

#[test]
fn index_follows_instruction_encoding() {
    let regs = numbered();
    assert_eq!(regs.rax, 0x100);
    assert_eq!(regs.rcx, 0x101);
    assert_eq!(regs.rdx, 0x102);
    assert_eq!(regs.rbx, 0x103);
    assert_eq!(regs.rbp, 0x105);
    assert_eq!(regs.rdi, 0x107);
    assert_eq!(regs.r8, 0x108);
    assert_eq!(regs.r15, 0x10f);
    for i in (0..16u8).filter(|&i| i != 4) {
        assert_eq!(regs.get_reg_of_index(i), 0x100 + i as u64);
    }
    assert_eq!(GeneralRegisters::register_name(4), "rsp");
    assert_eq!(GeneralRegisters::register_name(9), "r9");
}

#[test]
fn rsp_slot_is_not_a_register() {
    assert!(std::panic::catch_unwind(|| GeneralRegisters::default().get_reg_of_index(4)).is_err());
    assert!(std::panic::catch_unwind(|| GeneralRegisters::default().get_reg_of_index(16)).is_err());
}

#[test]
fn edx_eax_pairs() {
    let mut regs = GeneralRegisters::default();
    regs.rax = 0xdead_beef_1234_5678;
    regs.rdx = 0xcafe_f00d_abcd_ef00;
    // WRMSR and XSETBV ignore the upper halves.
    assert_eq!(regs.get_edx_eax(), 0xabcd_ef00_1234_5678);

    regs.set_edx_eax(0x0000_00c0_0000_0801);
    assert_eq!(regs.rax, 0x801);
    assert_eq!(regs.rdx, 0xc0);
}

#[test]
fn partial_width_writes() {
    let mut regs = GeneralRegisters::default();
    regs.rcx = u64::MAX;
    regs.set_ecx(0x1234);
    assert_eq!(regs.rcx, 0x1234);

    regs.rbx = 0xfedc_ba98_7654_3210;
    regs.set_bx(0xabcd);
    assert_eq!(regs.rbx, 0xfedc_ba98_7654_abcd);
    regs.set_bh(0x11);
    assert_eq!(regs.bh(), 0x11);
    assert_eq!(regs.bl(), 0xcd);

    regs.r12 = 0x1212_1212_3434_5656;
    assert_eq!(regs.r12d(), 0x3434_5656);
    assert_eq!(regs.r12w(), 0x5656);
    assert_eq!(regs.r12b(), 0x56);
    regs.set_r12d(7);
    assert_eq!(regs.r12, 7);
}

#[test]
fn diff_lists_changed_registers() {
    let old = numbered();
    let mut new = old;
    assert!(GeneralRegistersDiff::new(old, new).is_same());

    new.rax = 0x1;
    new.r11 = 0x2;
    let diff = GeneralRegistersDiff::new(old, new);
    assert!(!diff.is_same());

    let changes: std::vec::Vec<_> = diff.changes().collect();
    assert_eq!(changes, [(0, 0x100, 0x1), (11, 0x10b, 0x2)]);

    let text = alloc::format!("{diff:?}");
    assert!(text.contains("rax"));
    assert!(text.contains("0x10b -> 0x2"));
    assert!(!text.contains("rcx"));
}
