//! AMD-SVM instruction wrappers.
//!
//! AMD64 APM Vol-2 "Secure Virtual Machine" §15.
//! SVM instructions report no status: an invalid VMCB either produces a
//! `VMEXIT_INVALID` exit code or raises #GP/#UD directly.

use core::arch::asm;

use crate::regs::GeneralRegisters;
use crate::xstate::XSaveArea;

/// Set the global interrupt flag (`STGI`).
#[inline(always)]
pub unsafe fn stgi() {
    unsafe { asm!("stgi", options(nomem, nostack)) }
}

/// Clear the global interrupt flag (`CLGI`).
#[inline(always)]
pub unsafe fn clgi() {
    unsafe { asm!("clgi", options(nomem, nostack)) }
}

/// Enters the guest.
///
/// The host's VMLOAD/VMSAVE state (FS, GS, TR, LDTR, KernelGSBase, the
/// SYSCALL and SYSENTER MSRs) is saved into `host_pa` before the guest's is
/// loaded, and loaded back after the guest's is saved. Every GPR except RAX
/// and RSP, which the VMCB holds, is swapped with `gprs`.
pub unsafe fn svm_vmrun(vmcb_pa: u64, host_pa: u64, gprs: &mut GeneralRegisters) {
    unsafe {
        asm!(
            "push rbp",
            "push rbx",
            "push rdi",
            "push rsi",
            "mov rbx, rax",
            "mov rax, rsi",
            "vmsave rax",
            "mov rax, rbx",
            "mov rcx, [rdi + 8]",
            "mov rdx, [rdi + 16]",
            "mov rbx, [rdi + 24]",
            "mov rbp, [rdi + 40]",
            "mov rsi, [rdi + 48]",
            "mov r8, [rdi + 64]",
            "mov r9, [rdi + 72]",
            "mov r10, [rdi + 80]",
            "mov r11, [rdi + 88]",
            "mov r12, [rdi + 96]",
            "mov r13, [rdi + 104]",
            "mov r14, [rdi + 112]",
            "mov r15, [rdi + 120]",
            "mov rdi, [rdi + 56]",
            "vmload rax",
            "vmrun rax",
            "vmsave rax",
            "push rdi",
            "mov rdi, [rsp + 16]",
            "mov [rdi + 8], rcx",
            "mov [rdi + 16], rdx",
            "mov [rdi + 24], rbx",
            "mov [rdi + 40], rbp",
            "mov [rdi + 48], rsi",
            "mov [rdi + 64], r8",
            "mov [rdi + 72], r9",
            "mov [rdi + 80], r10",
            "mov [rdi + 88], r11",
            "mov [rdi + 96], r12",
            "mov [rdi + 104], r13",
            "mov [rdi + 112], r14",
            "mov [rdi + 120], r15",
            "pop rax",
            "mov [rdi + 56], rax",
            "pop rax",
            "vmload rax",
            "pop rdi",
            "pop rbx",
            "pop rbp",
            inout("rax") vmcb_pa => _,
            inout("rsi") host_pa => _,
            inout("rdi") gprs as *mut GeneralRegisters => _,
            out("rcx") _,
            out("rdx") _,
            out("r8") _,
            out("r9") _,
            out("r10") _,
            out("r11") _,
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
        );
    }
}

macro_rules! debug_registers {
    ($($n:literal),*) => {
        /// Reads debug register DR`index`.
        pub unsafe fn read_dr(index: u8) -> u64 {
            let value: u64;
            match index {
                $($n => unsafe {
                    asm!(concat!("mov {}, dr", $n), out(reg) value, options(nomem, nostack))
                },)*
                _ => panic!("Illegal debug register index {index}"),
            }
            value
        }

        /// Writes debug register DR`index`.
        pub unsafe fn write_dr(index: u8, value: u64) {
            match index {
                $($n => unsafe {
                    asm!(concat!("mov dr", $n, ", {}"), in(reg) value, options(nomem, nostack))
                },)*
                _ => panic!("Illegal debug register index {index}"),
            }
        }
    };
}

debug_registers!(0, 1, 2, 3, 6, 7);

/// `XSAVE64` of the components in `mask`, or `FXSAVE64` if `mask` is zero.
pub unsafe fn fpu_save(area: &mut XSaveArea, mask: u64) {
    let ptr = area as *mut XSaveArea as *mut u8;
    unsafe {
        if mask == 0 {
            asm!("fxsave64 [{}]", in(reg) ptr, options(nostack));
        } else {
            asm!(
                "xsave64 [{}]",
                in(reg) ptr,
                in("eax") mask as u32,
                in("edx") (mask >> 32) as u32,
                options(nostack),
            );
        }
    }
}

/// `XRSTOR64` of the components in `mask`, or `FXRSTOR64` if `mask` is zero.
pub unsafe fn fpu_restore(area: &XSaveArea, mask: u64) {
    let ptr = area as *const XSaveArea as *const u8;
    unsafe {
        if mask == 0 {
            asm!("fxrstor64 [{}]", in(reg) ptr, options(nostack, readonly));
        } else {
            asm!(
                "xrstor64 [{}]",
                in(reg) ptr,
                in("eax") mask as u32,
                in("edx") (mask >> 32) as u32,
                options(nostack, readonly),
            );
        }
    }
}
