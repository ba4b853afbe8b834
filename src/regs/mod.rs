mod diff;

pub use diff::GeneralRegistersDiff;

/// General-purpose registers of a guest, in the order of their encoding
/// index. RSP lives in the VMCB and its slot here is unused.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

macro_rules! abcd_accessors {
    ($($x:ident),*) => { paste::paste! { $(
        pub const fn [<e $x x>](&self) -> u32 {
            self.[<r $x x>] as u32
        }

        /// Writing a 32-bit register zero-extends into the 64-bit one.
        pub fn [<set_e $x x>](&mut self, value: u32) {
            self.[<r $x x>] = value as u64;
        }

        pub const fn [<$x x>](&self) -> u16 {
            self.[<r $x x>] as u16
        }

        pub fn [<set_ $x x>](&mut self, value: u16) {
            self.[<r $x x>] = (self.[<r $x x>] & !0xffff) | value as u64;
        }

        pub const fn [<$x l>](&self) -> u8 {
            self.[<r $x x>] as u8
        }

        pub fn [<set_ $x l>](&mut self, value: u8) {
            self.[<r $x x>] = (self.[<r $x x>] & !0xff) | value as u64;
        }

        pub const fn [<$x h>](&self) -> u8 {
            (self.[<r $x x>] >> 8) as u8
        }

        pub fn [<set_ $x h>](&mut self, value: u8) {
            self.[<r $x x>] = (self.[<r $x x>] & !0xff00) | ((value as u64) << 8);
        }
    )* } };
}

macro_rules! index_accessors {
    ($($x:ident),*) => { paste::paste! { $(
        pub const fn [<e $x>](&self) -> u32 {
            self.[<r $x>] as u32
        }

        pub fn [<set_e $x>](&mut self, value: u32) {
            self.[<r $x>] = value as u64;
        }

        pub const fn $x(&self) -> u16 {
            self.[<r $x>] as u16
        }

        pub const fn [<$x l>](&self) -> u8 {
            self.[<r $x>] as u8
        }
    )* } };
}

macro_rules! numbered_accessors {
    ($($n:literal),*) => { paste::paste! { $(
        pub const fn [<r $n d>](&self) -> u32 {
            self.[<r $n>] as u32
        }

        pub fn [<set_r $n d>](&mut self, value: u32) {
            self.[<r $n>] = value as u64;
        }

        pub const fn [<r $n w>](&self) -> u16 {
            self.[<r $n>] as u16
        }

        pub const fn [<r $n b>](&self) -> u8 {
            self.[<r $n>] as u8
        }
    )* } };
}

impl GeneralRegisters {
    /// Names of the registers, indexed by their encoding.
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// Returns the name of the register with encoding `index`.
    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Returns the value of the register with encoding `index`.
    ///
    /// # Panics
    ///
    /// Panics for index 4 (RSP, not held here) and indexes above 15.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters: {index}"),
        }
    }

    /// Sets the register with encoding `index`.
    ///
    /// # Panics
    ///
    /// Panics for index 4 (RSP, not held here) and indexes above 15.
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("Illegal index of GeneralRegisters: {index}"),
        }
    }

    /// The 64-bit value in EDX:EAX, as consumed by WRMSR and XSETBV.
    pub const fn get_edx_eax(&self) -> u64 {
        ((self.rdx & 0xffff_ffff) << 32) | (self.rax & 0xffff_ffff)
    }

    /// Splits a 64-bit value into EDX:EAX, as produced by RDMSR.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.set_eax(value as u32);
        self.set_edx((value >> 32) as u32);
    }

    abcd_accessors!(a, b, c, d);
    index_accessors!(si, di, bp);
    numbered_accessors!(8, 9, 10, 11, 12, 13, 14, 15);
}
