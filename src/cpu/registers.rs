//! 16-bit x86 register file.
//!
//! The file holds:
//! - General purpose: AX, BX, CX, DX, SI, DI, BP, SP
//! - Segment: CS, DS, SS, ES
//! - IP and the flags word F
//!
//! Every register is a `u16`, so arithmetic wraps modulo 65536 by
//! construction. The 8-bit halves (AL, AH, ...) are views over AX..DX.

use serde::{Deserialize, Serialize};

/// A named register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Register {
    Ax,
    Bx,
    Cx,
    Dx,
    Si,
    Di,
    Bp,
    Sp,
    Cs,
    Ds,
    Ss,
    Es,
    Ip,
    Al,
    Ah,
    Bl,
    Bh,
    Cl,
    Ch,
    Dl,
    Dh,
}

impl Register {
    /// Map a decoder register onto the 16-bit file.
    ///
    /// Returns `None` for anything outside real-mode 16-bit state
    /// (32-bit registers, FS/GS, control registers, ...).
    pub fn from_iced(reg: iced_x86::Register) -> Option<Self> {
        use iced_x86::Register as R;

        let mapped = match reg {
            R::AX => Register::Ax,
            R::BX => Register::Bx,
            R::CX => Register::Cx,
            R::DX => Register::Dx,
            R::SI => Register::Si,
            R::DI => Register::Di,
            R::BP => Register::Bp,
            R::SP => Register::Sp,
            R::CS => Register::Cs,
            R::DS => Register::Ds,
            R::SS => Register::Ss,
            R::ES => Register::Es,
            R::AL => Register::Al,
            R::AH => Register::Ah,
            R::BL => Register::Bl,
            R::BH => Register::Bh,
            R::CL => Register::Cl,
            R::CH => Register::Ch,
            R::DL => Register::Dl,
            R::DH => Register::Dh,
            _ => return None,
        };
        Some(mapped)
    }

    /// True for the 8-bit halves.
    pub fn is_byte(self) -> bool {
        matches!(
            self,
            Register::Al
                | Register::Ah
                | Register::Bl
                | Register::Bh
                | Register::Cl
                | Register::Ch
                | Register::Dl
                | Register::Dh
        )
    }

    /// Value mask for this register's width.
    pub fn mask(self) -> u16 {
        if self.is_byte() {
            0x00FF
        } else {
            0xFFFF
        }
    }

    /// Sign bit for this register's width.
    pub fn sign_bit(self) -> u16 {
        if self.is_byte() {
            0x0080
        } else {
            0x8000
        }
    }

    /// Lower-case assembly name.
    pub fn name(self) -> &'static str {
        match self {
            Register::Ax => "ax",
            Register::Bx => "bx",
            Register::Cx => "cx",
            Register::Dx => "dx",
            Register::Si => "si",
            Register::Di => "di",
            Register::Bp => "bp",
            Register::Sp => "sp",
            Register::Cs => "cs",
            Register::Ds => "ds",
            Register::Ss => "ss",
            Register::Es => "es",
            Register::Ip => "ip",
            Register::Al => "al",
            Register::Ah => "ah",
            Register::Bl => "bl",
            Register::Bh => "bh",
            Register::Cl => "cl",
            Register::Ch => "ch",
            Register::Dl => "dl",
            Register::Dh => "dh",
        }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single bit in the flags word, at its x86 position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum Flag {
    /// CF
    Carry = 0x0001,
    /// ZF
    Zero = 0x0040,
}

impl Flag {
    #[inline]
    pub fn bit(self) -> u16 {
        self as u16
    }
}

/// The register file of one execution context.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub si: u16,
    pub di: u16,
    pub bp: u16,
    pub sp: u16,

    pub cs: u16,
    pub ds: u16,
    pub ss: u16,
    pub es: u16,

    /// Instruction pointer, relative to CS.
    pub ip: u16,

    /// Flags word. Only CF and ZF are maintained by the core.
    pub f: u16,
}

impl Registers {
    /// Create a register file with every register zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every register to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Read a register. Byte halves are returned zero-extended.
    pub fn get(&self, reg: Register) -> u16 {
        match reg {
            Register::Ax => self.ax,
            Register::Bx => self.bx,
            Register::Cx => self.cx,
            Register::Dx => self.dx,
            Register::Si => self.si,
            Register::Di => self.di,
            Register::Bp => self.bp,
            Register::Sp => self.sp,
            Register::Cs => self.cs,
            Register::Ds => self.ds,
            Register::Ss => self.ss,
            Register::Es => self.es,
            Register::Ip => self.ip,
            Register::Al => low(self.ax),
            Register::Ah => high(self.ax),
            Register::Bl => low(self.bx),
            Register::Bh => high(self.bx),
            Register::Cl => low(self.cx),
            Register::Ch => high(self.cx),
            Register::Dl => low(self.dx),
            Register::Dh => high(self.dx),
        }
    }

    /// Write a register, truncating to its width.
    pub fn set(&mut self, reg: Register, value: u16) {
        match reg {
            Register::Ax => self.ax = value,
            Register::Bx => self.bx = value,
            Register::Cx => self.cx = value,
            Register::Dx => self.dx = value,
            Register::Si => self.si = value,
            Register::Di => self.di = value,
            Register::Bp => self.bp = value,
            Register::Sp => self.sp = value,
            Register::Cs => self.cs = value,
            Register::Ds => self.ds = value,
            Register::Ss => self.ss = value,
            Register::Es => self.es = value,
            Register::Ip => self.ip = value,
            Register::Al => self.ax = with_low(self.ax, value),
            Register::Ah => self.ax = with_high(self.ax, value),
            Register::Bl => self.bx = with_low(self.bx, value),
            Register::Bh => self.bx = with_high(self.bx, value),
            Register::Cl => self.cx = with_low(self.cx, value),
            Register::Ch => self.cx = with_high(self.cx, value),
            Register::Dl => self.dx = with_low(self.dx, value),
            Register::Dh => self.dx = with_high(self.dx, value),
        }
    }

    pub fn flags(&self) -> u16 {
        self.f
    }

    pub fn set_flags(&mut self, value: u16) {
        self.f = value;
    }

    pub fn set_flag(&mut self, flag: Flag) {
        self.f |= flag.bit();
    }

    pub fn clear_flag(&mut self, flag: Flag) {
        self.f &= !flag.bit();
    }

    pub fn is_flag_set(&self, flag: Flag) -> bool {
        self.f & flag.bit() != 0
    }

    /// Set `flag` when `condition` holds, clear it otherwise.
    pub fn update_flag(&mut self, flag: Flag, condition: bool) {
        if condition {
            self.set_flag(flag);
        } else {
            self.clear_flag(flag);
        }
    }

    pub fn zf(&self) -> bool {
        self.is_flag_set(Flag::Zero)
    }

    pub fn cf(&self) -> bool {
        self.is_flag_set(Flag::Carry)
    }
}

#[inline]
fn low(word: u16) -> u16 {
    word & 0x00FF
}

#[inline]
fn high(word: u16) -> u16 {
    word >> 8
}

#[inline]
fn with_low(word: u16, value: u16) -> u16 {
    (word & 0xFF00) | (value & 0x00FF)
}

#[inline]
fn with_high(word: u16, value: u16) -> u16 {
    (word & 0x00FF) | ((value & 0x00FF) << 8)
}

impl std::fmt::Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AX={:04X} BX={:04X} CX={:04X} DX={:04X} SI={:04X} DI={:04X} BP={:04X} SP={:04X} \
             CS={:04X} DS={:04X} SS={:04X} ES={:04X} IP={:04X} F={:04X}",
            self.ax,
            self.bx,
            self.cx,
            self.dx,
            self.si,
            self.di,
            self.bp,
            self.sp,
            self.cs,
            self.ds,
            self.ss,
            self.es,
            self.ip,
            self.f
        )
    }
}
