use std::fmt;

use crate::mmu::Mmu;

pub const FLAG_Z: u8 = 0x80;
pub const FLAG_N: u8 = 0x40;
pub const FLAG_H: u8 = 0x20;
pub const FLAG_C: u8 = 0x10;

/// Base cycle cost per opcode. Conditional branches list the taken cost;
/// the untaken penalty is subtracted at execution. Zero marks the unused
/// opcode slots (and 0xCB, which defers to the prefixed table).
const CYCLES: [u32; 256] = [
    4, 12, 8, 8, 4, 4, 8, 4, 20, 8, 8, 8, 4, 4, 8, 4,
    4, 12, 8, 8, 4, 4, 8, 4, 12, 8, 8, 8, 4, 4, 8, 4,
    12, 12, 8, 8, 4, 4, 8, 4, 12, 8, 8, 8, 4, 4, 8, 4,
    12, 12, 8, 8, 12, 12, 12, 4, 12, 8, 8, 8, 4, 4, 8, 4,
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4,
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4,
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4,
    8, 8, 8, 8, 8, 8, 4, 8, 4, 4, 4, 4, 4, 4, 8, 4,
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4,
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4,
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4,
    4, 4, 4, 4, 4, 4, 8, 4, 4, 4, 4, 4, 4, 4, 8, 4,
    20, 12, 16, 16, 24, 16, 8, 16, 20, 16, 16, 0, 24, 24, 8, 16,
    20, 12, 16, 0, 24, 16, 8, 16, 20, 16, 16, 0, 24, 0, 8, 16,
    12, 12, 8, 0, 0, 16, 8, 16, 16, 4, 16, 0, 0, 0, 8, 16,
    12, 12, 8, 4, 0, 16, 8, 16, 12, 8, 16, 4, 0, 0, 8, 16,
];

/// Cycle cost per CB-prefixed opcode, including the prefix fetch.
const CYCLES_CB: [u32; 256] = [
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 12, 8, 8, 8, 8, 8, 8, 8, 12, 8,
    8, 8, 8, 8, 8, 8, 12, 8, 8, 8, 8, 8, 8, 8, 12, 8,
    8, 8, 8, 8, 8, 8, 12, 8, 8, 8, 8, 8, 8, 8, 12, 8,
    8, 8, 8, 8, 8, 8, 12, 8, 8, 8, 8, 8, 8, 8, 12, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
    8, 8, 8, 8, 8, 8, 16, 8, 8, 8, 8, 8, 8, 8, 16, 8,
];

/// Fatal instruction-stream failure: an opcode with no defined decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError {
    pub opcode: u8,
    pub addr: u16,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "undefined opcode {:#04X} at {:#06X}", self.opcode, self.addr)
    }
}

impl std::error::Error for DecodeError {}

pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
    pub pc: u16,
    pub ime: bool,
    /// EI takes effect only after the following instruction finishes.
    ime_scheduled: bool,
    pub halted: bool,
}

impl Cpu {
    /// Registers as the boot ROM leaves them.
    pub fn new(cgb: bool) -> Self {
        Self {
            a: if cgb { 0x11 } else { 0x01 },
            f: 0xB0,
            b: 0x00,
            c: 0x13,
            d: 0x00,
            e: 0xD8,
            h: 0x01,
            l: 0x4D,
            sp: 0xFFFE,
            pc: 0x0100,
            ime: false,
            ime_scheduled: false,
            halted: false,
        }
    }

    pub fn af(&self) -> u16 {
        u16::from_be_bytes([self.a, self.f])
    }

    pub fn set_af(&mut self, val: u16) {
        self.a = (val >> 8) as u8;
        self.f = val as u8 & 0xF0;
    }

    pub fn bc(&self) -> u16 {
        u16::from_be_bytes([self.b, self.c])
    }

    pub fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    pub fn de(&self) -> u16 {
        u16::from_be_bytes([self.d, self.e])
    }

    pub fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn hl(&self) -> u16 {
        u16::from_be_bytes([self.h, self.l])
    }

    pub fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    fn flag(&self, flag: u8) -> bool {
        self.f & flag != 0
    }

    fn fetch8(&mut self, mmu: &Mmu) -> u8 {
        let val = mmu.read_byte(self.pc);
        self.pc = self.pc.wrapping_add(1);
        val
    }

    fn fetch16(&mut self, mmu: &Mmu) -> u16 {
        let lo = self.fetch8(mmu);
        let hi = self.fetch8(mmu);
        u16::from_le_bytes([lo, hi])
    }

    fn push_stack(&mut self, mmu: &mut Mmu, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        mmu.write_byte(self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        mmu.write_byte(self.sp, val as u8);
    }

    fn pop_stack(&mut self, mmu: &Mmu) -> u16 {
        let lo = mmu.read_byte(self.sp);
        self.sp = self.sp.wrapping_add(1);
        let hi = mmu.read_byte(self.sp);
        self.sp = self.sp.wrapping_add(1);
        u16::from_le_bytes([lo, hi])
    }

    /// 8-bit register (or (HL)) addressed by opcode bits.
    fn read_reg(&self, mmu: &Mmu, idx: u8) -> u8 {
        match idx & 7 {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => mmu.read_byte(self.hl()),
            _ => self.a,
        }
    }

    fn write_reg(&mut self, mmu: &mut Mmu, idx: u8, val: u8) {
        match idx & 7 {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => mmu.write_byte(self.hl(), val),
            _ => self.a = val,
        }
    }

    /// Condition code from opcode bits 3-4 (NZ, Z, NC, C).
    fn condition(&self, idx: u8) -> bool {
        match idx & 3 {
            0 => !self.flag(FLAG_Z),
            1 => self.flag(FLAG_Z),
            2 => !self.flag(FLAG_C),
            _ => self.flag(FLAG_C),
        }
    }

    /// Acknowledge the highest-priority pending interrupt, if any. Invoked
    /// between steps; returns the cycles consumed (0 when nothing fires).
    pub fn service_interrupt(&mut self, mmu: &mut Mmu) -> u32 {
        let pending = mmu.if_reg & mmu.ie_reg & 0x1F;
        if pending != 0 {
            // HALT wakes on any pending interrupt, IME or not.
            self.halted = false;
        }
        if !self.ime || pending == 0 {
            return 0;
        }
        let bit = pending.trailing_zeros();
        mmu.if_reg &= !(1u8 << bit);
        self.ime = false;
        self.ime_scheduled = false;
        self.push_stack(mmu, self.pc);
        self.pc = 0x0040 + (bit as u16) * 8;
        20
    }

    /// Fetch, decode, and execute one instruction, returning its cycle
    /// cost. Undefined opcodes are fatal.
    pub fn step(&mut self, mmu: &mut Mmu) -> Result<u32, DecodeError> {
        if self.halted {
            if mmu.if_reg & mmu.ie_reg & 0x1F != 0 {
                self.halted = false;
            } else {
                return Ok(4);
            }
        }

        let enable_ime = self.ime_scheduled;
        let op_addr = self.pc;
        let opcode = self.fetch8(mmu);

        #[cfg(feature = "cpu-trace")]
        log::trace!(
            "[CPU] pc={op_addr:04X} op={opcode:02X} af={:04X} bc={:04X} de={:04X} hl={:04X} sp={:04X}",
            self.af(),
            self.bc(),
            self.de(),
            self.hl(),
            self.sp
        );

        let mut cycles = CYCLES[opcode as usize];
        if cycles == 0 && opcode != 0xCB {
            return Err(DecodeError { opcode, addr: op_addr });
        }

        match opcode {
            0x00 => {} // NOP
            0x10 => {
                // STOP: treated as a no-op that skips its padding byte.
                self.pc = self.pc.wrapping_add(1);
            }
            0x76 => self.halted = true,

            // 16-bit loads
            0x01 => {
                let val = self.fetch16(mmu);
                self.set_bc(val);
            }
            0x11 => {
                let val = self.fetch16(mmu);
                self.set_de(val);
            }
            0x21 => {
                let val = self.fetch16(mmu);
                self.set_hl(val);
            }
            0x31 => self.sp = self.fetch16(mmu),
            0x08 => {
                let addr = self.fetch16(mmu);
                mmu.write_byte(addr, self.sp as u8);
                mmu.write_byte(addr.wrapping_add(1), (self.sp >> 8) as u8);
            }
            0xF9 => self.sp = self.hl(),
            0xF8 => {
                let val = self.add_sp_signed(mmu);
                self.set_hl(val);
            }
            0xE8 => self.sp = self.add_sp_signed(mmu),

            // Indirect A loads/stores
            0x02 => mmu.write_byte(self.bc(), self.a),
            0x12 => mmu.write_byte(self.de(), self.a),
            0x22 => {
                mmu.write_byte(self.hl(), self.a);
                self.set_hl(self.hl().wrapping_add(1));
            }
            0x32 => {
                mmu.write_byte(self.hl(), self.a);
                self.set_hl(self.hl().wrapping_sub(1));
            }
            0x0A => self.a = mmu.read_byte(self.bc()),
            0x1A => self.a = mmu.read_byte(self.de()),
            0x2A => {
                self.a = mmu.read_byte(self.hl());
                self.set_hl(self.hl().wrapping_add(1));
            }
            0x3A => {
                self.a = mmu.read_byte(self.hl());
                self.set_hl(self.hl().wrapping_sub(1));
            }
            0xE0 => {
                let off = self.fetch8(mmu);
                mmu.write_byte(0xFF00 + u16::from(off), self.a);
            }
            0xF0 => {
                let off = self.fetch8(mmu);
                self.a = mmu.read_byte(0xFF00 + u16::from(off));
            }
            0xE2 => mmu.write_byte(0xFF00 + u16::from(self.c), self.a),
            0xF2 => self.a = mmu.read_byte(0xFF00 + u16::from(self.c)),
            0xEA => {
                let addr = self.fetch16(mmu);
                mmu.write_byte(addr, self.a);
            }
            0xFA => {
                let addr = self.fetch16(mmu);
                self.a = mmu.read_byte(addr);
            }

            // 16-bit inc/dec (no flags)
            0x03 => self.set_bc(self.bc().wrapping_add(1)),
            0x13 => self.set_de(self.de().wrapping_add(1)),
            0x23 => self.set_hl(self.hl().wrapping_add(1)),
            0x33 => self.sp = self.sp.wrapping_add(1),
            0x0B => self.set_bc(self.bc().wrapping_sub(1)),
            0x1B => self.set_de(self.de().wrapping_sub(1)),
            0x2B => self.set_hl(self.hl().wrapping_sub(1)),
            0x3B => self.sp = self.sp.wrapping_sub(1),

            // ADD HL,rr (half-carry from bit 11)
            0x09 => self.add_hl(self.bc()),
            0x19 => self.add_hl(self.de()),
            0x29 => self.add_hl(self.hl()),
            0x39 => self.add_hl(self.sp),

            // INC r / DEC r / LD r,d8
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let idx = (opcode >> 3) & 7;
                let val = self.read_reg(mmu, idx).wrapping_add(1);
                self.write_reg(mmu, idx, val);
                self.f = (self.f & FLAG_C)
                    | if val == 0 { FLAG_Z } else { 0 }
                    | if val & 0x0F == 0 { FLAG_H } else { 0 };
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let idx = (opcode >> 3) & 7;
                let val = self.read_reg(mmu, idx).wrapping_sub(1);
                self.write_reg(mmu, idx, val);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if val == 0 { FLAG_Z } else { 0 }
                    | if val & 0x0F == 0x0F { FLAG_H } else { 0 };
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let val = self.fetch8(mmu);
                self.write_reg(mmu, (opcode >> 3) & 7, val);
            }

            // Rotates on A (Z always cleared)
            0x07 => {
                let carry = self.a >> 7;
                self.a = self.a.rotate_left(1);
                self.f = if carry != 0 { FLAG_C } else { 0 };
            }
            0x0F => {
                let carry = self.a & 1;
                self.a = self.a.rotate_right(1);
                self.f = if carry != 0 { FLAG_C } else { 0 };
            }
            0x17 => {
                let carry = self.a >> 7;
                self.a = (self.a << 1) | u8::from(self.flag(FLAG_C));
                self.f = if carry != 0 { FLAG_C } else { 0 };
            }
            0x1F => {
                let carry = self.a & 1;
                self.a = (self.a >> 1) | (u8::from(self.flag(FLAG_C)) << 7);
                self.f = if carry != 0 { FLAG_C } else { 0 };
            }

            0x27 => self.daa(),
            0x2F => {
                self.a = !self.a;
                self.f |= FLAG_N | FLAG_H;
            }
            0x37 => self.f = (self.f & FLAG_Z) | FLAG_C,
            0x3F => self.f = (self.f & (FLAG_Z | FLAG_C)) ^ FLAG_C,

            // LD r,r'
            0x40..=0x7F => {
                let val = self.read_reg(mmu, opcode & 7);
                self.write_reg(mmu, (opcode >> 3) & 7, val);
            }

            // ALU A,r
            0x80..=0xBF => {
                let val = self.read_reg(mmu, opcode & 7);
                self.alu((opcode >> 3) & 7, val);
            }
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let val = self.fetch8(mmu);
                self.alu((opcode >> 3) & 7, val);
            }

            // Jumps
            0x18 => self.jump_relative(mmu),
            0x20 | 0x28 | 0x30 | 0x38 => {
                if self.condition((opcode >> 3) & 3) {
                    self.jump_relative(mmu);
                } else {
                    self.pc = self.pc.wrapping_add(1);
                    cycles -= 4;
                }
            }
            0xC3 => self.pc = self.fetch16(mmu),
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let target = self.fetch16(mmu);
                if self.condition((opcode >> 3) & 3) {
                    self.pc = target;
                } else {
                    cycles -= 4;
                }
            }
            0xE9 => self.pc = self.hl(),

            // Calls / returns
            0xCD => {
                let target = self.fetch16(mmu);
                self.push_stack(mmu, self.pc);
                self.pc = target;
            }
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let target = self.fetch16(mmu);
                if self.condition((opcode >> 3) & 3) {
                    self.push_stack(mmu, self.pc);
                    self.pc = target;
                } else {
                    cycles -= 12;
                }
            }
            0xC9 => self.pc = self.pop_stack(mmu),
            0xD9 => {
                self.pc = self.pop_stack(mmu);
                self.ime = true;
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                if self.condition((opcode >> 3) & 3) {
                    self.pc = self.pop_stack(mmu);
                } else {
                    cycles -= 12;
                }
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.push_stack(mmu, self.pc);
                self.pc = u16::from(opcode & 0x38);
            }

            // Stack
            0xC5 => self.push_stack(mmu, self.bc()),
            0xD5 => self.push_stack(mmu, self.de()),
            0xE5 => self.push_stack(mmu, self.hl()),
            0xF5 => self.push_stack(mmu, self.af()),
            0xC1 => {
                let val = self.pop_stack(mmu);
                self.set_bc(val);
            }
            0xD1 => {
                let val = self.pop_stack(mmu);
                self.set_de(val);
            }
            0xE1 => {
                let val = self.pop_stack(mmu);
                self.set_hl(val);
            }
            0xF1 => {
                let val = self.pop_stack(mmu);
                self.set_af(val);
            }

            // Interrupt master enable
            0xF3 => {
                self.ime = false;
                self.ime_scheduled = false;
            }
            0xFB => self.ime_scheduled = true,

            0xCB => {
                let cb = self.fetch8(mmu);
                cycles = CYCLES_CB[cb as usize];
                self.execute_cb(mmu, cb);
            }

            _ => return Err(DecodeError { opcode, addr: op_addr }),
        }

        // The pending enable survives only if DI didn't cancel it mid-step.
        if enable_ime && self.ime_scheduled {
            self.ime = true;
            self.ime_scheduled = false;
        }
        Ok(cycles)
    }

    /// ALU family selected by opcode bits 3-5: ADD, ADC, SUB, SBC, AND,
    /// XOR, OR, CP.
    fn alu(&mut self, family: u8, val: u8) {
        match family & 7 {
            0 => self.add(val, false),
            1 => self.add(val, self.flag(FLAG_C)),
            2 => self.sub(val, false, true),
            3 => self.sub(val, self.flag(FLAG_C), true),
            4 => {
                self.a &= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 } | FLAG_H;
            }
            5 => {
                self.a ^= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            6 => {
                self.a |= val;
                self.f = if self.a == 0 { FLAG_Z } else { 0 };
            }
            _ => self.sub(val, false, false),
        }
    }

    fn add(&mut self, val: u8, carry_in: bool) {
        let carry = u8::from(carry_in);
        let result = u16::from(self.a) + u16::from(val) + u16::from(carry);
        let half = (self.a & 0x0F) + (val & 0x0F) + carry > 0x0F;
        self.a = result as u8;
        self.f = if self.a == 0 { FLAG_Z } else { 0 }
            | if half { FLAG_H } else { 0 }
            | if result > 0xFF { FLAG_C } else { 0 };
    }

    fn sub(&mut self, val: u8, carry_in: bool, store: bool) {
        let carry = u8::from(carry_in);
        let result = i16::from(self.a) - i16::from(val) - i16::from(carry);
        let half = (self.a & 0x0F) as i16 - (val & 0x0F) as i16 - i16::from(carry) < 0;
        let out = result as u8;
        self.f = FLAG_N
            | if out == 0 { FLAG_Z } else { 0 }
            | if half { FLAG_H } else { 0 }
            | if result < 0 { FLAG_C } else { 0 };
        if store {
            self.a = out;
        }
    }

    fn add_hl(&mut self, val: u16) {
        let hl = self.hl();
        let (result, carry) = hl.overflowing_add(val);
        let half = (hl & 0x0FFF) + (val & 0x0FFF) > 0x0FFF;
        self.set_hl(result);
        self.f = (self.f & FLAG_Z)
            | if half { FLAG_H } else { 0 }
            | if carry { FLAG_C } else { 0 };
    }

    /// SP plus a signed immediate; H/C come from the low byte.
    fn add_sp_signed(&mut self, mmu: &Mmu) -> u16 {
        let offset = self.fetch8(mmu) as i8 as i16 as u16;
        let sp = self.sp;
        let half = (sp & 0x0F) + (offset & 0x0F) > 0x0F;
        let carry = (sp & 0xFF) + (offset & 0xFF) > 0xFF;
        self.f = if half { FLAG_H } else { 0 } | if carry { FLAG_C } else { 0 };
        sp.wrapping_add(offset)
    }

    fn jump_relative(&mut self, mmu: &Mmu) {
        let offset = self.fetch8(mmu) as i8;
        self.pc = self.pc.wrapping_add(offset as u16);
    }

    fn daa(&mut self) {
        let mut adjust = 0u8;
        let mut carry = self.flag(FLAG_C);
        if self.flag(FLAG_H) || (!self.flag(FLAG_N) && self.a & 0x0F > 0x09) {
            adjust |= 0x06;
        }
        if carry || (!self.flag(FLAG_N) && self.a > 0x99) {
            adjust |= 0x60;
            carry = true;
        }
        self.a = if self.flag(FLAG_N) {
            self.a.wrapping_sub(adjust)
        } else {
            self.a.wrapping_add(adjust)
        };
        self.f = (self.f & FLAG_N)
            | if self.a == 0 { FLAG_Z } else { 0 }
            | if carry { FLAG_C } else { 0 };
    }

    /// CB-prefixed set: rotates/shifts/swap below 0x40, then BIT/RES/SET
    /// in 0x40-sized blocks.
    fn execute_cb(&mut self, mmu: &mut Mmu, op: u8) {
        let idx = op & 7;
        match op {
            0x00..=0x3F => {
                let val = self.read_reg(mmu, idx);
                let (result, carry) = match op >> 3 {
                    0 => (val.rotate_left(1), val >> 7),
                    1 => (val.rotate_right(1), val & 1),
                    2 => ((val << 1) | u8::from(self.flag(FLAG_C)), val >> 7),
                    3 => ((val >> 1) | (u8::from(self.flag(FLAG_C)) << 7), val & 1),
                    4 => (val << 1, val >> 7),
                    5 => ((val >> 1) | (val & 0x80), val & 1),
                    6 => (val.rotate_left(4), 0), // SWAP
                    _ => (val >> 1, val & 1),
                };
                self.write_reg(mmu, idx, result);
                self.f = if result == 0 { FLAG_Z } else { 0 }
                    | if carry != 0 { FLAG_C } else { 0 };
            }
            0x40..=0x7F => {
                let bit = (op >> 3) & 7;
                let val = self.read_reg(mmu, idx);
                self.f = (self.f & FLAG_C)
                    | FLAG_H
                    | if val & (1 << bit) == 0 { FLAG_Z } else { 0 };
            }
            0x80..=0xBF => {
                let bit = (op >> 3) & 7;
                let val = self.read_reg(mmu, idx) & !(1 << bit);
                self.write_reg(mmu, idx, val);
            }
            _ => {
                let bit = (op >> 3) & 7;
                let val = self.read_reg(mmu, idx) | (1 << bit);
                self.write_reg(mmu, idx, val);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// CPU halted in WRAM with a program at 0xC000.
    fn setup(program: &[u8]) -> (Cpu, Mmu) {
        let mut mmu = Mmu::new(false);
        for (i, &byte) in program.iter().enumerate() {
            mmu.write_byte(0xC000 + i as u16, byte);
        }
        let mut cpu = Cpu::new(false);
        cpu.pc = 0xC000;
        mmu.if_reg = 0;
        (cpu, mmu)
    }

    #[test]
    fn post_boot_register_state() {
        let cpu = Cpu::new(false);
        assert_eq!(cpu.pc, 0x0100);
        assert_eq!(cpu.sp, 0xFFFE);
        assert_eq!(cpu.af(), 0x01B0);
        assert_eq!(cpu.bc(), 0x0013);
        assert_eq!(cpu.de(), 0x00D8);
        assert_eq!(cpu.hl(), 0x014D);
        assert_eq!(Cpu::new(true).a, 0x11);
    }

    #[test]
    fn register_pairs_compose() {
        let mut cpu = Cpu::new(false);
        cpu.set_bc(0x1234);
        assert_eq!(cpu.b, 0x12);
        assert_eq!(cpu.c, 0x34);
        cpu.b = 0x56;
        assert_eq!(cpu.bc(), 0x5634);
        cpu.c = 0x78;
        assert_eq!(cpu.bc(), 0x5678);
    }

    #[test]
    fn flags_low_nibble_never_sticks() {
        let mut cpu = Cpu::new(false);
        cpu.set_af(0x12FF);
        assert_eq!(cpu.f, 0xF0);
    }

    #[test]
    fn add_sets_half_and_carry() {
        let (mut cpu, mut mmu) = setup(&[0xC6, 0x0F]); // ADD A,0x0F
        cpu.a = 0x01;
        assert_eq!(cpu.step(&mut mmu).unwrap(), 8);
        assert_eq!(cpu.a, 0x10);
        assert_eq!(cpu.f, FLAG_H);

        let (mut cpu, mut mmu) = setup(&[0xC6, 0x01]); // ADD A,0x01
        cpu.a = 0xFF;
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.a, 0x00);
        assert_eq!(cpu.f, FLAG_Z | FLAG_H | FLAG_C);
    }

    #[test]
    fn sub_and_cp_set_borrow_flags() {
        let (mut cpu, mut mmu) = setup(&[0xD6, 0x01]); // SUB 0x01
        cpu.a = 0x10;
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.a, 0x0F);
        assert_eq!(cpu.f, FLAG_N | FLAG_H);

        let (mut cpu, mut mmu) = setup(&[0xFE, 0x20]); // CP 0x20
        cpu.a = 0x10;
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.a, 0x10, "CP must not store");
        assert_eq!(cpu.f, FLAG_N | FLAG_C);
    }

    #[test]
    fn add_hl_uses_bit_11_half_carry() {
        let (mut cpu, mut mmu) = setup(&[0x09]); // ADD HL,BC
        cpu.set_hl(0x0FFF);
        cpu.set_bc(0x0001);
        cpu.f = FLAG_Z;
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.hl(), 0x1000);
        assert_eq!(cpu.f, FLAG_Z | FLAG_H, "Z preserved, H from bit 11");
    }

    #[test]
    fn add_sp_signed_uses_low_byte_carries() {
        let (mut cpu, mut mmu) = setup(&[0xE8, 0x01]); // ADD SP,+1
        cpu.sp = 0x00FF;
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.sp, 0x0100);
        assert_eq!(cpu.f, FLAG_H | FLAG_C);

        let (mut cpu, mut mmu) = setup(&[0xE8, 0xFF]); // ADD SP,-1
        cpu.sp = 0x0100;
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.sp, 0x00FF);
        assert_eq!(cpu.f, 0);
    }

    #[test]
    fn untaken_branches_cost_less() {
        let (mut cpu, mut mmu) = setup(&[0x20, 0x05]); // JR NZ
        cpu.f = FLAG_Z;
        assert_eq!(cpu.step(&mut mmu).unwrap(), 8);
        assert_eq!(cpu.pc, 0xC002);

        let (mut cpu, mut mmu) = setup(&[0x20, 0x05]);
        cpu.f = 0;
        assert_eq!(cpu.step(&mut mmu).unwrap(), 12);
        assert_eq!(cpu.pc, 0xC007);

        let (mut cpu, mut mmu) = setup(&[0xC4, 0x00, 0xD0]); // CALL NZ,0xD000
        cpu.f = FLAG_Z;
        assert_eq!(cpu.step(&mut mmu).unwrap(), 12);

        let (mut cpu, mut mmu) = setup(&[0xC0]); // RET NZ
        cpu.f = FLAG_Z;
        assert_eq!(cpu.step(&mut mmu).unwrap(), 8);
    }

    #[test]
    fn call_and_ret_round_trip() {
        let (mut cpu, mut mmu) = setup(&[0xCD, 0x10, 0xC0]); // CALL 0xC010
        cpu.sp = 0xD000;
        mmu.write_byte(0xC010, 0xC9); // RET
        assert_eq!(cpu.step(&mut mmu).unwrap(), 24);
        assert_eq!(cpu.pc, 0xC010);
        assert_eq!(cpu.step(&mut mmu).unwrap(), 16);
        assert_eq!(cpu.pc, 0xC003);
        assert_eq!(cpu.sp, 0xD000);
    }

    #[test]
    fn undefined_opcode_is_fatal_with_context() {
        let (mut cpu, mut mmu) = setup(&[0xDD]);
        let err = cpu.step(&mut mmu).unwrap_err();
        assert_eq!(err, DecodeError { opcode: 0xDD, addr: 0xC000 });
    }

    #[test]
    fn ei_is_deferred_one_instruction() {
        let (mut cpu, mut mmu) = setup(&[0xFB, 0x00, 0x00]); // EI; NOP; NOP
        cpu.step(&mut mmu).unwrap();
        assert!(!cpu.ime, "EI must not enable immediately");
        cpu.step(&mut mmu).unwrap();
        assert!(cpu.ime, "IME set after the following instruction");
    }

    #[test]
    fn di_cancels_scheduled_enable() {
        let (mut cpu, mut mmu) = setup(&[0xFB, 0xF3, 0x00]); // EI; DI; NOP
        cpu.step(&mut mmu).unwrap();
        cpu.step(&mut mmu).unwrap();
        cpu.step(&mut mmu).unwrap();
        assert!(!cpu.ime);
    }

    #[test]
    fn halt_wakes_on_pending_interrupt_without_ime() {
        let (mut cpu, mut mmu) = setup(&[0x76, 0x00]); // HALT; NOP
        cpu.ime = false;
        cpu.step(&mut mmu).unwrap();
        assert!(cpu.halted);
        assert_eq!(cpu.step(&mut mmu).unwrap(), 4, "idle while nothing pending");

        mmu.ie_reg = 0x04;
        mmu.if_reg = 0x04;
        cpu.step(&mut mmu).unwrap();
        assert!(!cpu.halted);
        assert_eq!(cpu.pc, 0xC002, "resumed past HALT");
        assert_eq!(mmu.if_reg, 0x04, "no acknowledge without IME");
    }

    #[test]
    fn interrupt_dispatch_pushes_pc_and_jumps() {
        let (mut cpu, mut mmu) = setup(&[0x00]);
        cpu.sp = 0xD000;
        cpu.ime = true;
        mmu.ie_reg = 0x05; // VBlank + Timer enabled
        mmu.if_reg = 0x05;
        let cycles = cpu.service_interrupt(&mut mmu);
        assert_eq!(cycles, 20);
        assert_eq!(cpu.pc, 0x0040, "VBlank outranks Timer");
        assert!(!cpu.ime);
        assert_eq!(mmu.if_reg, 0x04, "only the serviced bit clears");
        assert_eq!(mmu.read_byte(0xCFFE), 0x00);
        assert_eq!(mmu.read_byte(0xCFFF), 0xC0);
    }

    #[test]
    fn interrupt_priority_order() {
        let (mut cpu, mut mmu) = setup(&[0x00]);
        cpu.sp = 0xD000;
        cpu.ime = true;
        mmu.ie_reg = 0x1F;
        mmu.if_reg = 0x18; // Serial + Joypad
        cpu.service_interrupt(&mut mmu);
        assert_eq!(cpu.pc, 0x0058, "Serial before Joypad");
    }

    #[test]
    fn reti_restores_ime() {
        let (mut cpu, mut mmu) = setup(&[0xD9]);
        cpu.sp = 0xD000;
        cpu.push_stack(&mut mmu, 0xC123);
        cpu.ime = false;
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.pc, 0xC123);
        assert!(cpu.ime);
    }

    #[test]
    fn ld_hl_indirect_and_increment() {
        let (mut cpu, mut mmu) = setup(&[0x22, 0x2A]); // LD (HL+),A ; LD A,(HL+)
        cpu.set_hl(0xC100);
        cpu.a = 0x5A;
        cpu.step(&mut mmu).unwrap();
        assert_eq!(mmu.read_byte(0xC100), 0x5A);
        assert_eq!(cpu.hl(), 0xC101);
    }

    #[test]
    fn daa_adjusts_bcd_addition() {
        let (mut cpu, mut mmu) = setup(&[0x27]);
        // 0x15 + 0x27 = 0x3C, DAA -> 0x42
        cpu.a = 0x3C;
        cpu.f = 0;
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.a, 0x42);
    }

    #[test]
    fn cb_swap_and_bit() {
        let (mut cpu, mut mmu) = setup(&[0xCB, 0x37, 0xCB, 0x7F]); // SWAP A; BIT 7,A
        cpu.a = 0xF0;
        assert_eq!(cpu.step(&mut mmu).unwrap(), 8);
        assert_eq!(cpu.a, 0x0F);
        assert_eq!(cpu.f, 0);
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.f & FLAG_Z, FLAG_Z, "bit 7 clear sets Z");
    }

    #[test]
    fn cb_hl_variants_cost_more() {
        let (mut cpu, mut mmu) = setup(&[0xCB, 0x46, 0xCB, 0x06]); // BIT 0,(HL); RLC (HL)
        cpu.set_hl(0xC100);
        mmu.write_byte(0xC100, 0x81);
        assert_eq!(cpu.step(&mut mmu).unwrap(), 12);
        assert_eq!(cpu.f & FLAG_Z, 0);
        assert_eq!(cpu.step(&mut mmu).unwrap(), 16);
        assert_eq!(mmu.read_byte(0xC100), 0x03);
    }

    #[test]
    fn rst_jumps_to_fixed_vector() {
        let (mut cpu, mut mmu) = setup(&[0xEF]); // RST 0x28
        cpu.sp = 0xD000;
        assert_eq!(cpu.step(&mut mmu).unwrap(), 16);
        assert_eq!(cpu.pc, 0x0028);
    }

    #[test]
    fn pop_af_masks_flag_low_bits() {
        let (mut cpu, mut mmu) = setup(&[0xF1]);
        cpu.sp = 0xD000;
        cpu.push_stack(&mut mmu, 0x12FF);
        cpu.step(&mut mmu).unwrap();
        assert_eq!(cpu.af(), 0x12F0);
    }
}
