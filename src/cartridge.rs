use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const RAM_BANK_SIZE: usize = 0x2000;

/// Errors raised while loading a ROM image.
#[derive(Debug)]
pub enum CartridgeError {
    /// A header byte does not map to any known table entry.
    Malformed { field: &'static str, value: u8 },
    Io(io::Error),
}

impl fmt::Display for CartridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CartridgeError::Malformed { field, value } => {
                write!(f, "malformed cartridge header: {field} byte {value:#04X}")
            }
            CartridgeError::Io(e) => write!(f, "cartridge I/O error: {e}"),
        }
    }
}

impl std::error::Error for CartridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CartridgeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CartridgeError {
    fn from(e: io::Error) -> Self {
        CartridgeError::Io(e)
    }
}

/// Mapper family, resolved once from the header type byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MbcType {
    None,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
}

/// Real-time clock state for MBC3 carts with a timer.
///
/// The counter is derived from wall-clock milliseconds since `start_millis`;
/// register writes rebase the start instant so later latches agree.
struct Mbc3Rtc {
    start_millis: u64,
    /// Latched registers: seconds, minutes, hours, day low, control.
    latched: [u8; 5],
    halted: bool,
    halt_since: u64,
    /// Day-counter overflow flag. Sticky until software clears it.
    carry: bool,
    /// A 0x00 write to the latch range arms the 0x00 -> 0x01 sequence.
    latch_armed: bool,
}

fn ram_index(ram_len: usize, bank: usize, addr: u16) -> Option<usize> {
    if ram_len == 0 {
        return None;
    }
    Some((bank * RAM_BANK_SIZE + (addr as usize - 0xA000)) % ram_len)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Mbc3Rtc {
    fn new() -> Self {
        Self {
            start_millis: now_millis(),
            latched: [0; 5],
            halted: false,
            halt_since: 0,
            carry: false,
            latch_armed: false,
        }
    }

    fn elapsed_millis(&self) -> u64 {
        let reference = if self.halted { self.halt_since } else { now_millis() };
        reference.saturating_sub(self.start_millis)
    }

    fn latch(&mut self) {
        self.latched = self.registers_from(self.elapsed_millis());
    }

    fn registers_from(&mut self, elapsed: u64) -> [u8; 5] {
        let secs = elapsed / 1000;
        let mut days = secs / 86_400;
        if days > 511 {
            self.carry = true;
            days %= 512;
        }
        let mut control = ((days >> 8) & 1) as u8;
        if self.halted {
            control |= 0x40;
        }
        if self.carry {
            control |= 0x80;
        }
        [
            (secs % 60) as u8,
            ((secs / 60) % 60) as u8,
            ((secs / 3600) % 24) as u8,
            (days & 0xFF) as u8,
            control,
        ]
    }

    /// Write one of registers 0x08-0x0C. The running counter is rebased so
    /// the written value becomes current.
    fn write_register(&mut self, reg: u8, val: u8) {
        let elapsed = self.elapsed_millis();
        let secs = elapsed / 1000;
        let days = (secs / 86_400) % 512;
        let (mut s, mut m, mut h, mut d) =
            (secs % 60, (secs / 60) % 60, (secs / 3600) % 24, days);
        match reg {
            0x08 => s = u64::from(val % 60),
            0x09 => m = u64::from(val % 60),
            0x0A => h = u64::from(val % 24),
            0x0B => d = (d & 0x100) | u64::from(val),
            0x0C => {
                d = (d & 0xFF) | (u64::from(val & 0x01) << 8);
                self.carry = val & 0x80 != 0;
                self.set_halted(val & 0x40 != 0);
            }
            _ => return,
        }
        let new_elapsed = (((d * 24 + h) * 60 + m) * 60 + s) * 1000 + elapsed % 1000;
        let reference = if self.halted { self.halt_since } else { now_millis() };
        self.start_millis = reference.saturating_sub(new_elapsed);
    }

    fn set_halted(&mut self, halt: bool) {
        if halt && !self.halted {
            self.halt_since = now_millis();
            self.halted = true;
        } else if !halt && self.halted {
            // Shift the start instant forward by the frozen duration.
            let frozen = now_millis().saturating_sub(self.halt_since);
            self.start_millis = self.start_millis.saturating_add(frozen);
            self.halted = false;
        }
    }
}

/// Banking state, one variant per controller, resolved at load time.
enum MbcState {
    NoMbc,
    Mbc1 {
        ram_enable: bool,
        /// Low 5 bank bits; 0 already coerced to 1.
        bank_lo: u8,
        /// High 2 bits, reused as the RAM bank in mode 1.
        bank_hi: u8,
        /// false = ROM banking mode, true = RAM banking mode.
        mode: bool,
    },
    Mbc2 {
        ram_enable: bool,
        rom_bank: u8,
    },
    Mbc3 {
        ram_enable: bool,
        rom_bank: u8,
        /// RAM bank 0-3 or RTC register select 0x08-0x0C.
        select: u8,
        rtc: Option<Mbc3Rtc>,
    },
    Mbc5 {
        ram_enable: bool,
        rom_bank: u16,
        ram_bank: u8,
    },
}

pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub has_battery: bool,
    pub has_rtc: bool,
    mbc_state: MbcState,
    rom_banks: usize,
    save_path: Option<PathBuf>,
}

/// Borrowed view of the header fields at 0x134-0x14C.
pub struct Header<'a> {
    rom: &'a [u8],
}

impl<'a> Header<'a> {
    pub fn new(rom: &'a [u8]) -> Self {
        Self { rom }
    }

    fn byte(&self, addr: usize) -> u8 {
        self.rom.get(addr).copied().unwrap_or(0)
    }

    pub fn title(&self) -> String {
        self.rom
            .get(0x134..0x144)
            .unwrap_or(&[])
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect()
    }

    pub fn cgb_flag(&self) -> bool {
        self.byte(0x143) & 0x80 != 0
    }

    pub fn cart_type(&self) -> u8 {
        self.byte(0x147)
    }

    pub fn rom_size_byte(&self) -> u8 {
        self.byte(0x148)
    }

    pub fn ram_size_byte(&self) -> u8 {
        self.byte(0x149)
    }
}

/// (mapper, has_ram, has_battery, has_rtc) for a header type byte.
fn decode_cart_type(byte: u8) -> Option<(MbcType, bool, bool, bool)> {
    Some(match byte {
        0x00 => (MbcType::None, false, false, false),
        0x01 => (MbcType::Mbc1, false, false, false),
        0x02 => (MbcType::Mbc1, true, false, false),
        0x03 => (MbcType::Mbc1, true, true, false),
        0x05 => (MbcType::Mbc2, true, false, false),
        0x06 => (MbcType::Mbc2, true, true, false),
        0x08 => (MbcType::None, true, false, false),
        0x09 => (MbcType::None, true, true, false),
        0x0F => (MbcType::Mbc3, false, true, true),
        0x10 => (MbcType::Mbc3, true, true, true),
        0x11 => (MbcType::Mbc3, false, false, false),
        0x12 => (MbcType::Mbc3, true, false, false),
        0x13 => (MbcType::Mbc3, true, true, false),
        0x19 => (MbcType::Mbc5, false, false, false),
        0x1A => (MbcType::Mbc5, true, false, false),
        0x1B => (MbcType::Mbc5, true, true, false),
        0x1C => (MbcType::Mbc5, false, false, false),
        0x1D => (MbcType::Mbc5, true, false, false),
        0x1E => (MbcType::Mbc5, true, true, false),
        _ => return None,
    })
}

fn decode_ram_size(byte: u8) -> Option<usize> {
    Some(match byte {
        0x00 => 0,
        0x01 => 0x800,
        0x02 => 0x2000,
        0x03 => 0x8000,
        0x04 => 0x20000,
        0x05 => 0x10000,
        _ => return None,
    })
}

impl Cartridge {
    /// Parse the header and build a cartridge from a raw ROM image.
    pub fn load(rom: Vec<u8>) -> Result<Self, CartridgeError> {
        let header = Header::new(&rom);
        let type_byte = header.cart_type();
        let (mbc, _has_ram, has_battery, has_rtc) = decode_cart_type(type_byte)
            .ok_or(CartridgeError::Malformed { field: "cartridge type", value: type_byte })?;

        let rom_size_byte = header.rom_size_byte();
        if rom_size_byte > 0x08 {
            return Err(CartridgeError::Malformed { field: "ROM size", value: rom_size_byte });
        }

        let ram_size_byte = header.ram_size_byte();
        let mut ram_size = decode_ram_size(ram_size_byte)
            .ok_or(CartridgeError::Malformed { field: "RAM size", value: ram_size_byte })?;
        // Mapperless boards always expose one full RAM bank, and MBC2 carries
        // its 512 cells on-die regardless of the header byte.
        match mbc {
            MbcType::None => ram_size = RAM_BANK_SIZE,
            MbcType::Mbc2 => ram_size = 512,
            _ => {}
        }

        let rom_banks = (rom.len() / ROM_BANK_SIZE).max(2);
        let mbc_state = match mbc {
            MbcType::None => MbcState::NoMbc,
            MbcType::Mbc1 => {
                MbcState::Mbc1 { ram_enable: false, bank_lo: 1, bank_hi: 0, mode: false }
            }
            MbcType::Mbc2 => MbcState::Mbc2 { ram_enable: false, rom_bank: 1 },
            MbcType::Mbc3 => MbcState::Mbc3 {
                ram_enable: false,
                rom_bank: 1,
                select: 0,
                rtc: has_rtc.then(Mbc3Rtc::new),
            },
            MbcType::Mbc5 => MbcState::Mbc5 { ram_enable: false, rom_bank: 1, ram_bank: 0 },
        };

        info!(
            "loaded cartridge \"{}\" type={:02X} rom_banks={} ram={:#X} battery={} rtc={}",
            header.title(),
            type_byte,
            rom_banks,
            ram_size,
            has_battery,
            has_rtc
        );

        Ok(Self {
            rom,
            // External RAM powers up erased.
            ram: vec![0xFF; ram_size],
            mbc,
            has_battery,
            has_rtc,
            mbc_state,
            rom_banks,
            save_path: None,
        })
    }

    /// Load a ROM from disk and restore any battery save next to it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        let path = path.as_ref();
        let rom = fs::read(path)?;
        let mut cart = Self::load(rom)?;
        cart.save_path = Some(path.with_extension("sav"));
        if let Some(p) = cart.save_path.as_deref() {
            debug!("battery save path {}", p.display());
        }
        cart.load_save();
        Ok(cart)
    }

    pub fn title(&self) -> String {
        Header::new(&self.rom).title()
    }

    pub fn cgb_flag(&self) -> bool {
        Header::new(&self.rom).cgb_flag()
    }

    pub fn rom_banks(&self) -> usize {
        self.rom_banks
    }

    fn rom_byte(&self, bank: usize, offset: usize) -> u8 {
        let idx = (bank % self.rom_banks) * ROM_BANK_SIZE + offset;
        self.rom.get(idx).copied().unwrap_or(0xFF)
    }

    /// Read through the cartridge windows (0000-7FFF ROM, A000-BFFF RAM/RTC).
    pub fn read(&self, addr: u16) -> u8 {
        let offset = (addr as usize) & 0x3FFF;
        match (&self.mbc_state, addr) {
            (MbcState::NoMbc, 0x0000..=0x3FFF) => self.rom_byte(0, offset),
            (MbcState::NoMbc, 0x4000..=0x7FFF) => self.rom_byte(1, offset),
            (MbcState::NoMbc, 0xA000..=0xBFFF) => self.ram_read(0, addr),

            (MbcState::Mbc1 { bank_hi, mode, .. }, 0x0000..=0x3FFF) => {
                // Mode 1 maps the high bits into the fixed window too.
                let bank = if *mode { (*bank_hi as usize) << 5 } else { 0 };
                self.rom_byte(bank, offset)
            }
            (MbcState::Mbc1 { bank_lo, bank_hi, .. }, 0x4000..=0x7FFF) => {
                let bank = ((*bank_hi as usize) << 5) | *bank_lo as usize;
                self.rom_byte(bank, offset)
            }
            (MbcState::Mbc1 { ram_enable: true, bank_hi, mode, .. }, 0xA000..=0xBFFF) => {
                let bank = if *mode { *bank_hi as usize } else { 0 };
                self.ram_read(bank, addr)
            }

            (MbcState::Mbc2 { .. }, 0x0000..=0x3FFF) => self.rom_byte(0, offset),
            (MbcState::Mbc2 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                self.rom_byte(*rom_bank as usize, offset)
            }
            (MbcState::Mbc2 { ram_enable: true, .. }, 0xA000..=0xBFFF) => {
                let idx = (addr as usize - 0xA000) & 0x1FF;
                self.ram.get(idx).copied().unwrap_or(0xFF) | 0xF0
            }

            (MbcState::Mbc3 { .. }, 0x0000..=0x3FFF) => self.rom_byte(0, offset),
            (MbcState::Mbc3 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                self.rom_byte(*rom_bank as usize, offset)
            }
            (
                MbcState::Mbc3 { ram_enable: true, select, rtc, .. },
                0xA000..=0xBFFF,
            ) => match (select, rtc) {
                (0x08..=0x0C, Some(rtc)) => rtc.latched[(*select - 0x08) as usize],
                (0x00..=0x03, _) => self.ram_read(*select as usize, addr),
                _ => 0xFF,
            },

            (MbcState::Mbc5 { .. }, 0x0000..=0x3FFF) => self.rom_byte(0, offset),
            (MbcState::Mbc5 { rom_bank, .. }, 0x4000..=0x7FFF) => {
                self.rom_byte(*rom_bank as usize, offset)
            }
            (MbcState::Mbc5 { ram_enable: true, ram_bank, .. }, 0xA000..=0xBFFF) => {
                self.ram_read(*ram_bank as usize, addr)
            }

            // RAM disabled or window not fitted.
            _ => 0xFF,
        }
    }

    /// Write through the cartridge windows. Control-range writes are
    /// intercepted as banking commands, never stored.
    pub fn write(&mut self, addr: u16, val: u8) {
        match (&mut self.mbc_state, addr) {
            (MbcState::NoMbc, 0xA000..=0xBFFF) => {
                if let Some(idx) = ram_index(self.ram.len(), 0, addr) {
                    self.ram[idx] = val;
                }
            }
            (MbcState::NoMbc, _) => {}

            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc1 { bank_lo, .. }, 0x2000..=0x3FFF) => {
                // Coercion happens on the 5-bit register, before the high
                // bits combine, so 0x00/0x20/0x40/0x60 skip forward by one.
                let bank = val & 0x1F;
                *bank_lo = if bank == 0 { 1 } else { bank };
            }
            (MbcState::Mbc1 { bank_hi, .. }, 0x4000..=0x5FFF) => {
                *bank_hi = val & 0x03;
            }
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => {
                *mode = val & 0x01 != 0;
            }
            (MbcState::Mbc1 { ram_enable: true, bank_hi, mode, .. }, 0xA000..=0xBFFF) => {
                let bank = if *mode { *bank_hi as usize } else { 0 };
                if let Some(idx) = ram_index(self.ram.len(), bank, addr) {
                    self.ram[idx] = val;
                }
            }

            (MbcState::Mbc2 { ram_enable, rom_bank }, 0x0000..=0x3FFF) => {
                // Address bit 8 picks the register.
                if addr & 0x0100 == 0 {
                    *ram_enable = val & 0x0F == 0x0A;
                } else {
                    let bank = val & 0x0F;
                    *rom_bank = if bank == 0 { 1 } else { bank };
                }
            }
            (MbcState::Mbc2 { ram_enable: true, .. }, 0xA000..=0xBFFF) => {
                let idx = (addr as usize - 0xA000) & 0x1FF;
                if let Some(cell) = self.ram.get_mut(idx) {
                    *cell = val & 0x0F;
                }
            }

            (MbcState::Mbc3 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                let bank = val & 0x7F;
                *rom_bank = if bank == 0 { 1 } else { bank };
            }
            (MbcState::Mbc3 { select, .. }, 0x4000..=0x5FFF) => {
                *select = val & 0x0F;
            }
            (MbcState::Mbc3 { rtc: Some(rtc), .. }, 0x6000..=0x7FFF) => {
                if rtc.latch_armed && val == 0x01 {
                    rtc.latch();
                }
                rtc.latch_armed = val == 0x00;
            }
            (
                MbcState::Mbc3 { ram_enable: true, select, rtc, .. },
                0xA000..=0xBFFF,
            ) => match (*select, rtc) {
                (reg @ 0x08..=0x0C, Some(rtc)) => rtc.write_register(reg, val),
                (bank @ 0x00..=0x03, _) => {
                    if let Some(idx) = ram_index(self.ram.len(), bank as usize, addr) {
                        self.ram[idx] = val;
                    }
                }
                _ => {}
            },

            (MbcState::Mbc5 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x2000..=0x2FFF) => {
                *rom_bank = (*rom_bank & 0x100) | u16::from(val);
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x3000..=0x3FFF) => {
                *rom_bank = (*rom_bank & 0xFF) | (u16::from(val & 0x01) << 8);
            }
            (MbcState::Mbc5 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x0F;
            }
            (MbcState::Mbc5 { ram_enable: true, ram_bank, .. }, 0xA000..=0xBFFF) => {
                if let Some(idx) = ram_index(self.ram.len(), *ram_bank as usize, addr) {
                    self.ram[idx] = val;
                }
            }

            _ => {}
        }
    }

    fn ram_read(&self, bank: usize, addr: u16) -> u8 {
        match ram_index(self.ram.len(), bank, addr) {
            Some(idx) => self.ram[idx],
            None => 0xFF,
        }
    }

    fn rtc(&self) -> Option<&Mbc3Rtc> {
        match &self.mbc_state {
            MbcState::Mbc3 { rtc, .. } => rtc.as_ref(),
            _ => None,
        }
    }

    fn rtc_mut(&mut self) -> Option<&mut Mbc3Rtc> {
        match &mut self.mbc_state {
            MbcState::Mbc3 { rtc, .. } => rtc.as_mut(),
            _ => None,
        }
    }

    /// Battery-save image: RAM bytes, plus a 16-byte RTC trailer (start
    /// instant and elapsed time, both big-endian milliseconds) when the
    /// cartridge carries a clock.
    pub fn save_image(&self) -> Vec<u8> {
        let mut data = self.ram.clone();
        if let Some(rtc) = self.rtc() {
            data.extend_from_slice(&rtc.start_millis.to_be_bytes());
            data.extend_from_slice(&rtc.elapsed_millis().to_be_bytes());
        }
        data
    }

    fn load_save(&mut self) {
        let Some(path) = self.save_path.clone() else { return };
        if !self.has_battery {
            return;
        }
        let Ok(data) = fs::read(&path) else { return };
        let ram_len = self.ram.len();
        if data.len() < ram_len {
            warn!("save file {} too short, ignoring", path.display());
            return;
        }
        self.ram.copy_from_slice(&data[..ram_len]);
        if let Some(rtc) = self.rtc_mut() {
            if data.len() >= ram_len + 16 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&data[ram_len..ram_len + 8]);
                rtc.start_millis = u64::from_be_bytes(buf);
                buf.copy_from_slice(&data[ram_len + 8..ram_len + 16]);
                let elapsed = u64::from_be_bytes(buf);
                rtc.latched = rtc.registers_from(elapsed);
            }
        }
        info!("restored battery save from {}", path.display());
    }

    /// Write battery-backed RAM (and RTC trailer) to disk. A first failure
    /// is retried once after creating the parent directory.
    pub fn save_ram(&mut self) -> io::Result<()> {
        if !self.has_battery {
            return Ok(());
        }
        let Some(path) = self.save_path.clone() else { return Ok(()) };
        let image = self.save_image();
        match fs::write(&path, &image) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("save to {} failed ({e}), retrying", path.display());
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, &image)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with(cart_type: u8, ram_size: u8) -> Vec<u8> {
        let mut rom = vec![0u8; 0x8000];
        rom[0x147] = cart_type;
        rom[0x149] = ram_size;
        rom
    }

    #[test]
    fn rom_only_defaults() {
        let cart = Cartridge::load(rom_with(0x00, 0x00)).unwrap();
        assert_eq!(cart.mbc, MbcType::None);
        assert_eq!(cart.rom_banks(), 2);
        assert!(!cart.has_battery);
        assert_eq!(cart.ram.len(), 0x2000);
        assert!(cart.ram.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn unknown_type_byte_is_fatal() {
        match Cartridge::load(rom_with(0x42, 0x00)) {
            Err(CartridgeError::Malformed { value: 0x42, .. }) => {}
            other => panic!("expected Malformed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unknown_ram_size_is_fatal() {
        assert!(Cartridge::load(rom_with(0x03, 0x09)).is_err());
    }

    #[test]
    fn mbc1_bank_zero_coerces_to_one() {
        let mut rom = vec![0u8; 4 * ROM_BANK_SIZE];
        rom[0x147] = 0x01;
        rom[0x148] = 0x01;
        for i in 0..4 {
            rom[i * ROM_BANK_SIZE] = i as u8;
        }
        let mut cart = Cartridge::load(rom).unwrap();
        assert_eq!(cart.read(0x4000), 1);
        cart.write(0x2000, 0x00);
        assert_eq!(cart.read(0x4000), 1);
        cart.write(0x2000, 0x02);
        assert_eq!(cart.read(0x4000), 2);
    }

    #[test]
    fn mbc1_skip_banks_on_five_bit_zero() {
        // 0x20 lands on 0x21 because coercion applies to the low register.
        let mut rom = vec![0u8; 64 * ROM_BANK_SIZE];
        rom[0x147] = 0x01;
        rom[0x148] = 0x05;
        for i in 0..64 {
            rom[i * ROM_BANK_SIZE] = i as u8;
        }
        let mut cart = Cartridge::load(rom).unwrap();
        cart.write(0x2000, 0x00);
        cart.write(0x4000, 0x01);
        assert_eq!(cart.read(0x4000), 0x21);
    }

    #[test]
    fn mbc2_nibble_ram() {
        let mut cart = Cartridge::load(rom_with(0x06, 0x00)).unwrap();
        assert_eq!(cart.ram.len(), 512);
        cart.write(0x0000, 0x0A);
        cart.write(0xA000, 0x3C);
        assert_eq!(cart.read(0xA000), 0xFC);
        // 512-cell wraparound
        assert_eq!(cart.read(0xA200), 0xFC);
    }

    #[test]
    fn mbc5_nine_bit_bank_and_bank_zero() {
        let mut rom = vec![0u8; 2 * ROM_BANK_SIZE];
        rom[0x147] = 0x19;
        rom[0x0000] = 0xAA;
        rom[ROM_BANK_SIZE] = 0xBB;
        let mut cart = Cartridge::load(rom).unwrap();
        cart.write(0x2000, 0x00);
        assert_eq!(cart.read(0x4000), 0xAA);
        cart.write(0x2000, 0x01);
        cart.write(0x3000, 0x01);
        // bank 0x101 % 2 banks = bank 1
        assert_eq!(cart.read(0x4000), 0xBB);
    }

    #[test]
    fn rtc_double_latch_is_stable() {
        let mut cart = Cartridge::load(rom_with(0x10, 0x03)).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write(0x6000, 0x00);
        cart.write(0x6000, 0x01);
        let first: Vec<u8> = (0x08..=0x0C)
            .map(|r| {
                cart.write(0x4000, r);
                cart.read(0xA000)
            })
            .collect();
        cart.write(0x6000, 0x00);
        cart.write(0x6000, 0x01);
        let second: Vec<u8> = (0x08..=0x0C)
            .map(|r| {
                cart.write(0x4000, r);
                cart.read(0xA000)
            })
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn rtc_day_carry_wraps_mod_512() {
        let mut cart = Cartridge::load(rom_with(0x10, 0x03)).unwrap();
        cart.write(0x0000, 0x0A);
        {
            let rtc = cart.rtc_mut().unwrap();
            // 600 days elapsed
            rtc.start_millis = now_millis() - 600 * 86_400_000;
        }
        cart.write(0x6000, 0x00);
        cart.write(0x6000, 0x01);
        cart.write(0x4000, 0x0B);
        let day_lo = cart.read(0xA000);
        cart.write(0x4000, 0x0C);
        let control = cart.read(0xA000);
        let day = u16::from(day_lo) | (u16::from(control & 0x01) << 8);
        assert_eq!(day, 600 % 512);
        assert_eq!(control & 0x80, 0x80);
    }

    #[test]
    fn rtc_halt_freezes_counter() {
        let mut cart = Cartridge::load(rom_with(0x10, 0x03)).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write(0x4000, 0x0C);
        cart.write(0xA000, 0x40);
        let before = cart.rtc().unwrap().elapsed_millis();
        let after = cart.rtc().unwrap().elapsed_millis();
        assert_eq!(before, after);
    }

    #[test]
    fn save_image_appends_rtc_trailer() {
        let mut cart = Cartridge::load(rom_with(0x10, 0x03)).unwrap();
        cart.write(0x0000, 0x0A);
        cart.write(0x4000, 0x0C);
        cart.write(0xA000, 0x40); // halt so elapsed is stable
        let image = cart.save_image();
        assert_eq!(image.len(), cart.ram.len() + 16);
        let rtc = cart.rtc().unwrap();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&image[cart.ram.len()..cart.ram.len() + 8]);
        assert_eq!(u64::from_be_bytes(buf), rtc.start_millis);
        buf.copy_from_slice(&image[cart.ram.len() + 8..]);
        assert_eq!(u64::from_be_bytes(buf), rtc.elapsed_millis());
    }
}
