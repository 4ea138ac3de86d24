use log::warn;

use crate::apu::Apu;
use crate::cartridge::Cartridge;
use crate::input::Input;
use crate::ppu::Ppu;
use crate::timer::Timer;

/// CGB VRAM DMA (FF51-FF55) progress.
struct HdmaState {
    src: u16,
    dst: u16,
    /// 16-byte blocks still to copy.
    blocks: u8,
    active: bool,
    cancelled: bool,
}

impl HdmaState {
    fn new() -> Self {
        Self { src: 0, dst: 0, blocks: 0, active: false, cancelled: false }
    }
}

/// The 64K address space the CPU sees, explicitly constructed and owned by
/// the emulation session.
pub struct Mmu {
    pub cart: Option<Cartridge>,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub input: Input,

    wram: [[u8; 0x1000]; 8],
    wram_bank: u8,
    hram: [u8; 0x7F],
    pub if_reg: u8,
    pub ie_reg: u8,

    /// FF46 readback value.
    dma_reg: u8,
    sb: u8,
    sc: u8,
    cgb: bool,
    hdma: HdmaState,
}

impl Mmu {
    pub fn new(cgb: bool) -> Self {
        Self {
            cart: None,
            ppu: Ppu::new(cgb),
            apu: Apu::new(),
            timer: Timer::new(),
            input: Input::new(),
            wram: [[0; 0x1000]; 8],
            wram_bank: 1,
            hram: [0; 0x7F],
            // VBlank is pending when the boot ROM hands over.
            if_reg: 0xE1,
            ie_reg: 0,
            dma_reg: 0,
            sb: 0,
            sc: 0,
            cgb,
            hdma: HdmaState::new(),
        }
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    pub fn read_byte(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                self.cart.as_ref().map_or(0xFF, |c| c.read(addr))
            }
            0x8000..=0x9FFF => self.ppu.read_vram(addr),
            0xC000..=0xCFFF => self.wram[0][(addr as usize) & 0x0FFF],
            0xD000..=0xDFFF => self.wram[self.wram_bank as usize][(addr as usize) & 0x0FFF],
            // Echo of C000-DDFF
            0xE000..=0xFDFF => self.read_byte(addr - 0x2000),
            0xFE00..=0xFE9F => self.ppu.read_oam((addr as usize) - 0xFE00),
            0xFEA0..=0xFEFF => 0x00,
            0xFF00 => self.input.read(),
            0xFF01 => self.sb,
            0xFF02 => self.sc | 0x7E,
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => self.if_reg | 0xE0,
            0xFF10..=0xFF3F => self.apu.read(addr),
            0xFF46 => self.dma_reg,
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B | 0xFF4F => self.ppu.read_reg(addr),
            0xFF51..=0xFF54 if self.cgb => 0xFF, // write-only setup registers
            0xFF55 if self.cgb => {
                if self.hdma.active {
                    (self.hdma.blocks - 1) & 0x7F
                } else if self.hdma.cancelled {
                    0x80 | (self.hdma.blocks.wrapping_sub(1) & 0x7F)
                } else {
                    0xFF
                }
            }
            0xFF70 if self.cgb => 0xF8 | self.wram_bank,
            0xFF80..=0xFFFE => self.hram[(addr as usize) - 0xFF80],
            0xFFFF => self.ie_reg,
            _ => {
                warn!("unmapped read addr={addr:04X}");
                0xFF
            }
        }
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                if let Some(cart) = self.cart.as_mut() {
                    cart.write(addr, val);
                }
            }
            0x8000..=0x9FFF => self.ppu.write_vram(addr, val),
            0xC000..=0xCFFF => self.wram[0][(addr as usize) & 0x0FFF] = val,
            0xD000..=0xDFFF => {
                self.wram[self.wram_bank as usize][(addr as usize) & 0x0FFF] = val;
            }
            0xE000..=0xFDFF => self.write_byte(addr - 0x2000, val),
            0xFE00..=0xFE9F => self.ppu.write_oam((addr as usize) - 0xFE00, val),
            0xFEA0..=0xFEFF => {}
            0xFF00 => self.input.write(val),
            0xFF01 => self.sb = val,
            0xFF02 => self.sc = val,
            0xFF04..=0xFF07 => self.timer.write(addr, val),
            0xFF0F => self.if_reg = val & 0x1F,
            0xFF10..=0xFF3F => self.apu.write(addr, val),
            0xFF46 => self.oam_dma(val),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B | 0xFF4F => self.ppu.write_reg(addr, val),
            0xFF51 if self.cgb => self.hdma.src = (self.hdma.src & 0x00FF) | (u16::from(val) << 8),
            0xFF52 if self.cgb => {
                self.hdma.src = (self.hdma.src & 0xFF00) | u16::from(val & 0xF0);
            }
            0xFF53 if self.cgb => {
                self.hdma.dst = (self.hdma.dst & 0x00FF) | (u16::from(val) << 8);
            }
            0xFF54 if self.cgb => {
                self.hdma.dst = (self.hdma.dst & 0xFF00) | u16::from(val & 0xF0);
            }
            0xFF55 if self.cgb => self.start_vram_dma(val),
            0xFF70 if self.cgb => {
                let bank = val & 0x07;
                self.wram_bank = if bank == 0 { 1 } else { bank };
            }
            0xFF80..=0xFFFE => self.hram[(addr as usize) - 0xFF80] = val,
            0xFFFF => self.ie_reg = val,
            _ => {
                warn!("unmapped write addr={addr:04X} val={val:02X}");
            }
        }
    }

    /// Synchronous 160-byte copy into OAM; the sprite list is rebuilt and
    /// sorted once at the end.
    fn oam_dma(&mut self, val: u8) {
        self.dma_reg = val;
        let src = u16::from(val) << 8;
        for i in 0..0xA0u16 {
            let byte = self.read_byte(src + i);
            self.ppu.oam[i as usize] = byte;
        }
        self.ppu.rebuild_sprites();
    }

    /// Destination is constrained to VRAM regardless of what was written.
    fn vram_dma_dest(&self) -> u16 {
        0x8000 | (self.hdma.dst & 0x1FF0)
    }

    fn start_vram_dma(&mut self, val: u8) {
        if self.hdma.active && val & 0x80 == 0 {
            // Pausing an H-Blank transfer mid-flight.
            self.hdma.active = false;
            self.hdma.cancelled = true;
            return;
        }
        self.hdma.blocks = (val & 0x7F) + 1;
        self.hdma.cancelled = false;
        if val & 0x80 != 0 {
            self.hdma.active = true;
        } else {
            // General-purpose mode copies everything immediately.
            while self.hdma.blocks > 0 {
                self.copy_vram_dma_block();
            }
        }
    }

    fn copy_vram_dma_block(&mut self) {
        let src = self.hdma.src & 0xFFF0;
        let dst = self.vram_dma_dest();
        for i in 0..16 {
            let byte = self.read_byte(src.wrapping_add(i));
            self.ppu.write_vram(dst.wrapping_add(i), byte);
        }
        self.hdma.src = src.wrapping_add(16);
        self.hdma.dst = dst.wrapping_add(16);
        self.hdma.blocks -= 1;
    }

    /// Run one H-Blank DMA block if one is due. Returns the cycles it
    /// consumed so the scheduler can feed them back into Timer/APU.
    pub fn hdma_hblank_transfer(&mut self) -> u32 {
        if !self.hdma.active || self.hdma.blocks == 0 {
            return 0;
        }
        self.copy_vram_dma_block();
        if self.hdma.blocks == 0 {
            self.hdma.active = false;
        }
        8
    }

    /// Feed elapsed CPU cycles to the timer, PPU, and APU. Returns true at
    /// the frame boundary.
    pub fn tick(&mut self, cycles: u32) -> bool {
        self.timer.step(cycles, &mut self.if_reg);
        let events = self.ppu.step(cycles, &mut self.if_reg);
        self.apu.step(cycles);
        if events.entered_hblank {
            let extra = self.hdma_hblank_transfer();
            if extra > 0 {
                self.timer.step(extra, &mut self.if_reg);
                self.apu.step(extra);
            }
        }
        events.frame_complete
    }
}
