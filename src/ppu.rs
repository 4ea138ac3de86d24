pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 144;

pub const MODE_HBLANK: u8 = 0;
pub const MODE_VBLANK: u8 = 1;
pub const MODE_OAM: u8 = 2;
pub const MODE_TRANSFER: u8 = 3;

const OAM_CYCLES: u32 = 80;
const TRANSFER_CYCLES: u32 = 172;
const HBLANK_CYCLES: u32 = 204;
const VBLANK_LINE_CYCLES: u32 = 456;

/// One OAM entry, kept unpacked in the draw-ordered sprite list.
#[derive(Clone, Copy, Default)]
pub struct Sprite {
    pub y: u8,
    pub x: u8,
    pub tile: u8,
    pub flags: u8,
    pub oam_index: u8,
}

/// Signals returned from [`Ppu::step`] for the frame scheduler.
#[derive(Clone, Copy, Default)]
pub struct StepEvents {
    /// Mode 3 ended and one scanline was composited.
    pub entered_hblank: bool,
    /// LY wrapped out of V-Blank; the frame buffer holds a full frame.
    pub frame_complete: bool,
}

pub struct Ppu {
    /// Two 8 KiB banks; bank 1 is reachable only in CGB mode.
    pub vram: [[u8; 0x2000]; 2],
    pub vram_bank: u8,
    pub oam: [u8; 0xA0],
    /// Draw-ordered view of OAM: ascending X, then ascending OAM index.
    sprites: [Sprite; 40],

    pub lcdc: u8,
    stat: u8,
    pub scy: u8,
    pub scx: u8,
    pub ly: u8,
    pub lyc: u8,
    pub bgp: u8,
    pub obp0: u8,
    pub obp1: u8,
    pub wy: u8,
    pub wx: u8,

    pub mode: u8,
    mode_timer: u32,
    cgb: bool,

    /// 160x144 shade indices (0-3), refreshed once per frame.
    pub frame: [u8; SCREEN_WIDTH * SCREEN_HEIGHT],
    /// Background color index (pre-palette) for the line being drawn.
    line_bg_index: [u8; SCREEN_WIDTH],
    /// CGB BG attribute priority bits for the line being drawn.
    line_bg_priority: [bool; SCREEN_WIDTH],
}

impl Ppu {
    pub fn new(cgb: bool) -> Self {
        let mut sprites = [Sprite::default(); 40];
        for (i, s) in sprites.iter_mut().enumerate() {
            s.oam_index = i as u8;
        }
        Self {
            vram: [[0; 0x2000]; 2],
            vram_bank: 0,
            oam: [0; 0xA0],
            sprites,
            lcdc: 0x91,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            bgp: 0xFC,
            obp0: 0xFF,
            obp1: 0xFF,
            wy: 0,
            wx: 0,
            mode: MODE_OAM,
            mode_timer: 0,
            cgb,
            frame: [0; SCREEN_WIDTH * SCREEN_HEIGHT],
            line_bg_index: [0; SCREEN_WIDTH],
            line_bg_priority: [false; SCREEN_WIDTH],
        }
    }

    pub fn lcd_enabled(&self) -> bool {
        self.lcdc & 0x80 != 0
    }

    /// Advance the mode state machine by `cycles`, raising STAT/VBlank
    /// interrupts through `if_reg`. The machine keeps counting with the
    /// screen off so the frame boundary still arrives; only interrupts and
    /// pixel output are suppressed then.
    pub fn step(&mut self, cycles: u32, if_reg: &mut u8) -> StepEvents {
        let mut events = StepEvents::default();
        self.mode_timer += cycles;
        loop {
            match self.mode {
                MODE_OAM => {
                    if self.mode_timer < OAM_CYCLES {
                        break;
                    }
                    self.mode_timer -= OAM_CYCLES;
                    self.mode = MODE_TRANSFER;
                }
                MODE_TRANSFER => {
                    if self.mode_timer < TRANSFER_CYCLES {
                        break;
                    }
                    self.mode_timer -= TRANSFER_CYCLES;
                    if self.lcd_enabled() {
                        self.render_scanline();
                    }
                    self.enter_mode(MODE_HBLANK, if_reg);
                    events.entered_hblank = true;
                }
                MODE_HBLANK => {
                    if self.mode_timer < HBLANK_CYCLES {
                        break;
                    }
                    self.mode_timer -= HBLANK_CYCLES;
                    self.set_ly(self.ly + 1, if_reg);
                    if self.ly == SCREEN_HEIGHT as u8 {
                        self.enter_mode(MODE_VBLANK, if_reg);
                        if self.lcd_enabled() {
                            *if_reg |= 0x01;
                        }
                    } else {
                        self.enter_mode(MODE_OAM, if_reg);
                    }
                }
                MODE_VBLANK => {
                    if self.mode_timer < VBLANK_LINE_CYCLES {
                        break;
                    }
                    self.mode_timer -= VBLANK_LINE_CYCLES;
                    if self.ly >= 153 {
                        self.set_ly(0, if_reg);
                        self.enter_mode(MODE_OAM, if_reg);
                        events.frame_complete = true;
                    } else {
                        self.set_ly(self.ly + 1, if_reg);
                    }
                }
                _ => break,
            }
        }
        #[cfg(feature = "ppu-trace")]
        log::trace!("[PPU] mode={} ly={} timer={}", self.mode, self.ly, self.mode_timer);
        events
    }

    fn enter_mode(&mut self, mode: u8, if_reg: &mut u8) {
        self.mode = mode;
        let enable_bit = match mode {
            MODE_HBLANK => 0x08,
            MODE_VBLANK => 0x10,
            MODE_OAM => 0x20,
            _ => return,
        };
        if self.lcd_enabled() && self.stat & enable_bit != 0 {
            *if_reg |= 0x02;
        }
    }

    fn set_ly(&mut self, ly: u8, if_reg: &mut u8) {
        self.ly = ly;
        if self.lcd_enabled() && self.ly == self.lyc && self.stat & 0x40 != 0 {
            *if_reg |= 0x02;
        }
    }

    pub fn read_reg(&self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                let coincidence = if self.ly == self.lyc { 0x04 } else { 0 };
                0x80 | (self.stat & 0x78) | coincidence | self.mode
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            0xFF4F => {
                if self.cgb { 0xFE | self.vram_bank } else { 0xFF }
            }
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF40 => {
                let was_on = self.lcd_enabled();
                self.lcdc = val;
                if was_on && !self.lcd_enabled() {
                    // Screen off: output falls back to shade 0 and the
                    // line counter restarts from the top.
                    self.ly = 0;
                    self.mode = MODE_OAM;
                    self.mode_timer = 0;
                    self.frame.fill(0);
                } else if !was_on && self.lcd_enabled() {
                    self.mode = MODE_OAM;
                    self.mode_timer = 0;
                }
            }
            // Bits 0-2 are hardware status, not writable.
            0xFF41 => self.stat = val & 0x78,
            0xFF42 => self.scy = val,
            0xFF43 => self.scx = val,
            0xFF44 => {} // LY is read-only
            0xFF45 => self.lyc = val,
            0xFF47 => self.bgp = val,
            0xFF48 => self.obp0 = val,
            0xFF49 => self.obp1 = val,
            0xFF4A => self.wy = val,
            0xFF4B => self.wx = val,
            0xFF4F => {
                if self.cgb {
                    self.vram_bank = val & 0x01;
                }
            }
            _ => {}
        }
    }

    pub fn read_vram(&self, addr: u16) -> u8 {
        self.vram[self.vram_bank as usize][(addr as usize) & 0x1FFF]
    }

    pub fn write_vram(&mut self, addr: u16, val: u8) {
        self.vram[self.vram_bank as usize][(addr as usize) & 0x1FFF] = val;
    }

    /// Write one OAM byte, mirroring it into the sprite list. Only a
    /// changed X coordinate triggers a re-sort.
    pub fn write_oam(&mut self, offset: usize, val: u8) {
        let old = self.oam[offset];
        self.oam[offset] = val;
        let index = (offset / 4) as u8;
        for slot in self.sprites.iter_mut() {
            if slot.oam_index != index {
                continue;
            }
            match offset & 0x03 {
                0 => slot.y = val,
                1 => slot.x = val,
                2 => slot.tile = val,
                _ => slot.flags = val,
            }
            break;
        }
        if offset & 0x03 == 1 && old != val {
            self.sort_sprites();
        }
    }

    pub fn read_oam(&self, offset: usize) -> u8 {
        self.oam[offset]
    }

    /// Rebuild the whole sprite list from OAM and sort once. Used after a
    /// DMA block lands.
    pub fn rebuild_sprites(&mut self) {
        for (i, s) in self.sprites.iter_mut().enumerate() {
            let base = i * 4;
            *s = Sprite {
                y: self.oam[base],
                x: self.oam[base + 1],
                tile: self.oam[base + 2],
                flags: self.oam[base + 3],
                oam_index: i as u8,
            };
        }
        self.sort_sprites();
    }

    fn sort_sprites(&mut self) {
        // Lower X takes the pixel; at equal X the lower OAM index does.
        self.sprites
            .sort_by(|a, b| a.x.cmp(&b.x).then(a.oam_index.cmp(&b.oam_index)));
    }

    #[cfg(test)]
    pub fn sprite_order(&self) -> Vec<u8> {
        self.sprites.iter().map(|s| s.oam_index).collect()
    }

    fn render_scanline(&mut self) {
        let y = self.ly as usize;
        if y >= SCREEN_HEIGHT {
            return;
        }
        self.line_bg_index = [0; SCREEN_WIDTH];
        self.line_bg_priority = [false; SCREEN_WIDTH];

        if self.lcdc & 0x01 != 0 {
            self.render_background(y);
            if self.lcdc & 0x20 != 0 && self.ly >= self.wy && self.wx <= 166 {
                self.render_window(y);
            }
        }
        for x in 0..SCREEN_WIDTH {
            let ci = self.line_bg_index[x];
            self.frame[y * SCREEN_WIDTH + x] = (self.bgp >> (ci * 2)) & 0x03;
        }
        if self.lcdc & 0x02 != 0 {
            self.render_sprites(y);
        }
    }

    /// Fetch one pixel's color index from a tile row in VRAM.
    fn tile_pixel(&self, bank: usize, data_addr: usize, bit: u8) -> u8 {
        let lo = (self.vram[bank][data_addr] >> bit) & 1;
        let hi = (self.vram[bank][data_addr + 1] >> bit) & 1;
        (hi << 1) | lo
    }

    fn bg_tile_fetch(&self, map_base: usize, tx: usize, ty: usize, fine_x: usize, fine_y: usize) -> (u8, bool) {
        let map_index = map_base + (ty / 8) * 32 + tx / 8;
        let tile = self.vram[0][map_index];
        let attr = if self.cgb { self.vram[1][map_index] } else { 0 };
        let bank = if attr & 0x08 != 0 { 1 } else { 0 };
        let mut row = fine_y;
        if attr & 0x40 != 0 {
            row = 7 - row;
        }
        let tile_base = if self.lcdc & 0x10 != 0 {
            tile as usize * 16
        } else {
            (0x1000i32 + (tile as i8 as i32) * 16) as usize
        };
        let bit = if attr & 0x20 != 0 { fine_x as u8 } else { 7 - fine_x as u8 };
        (self.tile_pixel(bank, tile_base + row * 2, bit), attr & 0x80 != 0)
    }

    fn render_background(&mut self, y: usize) {
        let map_base = if self.lcdc & 0x08 != 0 { 0x1C00 } else { 0x1800 };
        let by = (y + self.scy as usize) & 0xFF;
        for x in 0..SCREEN_WIDTH {
            let bx = (x + self.scx as usize) & 0xFF;
            let (ci, priority) = self.bg_tile_fetch(map_base, bx, by, bx & 7, by & 7);
            self.line_bg_index[x] = ci;
            self.line_bg_priority[x] = priority;
        }
    }

    fn render_window(&mut self, y: usize) {
        let map_base = if self.lcdc & 0x40 != 0 { 0x1C00 } else { 0x1800 };
        let wy = y - self.wy as usize;
        // WX holds the left edge plus 7; for WX < 7 the leading window
        // columns hang off-screen and the visible part starts mid-content.
        let origin = self.wx as i32 - 7;
        for x in origin.max(0)..SCREEN_WIDTH as i32 {
            let wx = (x - origin) as usize;
            let x = x as usize;
            let (ci, priority) = self.bg_tile_fetch(map_base, wx, wy, wx & 7, wy & 7);
            self.line_bg_index[x] = ci;
            self.line_bg_priority[x] = priority;
        }
    }

    fn render_sprites(&mut self, y: usize) {
        let height = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
        let mut claimed = [false; SCREEN_WIDTH];
        for s in self.sprites.iter() {
            let sy = s.y as i32 - 16;
            let sx = s.x as i32 - 8;
            let line = y as i32 - sy;
            if line < 0 || line >= height {
                continue;
            }
            let mut row = line as usize;
            if s.flags & 0x40 != 0 {
                row = (height as usize - 1) - row;
            }
            let tile = if height == 16 { s.tile & 0xFE } else { s.tile } as usize;
            let data_addr = tile * 16 + row * 2;
            let bank = if self.cgb && s.flags & 0x08 != 0 { 1 } else { 0 };
            let palette = if s.flags & 0x10 != 0 { self.obp1 } else { self.obp0 };
            for px in 0..8i32 {
                let x = sx + px;
                if !(0..SCREEN_WIDTH as i32).contains(&x) {
                    continue;
                }
                let x = x as usize;
                if claimed[x] {
                    continue;
                }
                let bit = if s.flags & 0x20 != 0 { px as u8 } else { 7 - px as u8 };
                let ci = self.tile_pixel(bank, data_addr, bit);
                if ci == 0 {
                    continue;
                }
                // The first sprite in draw order owns the pixel; the BG
                // priority bits then decide what actually shows.
                claimed[x] = true;
                let behind_bg = s.flags & 0x80 != 0 || self.line_bg_priority[x];
                if behind_bg && self.line_bg_index[x] != 0 {
                    continue;
                }
                self.frame[y * SCREEN_WIDTH + x] = (palette >> (ci * 2)) & 0x03;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_timing_round_trip() {
        let mut ppu = Ppu::new(false);
        let mut if_reg = 0;
        assert_eq!(ppu.mode, MODE_OAM);
        ppu.step(80, &mut if_reg);
        assert_eq!(ppu.mode, MODE_TRANSFER);
        ppu.step(172, &mut if_reg);
        assert_eq!(ppu.mode, MODE_HBLANK);
        ppu.step(204, &mut if_reg);
        assert_eq!(ppu.mode, MODE_OAM);
        assert_eq!(ppu.ly, 1);
    }

    #[test]
    fn vblank_fires_at_line_144() {
        let mut ppu = Ppu::new(false);
        let mut if_reg = 0;
        for _ in 0..144 {
            ppu.step(456, &mut if_reg);
        }
        assert_eq!(ppu.mode, MODE_VBLANK);
        assert_eq!(ppu.ly, 144);
        assert_eq!(if_reg & 0x01, 0x01);
    }

    #[test]
    fn frame_completes_after_154_lines() {
        let mut ppu = Ppu::new(false);
        let mut if_reg = 0;
        let mut done = false;
        for _ in 0..154 {
            done = ppu.step(456, &mut if_reg).frame_complete;
        }
        assert!(done);
        assert_eq!(ppu.ly, 0);
        assert_eq!(ppu.mode, MODE_OAM);
    }

    #[test]
    fn lcd_off_clears_frame_but_keeps_counting() {
        let mut ppu = Ppu::new(false);
        let mut if_reg = 0;
        ppu.step(456 * 3, &mut if_reg);
        ppu.frame[0] = 3;
        ppu.write_reg(0xFF41, 0x78); // every STAT source enabled
        ppu.write_reg(0xFF40, 0x11); // bit 7 clear
        assert_eq!(ppu.ly, 0);
        assert_eq!(ppu.frame[0], 0);

        if_reg = 0;
        let mut done = false;
        for _ in 0..154 {
            done |= ppu.step(456, &mut if_reg).frame_complete;
        }
        assert!(done, "frame boundary still arrives with the screen off");
        assert_eq!(if_reg, 0, "no VBlank or STAT interrupts while off");
        assert!(ppu.frame.iter().all(|&p| p == 0));
    }

    #[test]
    fn stat_mode_interrupts_respect_enable_bits() {
        let mut ppu = Ppu::new(false);
        let mut if_reg = 0;
        ppu.step(80 + 172, &mut if_reg);
        assert_eq!(if_reg & 0x02, 0, "H-Blank STAT not enabled yet");
        ppu.write_reg(0xFF41, 0x08);
        ppu.step(204 + 80 + 172, &mut if_reg);
        assert_eq!(if_reg & 0x02, 0x02);
    }

    #[test]
    fn lyc_match_raises_stat() {
        let mut ppu = Ppu::new(false);
        let mut if_reg = 0;
        ppu.write_reg(0xFF41, 0x40);
        ppu.write_reg(0xFF45, 2);
        ppu.step(456, &mut if_reg);
        assert_eq!(if_reg & 0x02, 0);
        ppu.step(456, &mut if_reg);
        assert_eq!(if_reg & 0x02, 0x02);
        assert_eq!(ppu.read_reg(0xFF41) & 0x04, 0x04);
    }

    #[test]
    fn sprites_sort_on_x_writes_only() {
        let mut ppu = Ppu::new(false);
        // sprite 0 at x=50, sprite 1 at x=10
        ppu.write_oam(1, 50);
        ppu.write_oam(5, 10);
        let order = ppu.sprite_order();
        let pos0 = order.iter().position(|&i| i == 0).unwrap();
        let pos1 = order.iter().position(|&i| i == 1).unwrap();
        assert!(pos1 < pos0, "lower X should sort first");

        // Equal X: ascending index
        ppu.write_oam(5, 50);
        let order = ppu.sprite_order();
        let pos0 = order.iter().position(|&i| i == 0).unwrap();
        let pos1 = order.iter().position(|&i| i == 1).unwrap();
        assert!(pos0 < pos1, "equal X sorts by ascending index");
    }

    #[test]
    fn equal_x_pixel_goes_to_lower_oam_index() {
        let mut ppu = Ppu::new(false);
        // Tile 1: every pixel color index 3.
        for i in 16..32 {
            ppu.vram[0][i] = 0xFF;
        }
        // Sprites 0 and 1 both cover the top-left pixel; they differ only
        // in which object palette they use.
        for (base, flags) in [(0usize, 0x00u8), (4, 0x10)] {
            ppu.write_oam(base, 16); // y
            ppu.write_oam(base + 1, 8); // x
            ppu.write_oam(base + 2, 1); // tile
            ppu.write_oam(base + 3, flags);
        }
        ppu.write_reg(0xFF40, 0x82); // LCD on, sprites on, BG off
        ppu.write_reg(0xFF48, 0xC0); // OBP0: index 3 -> shade 3
        ppu.write_reg(0xFF49, 0x00); // OBP1: index 3 -> shade 0
        let mut if_reg = 0;
        ppu.step(80 + 172, &mut if_reg);
        assert_eq!(ppu.frame[0], 3, "sprite 0 wins the tie");
    }

    #[test]
    fn window_left_of_screen_starts_mid_content() {
        let mut ppu = Ppu::new(false);
        // Tile 0 row 0: only the rightmost pixel (column 7) is lit.
        ppu.vram[0][0] = 0x01;
        ppu.write_reg(0xFF40, 0xB1); // LCD, BG, window on, 8000 addressing
        ppu.write_reg(0xFF47, 0b1110_0100); // identity palette
        ppu.write_reg(0xFF4A, 0); // WY
        ppu.write_reg(0xFF4B, 0); // WX: left edge 7 pixels off-screen
        let mut if_reg = 0;
        ppu.step(80 + 172, &mut if_reg);
        // Screen x=0 shows window content column 7, not column 0.
        assert_eq!(ppu.frame[0], 1);
        assert_eq!(ppu.frame[1], 0);
    }

    #[test]
    fn background_uses_palette_shades() {
        let mut ppu = Ppu::new(false);
        // Tile 0: all pixels color index 3.
        for i in 0..16 {
            ppu.vram[0][i] = 0xFF;
        }
        // BG map already points every entry at tile 0.
        ppu.write_reg(0xFF40, 0x91); // LCD on, BG on, 8000 addressing
        ppu.write_reg(0xFF47, 0b0001_1011); // palette maps 3 -> 0
        let mut if_reg = 0;
        ppu.step(80 + 172, &mut if_reg);
        assert_eq!(ppu.frame[0], 0);
        ppu.write_reg(0xFF47, 0b1110_0100); // identity palette
        ppu.step(204 + 80 + 172, &mut if_reg);
        assert_eq!(ppu.frame[SCREEN_WIDTH], 3);
    }
}
