use std::io;
use std::path::Path;

use crate::audio_queue::SampleConsumer;
use crate::cartridge::{Cartridge, CartridgeError};
use crate::cpu::{Cpu, DecodeError};
use crate::input::Button;
use crate::mmu::Mmu;

/// A complete machine: CPU plus bus, driven one frame at a time.
///
/// The host calls [`run_frame`](Self::run_frame) on its own cadence (one
/// call per display refresh), reads the frame buffer, and drains the audio
/// queue from its playback callback.
pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
}

impl GameBoy {
    /// Power up with a loaded cartridge. Color mode follows the header's
    /// CGB flag.
    pub fn new(cart: Cartridge) -> Self {
        let cgb = cart.cgb_flag();
        let mut mmu = Mmu::new(cgb);
        mmu.load_cart(cart);
        Self { cpu: Cpu::new(cgb), mmu }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        Ok(Self::new(Cartridge::from_file(path)?))
    }

    /// Run CPU steps, feeding elapsed cycles to the timer, PPU, and APU,
    /// until the PPU completes a full frame. Interrupt acknowledgement
    /// runs between steps and its cycles are fed through the same path.
    pub fn run_frame(&mut self) -> Result<(), DecodeError> {
        loop {
            let cycles = self.cpu.step(&mut self.mmu)?;
            let mut frame_done = self.mmu.tick(cycles);
            let dispatch = self.cpu.service_interrupt(&mut self.mmu);
            if dispatch > 0 {
                frame_done |= self.mmu.tick(dispatch);
            }
            if frame_done {
                return Ok(());
            }
        }
    }

    /// 160x144 grid of 2-bit shade indices, refreshed by `run_frame`.
    pub fn frame(&self) -> &[u8] {
        &self.mmu.ppu.frame
    }

    /// Handle for draining synthesized audio samples.
    pub fn samples(&self) -> SampleConsumer {
        self.mmu.apu.samples()
    }

    pub fn press(&mut self, button: Button) {
        self.mmu.input.press(button, &mut self.mmu.if_reg);
    }

    pub fn release(&mut self, button: Button) {
        self.mmu.input.release(button);
    }

    /// Snapshot battery-backed RAM to disk. Intended for session teardown.
    pub fn save_cartridge_ram(&mut self) -> io::Result<()> {
        match self.mmu.cart.as_mut() {
            Some(cart) => cart.save_ram(),
            None => Ok(()),
        }
    }

    pub fn title(&self) -> String {
        self.mmu.cart.as_ref().map(|c| c.title()).unwrap_or_default()
    }
}
