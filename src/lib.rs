//! Game Boy / Game Boy Color hardware emulation core.
//!
//! This crate contains the platform-agnostic emulator logic: the LR35902
//! interpreter, the memory bus with bank-switched cartridge access, the LCD
//! timing/rendering state machine, the interrupt/timer plumbing, and a
//! reduced-depth audio synthesizer. Frontends drive it through the
//! [`gameboy`] facade one frame at a time.

/// Audio Processing Unit (APU) emulation.
pub mod apu;

/// Lock-free audio ring buffer used by the APU.
pub mod audio_queue;

/// Cartridge mappers (MBC), ROM/RAM banking, RTC, and battery saves.
pub mod cartridge;

/// LR35902 CPU core.
pub mod cpu;

/// High-level facade that wires the CPU and bus into a single machine.
pub mod gameboy;

/// Joypad register and interrupt behavior.
pub mod input;

/// Memory map and hardware plumbing.
pub mod mmu;

/// Pixel Processing Unit (PPU) emulation.
pub mod ppu;

/// Divider/timer unit.
pub mod timer;
