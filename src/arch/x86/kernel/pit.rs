//! Driver for the programmable interval timer.
//!
//! The PIT delivers the periodic scheduler tick on machines without a
//! usable local APIC timer and serves as the calibration reference
//! everywhere else.

#![allow(dead_code)]

#[cfg(target_os = "none")]
use x86::io::outb;

use crate::arch::x86::kernel::interrupts;

const PIT_CLOCK: u64 = 1_193_182;

/// The PIT is wired to IRQ 0.
pub const PIT_IRQ: u32 = 0;

const PIT_CHANNEL0_DATA_PORT: u16 = 0x40;
const PIT_COMMAND_PORT: u16 = 0x43;

const PIT_BINARY_OUTPUT: u8 = 0b0000_0000;
const PIT_RATE_GENERATOR_MODE: u8 = 0b0000_0100;
const PIT_LOBYTE_ACCESS: u8 = 0b0001_0000;
const PIT_HIBYTE_ACCESS: u8 = 0b0010_0000;
const PIT_CHANNEL0: u8 = 0b0000_0000;

pub fn init(frequency_in_hz: u64) {
	interrupts::set_irq_mask(PIT_IRQ, false).unwrap();

	#[cfg(target_os = "none")]
	unsafe {
		outb(
			PIT_COMMAND_PORT,
			PIT_BINARY_OUTPUT
				| PIT_RATE_GENERATOR_MODE
				| PIT_LOBYTE_ACCESS
				| PIT_HIBYTE_ACCESS
				| PIT_CHANNEL0,
		);

		// Round the reload value to the closest integer.
		let count = (PIT_CLOCK + frequency_in_hz / 2) / frequency_in_hz;
		outb(PIT_CHANNEL0_DATA_PORT, count as u8);
		outb(PIT_CHANNEL0_DATA_PORT, (count >> 8) as u8);
	}
	#[cfg(not(target_os = "none"))]
	let _ = frequency_in_hz;
}

pub fn deinit() {
	interrupts::set_irq_mask(PIT_IRQ, true).unwrap();
}
