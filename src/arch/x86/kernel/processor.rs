//! Low-level processor intrinsics.
//!
//! Everything above this module is architecture-neutral; control-register
//! access, the interrupt flag and busy waiting are confined to this file.

#[cfg(target_os = "none")]
use core::arch::asm;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(target_os = "none")]
use x86::io::outb;

use crate::arch::x86::mm::PhysAddr;

/// TSC ticks per microsecond, measured against the PIT during boot.
static CPU_FREQUENCY: AtomicU64 = AtomicU64::new(0);

/// The EFLAGS bit that enables maskable hardware interrupts.
pub const EFLAGS_IF: usize = 1 << 9;

#[cfg(target_os = "none")]
pub fn halt() {
	unsafe {
		asm!("hlt", options(nomem, nostack, preserves_flags));
	}
}

#[cfg(not(target_os = "none"))]
pub fn halt() {
	spin_loop();
}

/// Park the processor for good. Used by the panic path and the halt banner.
pub fn shutdown() -> ! {
	loop {
		#[cfg(target_os = "none")]
		unsafe {
			asm!("cli", "hlt", options(nomem, nostack));
		}
		#[cfg(not(target_os = "none"))]
		spin_loop();
	}
}

#[cfg(target_os = "none")]
#[inline]
pub fn rdtsc() -> u64 {
	let lo: u32;
	let hi: u32;

	unsafe {
		asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack, preserves_flags));
	}
	(u64::from(hi) << 32) | u64::from(lo)
}

#[cfg(not(target_os = "none"))]
pub fn rdtsc() -> u64 {
	static FAKE_TSC: AtomicU64 = AtomicU64::new(0);
	FAKE_TSC.fetch_add(1000, Ordering::Relaxed)
}

#[cfg(target_os = "none")]
#[inline]
pub fn read_cr0() -> usize {
	let value;
	unsafe {
		asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags));
	}
	value
}

#[cfg(target_os = "none")]
#[inline]
pub fn write_cr0(value: usize) {
	unsafe {
		asm!("mov cr0, {}", in(reg) value, options(nomem, nostack, preserves_flags));
	}
}

#[cfg(target_os = "none")]
#[inline]
pub fn read_cr2() -> usize {
	let value;
	unsafe {
		asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
	}
	value
}

#[cfg(target_os = "none")]
#[inline]
pub fn read_cr3() -> PhysAddr {
	let value;
	unsafe {
		asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
	}
	PhysAddr::new(value)
}

#[cfg(target_os = "none")]
#[inline]
pub fn write_cr3(addr: PhysAddr) {
	unsafe {
		asm!("mov cr3, {}", in(reg) addr.as_usize(), options(nostack, preserves_flags));
	}
}

#[cfg(not(target_os = "none"))]
pub fn read_cr0() -> usize {
	0
}

#[cfg(not(target_os = "none"))]
pub fn write_cr0(_value: usize) {}

#[cfg(not(target_os = "none"))]
pub fn read_cr2() -> usize {
	0
}

#[cfg(not(target_os = "none"))]
pub fn read_cr3() -> PhysAddr {
	PhysAddr::zero()
}

#[cfg(not(target_os = "none"))]
pub fn write_cr3(_addr: PhysAddr) {}

/// Clear the CR0 task-switched bit so that the next FPU instruction no
/// longer traps.
#[cfg(target_os = "none")]
#[inline]
pub fn clear_task_switched_flag() {
	unsafe {
		asm!("clts", options(nomem, nostack, preserves_flags));
	}
}

#[cfg(not(target_os = "none"))]
pub fn clear_task_switched_flag() {}

/// A 512 byte region for the FXSAVE/FXRSTOR instruction pair.
#[repr(C, align(16))]
pub struct FpuState([u8; 512]);

impl FpuState {
	pub const fn new() -> Self {
		Self([0; 512])
	}

	#[cfg(target_os = "none")]
	pub fn save(&mut self) {
		unsafe {
			asm!("fxsave [{}]", in(reg) self.0.as_mut_ptr(), options(nostack));
		}
	}

	#[cfg(target_os = "none")]
	pub fn restore(&self) {
		unsafe {
			asm!("fxrstor [{}]", in(reg) self.0.as_ptr(), options(nostack, readonly));
		}
	}

	#[cfg(not(target_os = "none"))]
	pub fn save(&mut self) {}

	#[cfg(not(target_os = "none"))]
	pub fn restore(&self) {}
}

impl Default for FpuState {
	fn default() -> Self {
		Self::new()
	}
}

/// Measure the TSC frequency against PIT channel 2 and remember it for
/// `udelay`. Only called once on the boot processor.
#[cfg(target_os = "none")]
pub fn detect_frequency() {
	const PIT_CLOCK: u64 = 1_193_182;
	const CALIBRATION_MS: u64 = 10;

	let reload = (PIT_CLOCK * CALIBRATION_MS / 1000) as u16;

	unsafe {
		// Gate channel 2 off, program one-shot countdown, then gate it on.
		let gate = x86::io::inb(0x61) & !0x03;
		outb(0x61, gate);
		outb(0x43, 0b1011_0000);
		outb(0x42, reload as u8);
		outb(0x42, (reload >> 8) as u8);

		let start = rdtsc();
		outb(0x61, gate | 0x01);

		// Wait for the countdown to cross zero (OUT2 goes high).
		while x86::io::inb(0x61) & 0x20 == 0 {
			spin_loop();
		}

		let cycles = rdtsc() - start;
		CPU_FREQUENCY.store(cycles / (CALIBRATION_MS * 1000), Ordering::Relaxed);
	}

	info!(
		"Measured processor frequency: {} MHz",
		CPU_FREQUENCY.load(Ordering::Relaxed)
	);
}

#[cfg(not(target_os = "none"))]
pub fn detect_frequency() {
	CPU_FREQUENCY.store(1000, Ordering::Relaxed);
}

/// Busy-wait for the given number of microseconds.
pub fn udelay(usecs: u64) {
	let frequency = CPU_FREQUENCY.load(Ordering::Relaxed).max(1);
	let deadline = rdtsc() + usecs * frequency;

	while rdtsc() < deadline {
		spin_loop();
	}
}
