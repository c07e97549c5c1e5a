//! Architecture dependent interface to initialize a thread and to drive the
//! scheduler from the timer tick and the software scheduler vector.

use alloc::alloc::{Layout, alloc, dealloc};
use core::{mem, ptr};

use align_address::Align;

use crate::arch::x86::kernel::core_local::{CoreLocal, core_id, try_core_scheduler};
use crate::arch::x86::kernel::interrupts::{self, IrqState, SCHEDULER_INT_LINE};
use crate::arch::x86::kernel::{apic, pit};
use crate::arch::x86::mm::VirtAddr;
use crate::config::{KERNEL_STACK_SIZE, TIMER_FREQUENCY_IN_HZ};
use crate::error::{KernelError, Result};
use crate::scheduler::task::{Thread, ThreadFrame};

/// Stack layout consumed by the context switch: the `pusha` image, EFLAGS
/// and the address execution resumes at.
#[allow(dead_code)]
#[repr(C, packed)]
struct State {
	edi: usize,
	esi: usize,
	ebp: usize,
	esp: usize,
	ebx: usize,
	edx: usize,
	ecx: usize,
	eax: usize,
	eflags: usize,
	eip: usize,
}

pub struct CommonStack {
	start: VirtAddr,
	layout: Layout,
}

/// The stack backing a thread. The boot stack of a CPU is inherited by its
/// idle thread and never reclaimed.
pub enum ThreadStacks {
	Boot,
	Common(CommonStack),
}

impl ThreadStacks {
	/// Size of the debug marker at the very top of each stack.
	pub const MARKER_SIZE: usize = 0x10;

	pub fn new(size: usize) -> Result<ThreadStacks> {
		// Round the requested size up to whole words and enforce a sane
		// minimum.
		let size = size.max(KERNEL_STACK_SIZE).align_up(mem::size_of::<usize>());
		let layout = Layout::from_size_align(size, 16).map_err(|_| KernelError::Align)?;
		let start = unsafe { alloc(layout) };

		if start.is_null() {
			return Err(KernelError::MallocFailed);
		}

		Ok(ThreadStacks::Common(CommonStack {
			start: VirtAddr::from_ptr(start),
			layout,
		}))
	}

	pub fn from_boot_stacks() -> ThreadStacks {
		ThreadStacks::Boot
	}

	pub fn get_stack_address(&self) -> VirtAddr {
		match self {
			ThreadStacks::Boot => VirtAddr::zero(),
			ThreadStacks::Common(stack) => stack.start,
		}
	}

	pub fn get_stack_size(&self) -> usize {
		match self {
			ThreadStacks::Boot => KERNEL_STACK_SIZE,
			ThreadStacks::Common(stack) => stack.layout.size(),
		}
	}
}

impl Drop for ThreadStacks {
	fn drop(&mut self) {
		match self {
			ThreadStacks::Boot => {}
			ThreadStacks::Common(stack) => {
				debug!(
					"Deallocating stack at {:#x} ({} KiB)",
					stack.start,
					stack.layout.size() >> 10
				);
				unsafe {
					dealloc(stack.start.as_mut_ptr(), stack.layout);
				}
			}
		}
	}
}

/// First code of every thread. The crafted `pusha` image carries the entry
/// function in `eax` and its argument in `edx`; hand both to the Rust-level
/// wrapper with interrupts enabled.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[unsafe(naked)]
extern "C" fn thread_start() -> ! {
	core::arch::naked_asm!(
		"sti",
		"push edx",
		"push eax",
		"call {entry}",
		entry = sym crate::scheduler::thread_entry,
	)
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
extern "C" fn thread_start() -> ! {
	unreachable!()
}

impl ThreadFrame for Thread {
	fn create_stack_frame(&mut self, func: extern "C" fn(usize) -> i32, arg: usize) {
		unsafe {
			// The marker at the very top must survive; it flags stack
			// overruns during debugging.
			let mut stack = self.stacks.get_stack_address() + self.stacks.get_stack_size()
				- ThreadStacks::MARKER_SIZE;
			*stack.as_mut_ptr::<usize>() = 0xdead_beef;

			stack = stack - mem::size_of::<State>();
			let state = stack.as_mut_ptr::<State>();
			ptr::write_bytes(stack.as_mut_ptr::<u8>(), 0, mem::size_of::<State>());

			(*state).eip = thread_start as usize;
			(*state).eax = func as usize;
			(*state).edx = arg;
			// Only the always-one flag; interrupts stay off until
			// `thread_start` runs its `sti`.
			(*state).eflags = 0x0002;

			self.last_stack_pointer = stack;
		}
	}
}

/// The periodic tick. Global time is kept by CPU 0; every CPU drains its
/// own sleeping queue and asks for a reschedule.
fn timer_tick_handler(_state: &mut IrqState) {
	if core_id() == 0 {
		crate::time::tick();
	}

	if let Some(scheduler) = try_core_scheduler() {
		scheduler.handle_waiting_threads();
		CoreLocal::get().request_reschedule();
	}
}

/// The software scheduler vector raised by `schedule()`.
fn scheduler_interrupt_handler(_state: &mut IrqState) {
	if try_core_scheduler().is_some() {
		CoreLocal::get().request_reschedule();
	}
}

/// Register the scheduler entry points and start the tick source of the
/// calling CPU.
pub fn install_timer_handler() {
	interrupts::register_int_handler(SCHEDULER_INT_LINE, scheduler_interrupt_handler).unwrap();

	if apic::is_initialized() {
		interrupts::register_int_handler(apic::TIMER_INT_LINE, timer_tick_handler).unwrap();
		apic::init_lapic_timer();
	} else {
		interrupts::register_irq_handler(pit::PIT_IRQ, timer_tick_handler).unwrap();
		pit::init(TIMER_FREQUENCY_IN_HZ);
	}
}
