//! A small multi-core kernel for 32-bit x86.
//!
//! The crate boots on bare hardware, brings up the application processors,
//! runs kernel threads under a strict-priority preemptive scheduler and
//! serves a USTAR-formatted RAM disk through a vnode layer. On a hosted
//! target only the hardware-independent logic is compiled, which is what
//! the unit tests run against.

#![no_std]
#![allow(clippy::missing_safety_doc)]

// EXTERNAL CRATES
#[macro_use]
extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[cfg(not(target_os = "none"))]
#[macro_use]
extern crate std;

#[macro_use]
mod macros;

pub mod arch;
mod config;
mod console;
mod drivers;
pub mod env;
mod error;
pub mod fs;
mod logging;
mod mm;
#[cfg(target_os = "none")]
mod runtime_glue;
pub mod scheduler;
pub mod synch;
pub mod time;

pub use crate::config::DEFAULT_STACK_SIZE;
pub use crate::error::{KernelError, Result};

use crate::arch::x86::kernel::core_local;
use crate::scheduler::task::NORMAL_PRIO;
use crate::scheduler::{PerCoreScheduler, SystemState};

use crate::synch::mailbox::Mailbox;
use crate::synch::queue::BoundedQueue;

static WORKER_RESULT: Mailbox<i32> = Mailbox::new();

/// Consumes numbers from the shared queue until the zero marker arrives,
/// then reports the sum through the rendezvous mailbox.
extern "C" fn worker_thread(arg: usize) -> i32 {
	let queue = unsafe { &*(arg as *const BoundedQueue<u32>) };
	let mut sum: i32 = 0;

	loop {
		match queue.pend() {
			Ok(0) => break,
			Ok(value) => sum += value as i32,
			Err(err) => {
				warn!("Worker queue died: {err}");
				break;
			}
		}
	}

	WORKER_RESULT
		.post(sum)
		.expect("result mailbox disappeared");
	sum
}

/// Entry of the `main` thread, the first piece of code that runs with the
/// whole kernel at its disposal.
extern "C" fn main_thread(_arg: usize) -> i32 {
	info!("Hello from the main thread");

	match fs::readdir("/") {
		Ok(entries) => {
			info!("The RAM disk root holds {} entries:", entries.len());
			for entry in &entries {
				info!("  /{}", entry.name);
			}
		}
		Err(err) => warn!("No root directory to list: {err}"),
	}

	// Exchange some work with a second thread: numbers flow through a
	// bounded queue, the result comes back through a mailbox.
	let queue: &'static BoundedQueue<u32> = alloc::boxed::Box::leak(alloc::boxed::Box::new(
		BoundedQueue::new(4),
	));
	let worker_id = scheduler::spawn(
		"worker",
		worker_thread,
		core::ptr::from_ref(queue) as usize,
		NORMAL_PRIO,
		DEFAULT_STACK_SIZE,
		None,
	)
	.expect("unable to create the worker thread");

	for value in 1..=10u32 {
		queue.post(value).expect("worker queue disappeared");
	}
	queue.post(0).expect("worker queue disappeared");

	let sum = WORKER_RESULT.pend().expect("result mailbox disappeared");
	info!("Worker summed the queue to {sum}");

	let _ = scheduler::sleep(100);
	match scheduler::join(worker_id) {
		Ok((code, cause)) => debug!("Worker exited with code {code} ({cause:?})"),
		Err(err) => warn!("Worker vanished early: {err}"),
	}

	(sum != 55) as i32
}

/// Entry of the INIT thread: mount the root filesystem, start `main`, then
/// inherit and reap children until none are left.
extern "C" fn initd(_arg: usize) -> i32 {
	if let Err(err) = fs::init() {
		warn!("Running without a root filesystem: {err}");
	}

	let main_id = scheduler::spawn(
		"main",
		main_thread,
		0,
		NORMAL_PRIO,
		DEFAULT_STACK_SIZE,
		None,
	)
	.expect("unable to create the main thread");

	match scheduler::join(main_id) {
		Ok((code, cause)) => info!("main exited with code {code} ({cause:?})"),
		Err(err) => warn!("Lost track of the main thread: {err}"),
	}

	// Orphans of exited threads end up as our children; wait for all of
	// them before declaring the system down.
	while let Some(child) = scheduler::child_of_current_thread() {
		let _ = scheduler::join(child);
	}

	scheduler::set_system_state(SystemState::Halted);
	0
}

/// Entry point of the boot processor, called on the boot stack with
/// interrupts disabled.
pub extern "C" fn boot_processor_main() -> ! {
	arch::message_output_init();
	unsafe {
		logging::init();
	}

	info!("Welcome to Ferrite {}", env!("CARGO_PKG_VERSION"));

	arch::boot_processor_init();
	scheduler::add_current_core();
	arch::x86::kernel::scheduler::install_timer_handler();

	#[cfg(feature = "smp")]
	{
		arch::boot_application_processors();
		scheduler::wait_until_cores_registered();
		info!("{} CPU(s) online", arch::get_processor_count());
	}

	let init_id = scheduler::spawn(
		"init",
		initd,
		0,
		NORMAL_PRIO,
		DEFAULT_STACK_SIZE,
		Some(core_local::core_id()),
	)
	.expect("unable to create the INIT thread");
	scheduler::set_init_thread_id(init_id);
	scheduler::set_system_state(SystemState::Running);

	// Become the idle thread of this core.
	PerCoreScheduler::run()
}

/// Entry point of an application processor, called on its boot stack after
/// the trampoline. Turns into the core's idle thread.
#[cfg(feature = "smp")]
pub extern "C" fn application_processor_main() -> ! {
	arch::application_processor_init();
	scheduler::add_current_core();

	debug!("Core {} enters its idle loop", core_local::core_id());
	PerCoreScheduler::run()
}
