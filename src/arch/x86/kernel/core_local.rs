//! Mutable per-CPU kernel state.
//!
//! The per-CPU blocks are reachable through a fixed array indexed by the
//! core id, which in turn is derived from the local APIC id. Every element
//! is written exactly once, during the bring-up of its CPU.

use alloc::boxed::Box;
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(feature = "smp")]
use hermit_sync::InterruptTicketMutex;

use crate::arch::x86::kernel::apic;
use crate::arch::x86::kernel::interrupts::IrqStatistics;
use crate::config::MAX_CORES;
use crate::scheduler::task::ExitCause;
#[cfg(feature = "smp")]
use crate::scheduler::SchedulerInput;
use crate::scheduler::{CoreId, PerCoreScheduler};

static CORE_LOCALS: [AtomicPtr<CoreLocal>; MAX_CORES] =
	[const { AtomicPtr::new(ptr::null_mut()) }; MAX_CORES];

pub(crate) struct CoreLocal {
	/// Sequential id of this CPU core.
	#[allow(dead_code)]
	core_id: CoreId,
	/// Scheduler of this CPU core.
	scheduler: Cell<*mut PerCoreScheduler>,
	/// Interrupt counters of this CPU core.
	irq_statistics: &'static IrqStatistics,
	/// Exit cause recorded by an exception handler for the running thread.
	pending_exit_cause: Cell<Option<ExitCause>>,
	/// Set by interrupt handlers that want a context switch; the dispatcher
	/// honors it after the end of interrupt has been signalled.
	reschedule_request: Cell<bool>,
	/// Whether this CPU is currently inside the interrupt dispatcher.
	in_interrupt: Cell<bool>,
	/// Requests from other cores (new threads, wakeups).
	#[cfg(feature = "smp")]
	pub scheduler_input: InterruptTicketMutex<SchedulerInput>,
}

impl CoreLocal {
	pub fn install(core_id: CoreId) {
		let irq_statistics = if core_id == 0 {
			static FIRST_IRQ_STATISTICS: IrqStatistics = IrqStatistics::new();
			&FIRST_IRQ_STATISTICS
		} else {
			&*Box::leak(Box::new(IrqStatistics::new()))
		};

		let this = Self {
			core_id,
			scheduler: Cell::new(ptr::null_mut()),
			irq_statistics,
			pending_exit_cause: Cell::new(None),
			reschedule_request: Cell::new(false),
			in_interrupt: Cell::new(false),
			#[cfg(feature = "smp")]
			scheduler_input: InterruptTicketMutex::new(SchedulerInput::new()),
		};
		let this = if core_id == 0 {
			take_static::take_static! {
				static FIRST_CORE_LOCAL: Option<CoreLocal> = None;
			}
			FIRST_CORE_LOCAL.take().unwrap().insert(this)
		} else {
			Box::leak(Box::new(this))
		};

		let previous = CORE_LOCALS[core_id as usize].swap(ptr::from_mut(this), Ordering::Release);
		assert!(previous.is_null(), "core {core_id} initialized twice");
	}

	#[inline]
	pub fn get() -> &'static Self {
		let ptr = CORE_LOCALS[core_id() as usize].load(Ordering::Acquire);
		debug_assert!(!ptr.is_null());
		unsafe { &*ptr }
	}

	/// Like [`CoreLocal::get`], but usable before the per-CPU block of the
	/// current core has been installed.
	#[inline]
	pub fn try_get() -> Option<&'static Self> {
		let ptr = CORE_LOCALS[core_id() as usize].load(Ordering::Acquire);
		unsafe { ptr.as_ref() }
	}

	pub fn take_pending_exit_cause(&self) -> Option<ExitCause> {
		self.pending_exit_cause.take()
	}

	pub fn set_pending_exit_cause(&self, cause: ExitCause) {
		self.pending_exit_cause.set(Some(cause));
	}

	pub fn request_reschedule(&self) {
		self.reschedule_request.set(true);
	}

	pub fn take_reschedule_request(&self) -> bool {
		self.reschedule_request.replace(false)
	}

	pub fn is_in_interrupt(&self) -> bool {
		self.in_interrupt.get()
	}

	pub fn set_in_interrupt(&self, value: bool) {
		self.in_interrupt.set(value);
	}
}

/// Id of the core we are currently running on, derived from the local APIC.
/// Before the APIC tables are parsed this returns 0, which keeps the boot
/// processor path correct.
pub(crate) fn core_id() -> CoreId {
	apic::current_cpu_id()
}

pub(crate) fn core_scheduler() -> &'static mut PerCoreScheduler {
	unsafe { CoreLocal::get().scheduler.get().as_mut().unwrap() }
}

/// The per-CPU scheduler, or `None` while this core is still booting.
pub(crate) fn try_core_scheduler() -> Option<&'static mut PerCoreScheduler> {
	unsafe { CoreLocal::try_get().and_then(|core_local| core_local.scheduler.get().as_mut()) }
}

pub(crate) fn set_core_scheduler(scheduler: *mut PerCoreScheduler) {
	CoreLocal::get().scheduler.set(scheduler);
}

/// Whether the calling CPU is currently inside the interrupt dispatcher.
pub(crate) fn is_in_interrupt() -> bool {
	CoreLocal::try_get().is_some_and(|core_local| core_local.is_in_interrupt())
}

pub(crate) fn increment_irq_counter(irq_no: u8) {
	if let Some(core_local) = CoreLocal::try_get() {
		core_local.irq_statistics.inc(irq_no);
	}
}
