//! CPU exception handling.
//!
//! A thin veneer on the interrupt dispatcher reserved for vectors 0..=31.
//! Faults attributable to the running thread do not take the kernel down:
//! the handler patches the saved instruction pointer so that the thread
//! resumes inside its own termination routine.

use num_enum::TryFromPrimitive;

use crate::arch::x86::kernel::core_local::{CoreLocal, core_scheduler, try_core_scheduler};
use crate::arch::x86::kernel::interrupts::{self, IntHandler, IrqState};
use crate::arch::x86::kernel::processor;
use crate::error::Result;
use crate::scheduler;
use crate::scheduler::task::ExitCause;

/// The architectural exception vectors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
#[allow(dead_code)]
pub enum ExceptionVector {
	DivisionError = 0,
	Debug = 1,
	NonMaskableInterrupt = 2,
	Breakpoint = 3,
	Overflow = 4,
	BoundRange = 5,
	InvalidOpcode = 6,
	DeviceNotAvailable = 7,
	DoubleFault = 8,
	CoprocessorSegmentOverrun = 9,
	InvalidTss = 10,
	SegmentNotPresent = 11,
	StackSegmentFault = 12,
	GeneralProtectionFault = 13,
	PageFault = 14,
	X87FloatingPoint = 16,
	AlignmentCheck = 17,
	MachineCheck = 18,
	SimdFloatingPoint = 19,
	Virtualization = 20,
}

/// Register `handler` for an exception vector (0..=31).
pub fn register_exception_handler(vector: u32, handler: IntHandler) -> Result<()> {
	interrupts::register_exception_gate(vector, handler)
}

/// Remove the handler of an exception vector.
#[allow(dead_code)]
pub fn remove_exception_handler(vector: u32) -> Result<()> {
	interrupts::remove_exception_gate(vector)
}

/// Install the default exception handlers.
pub(crate) fn install() {
	register_exception_handler(ExceptionVector::DivisionError as u32, divide_error_exception)
		.unwrap();
	register_exception_handler(ExceptionVector::NonMaskableInterrupt as u32, nmi_exception)
		.unwrap();
	register_exception_handler(ExceptionVector::InvalidOpcode as u32, invalid_opcode_exception)
		.unwrap();
	register_exception_handler(
		ExceptionVector::DeviceNotAvailable as u32,
		device_not_available_exception,
	)
	.unwrap();
	register_exception_handler(ExceptionVector::DoubleFault as u32, double_fault_exception)
		.unwrap();
	register_exception_handler(
		ExceptionVector::GeneralProtectionFault as u32,
		general_protection_exception,
	)
	.unwrap();
	register_exception_handler(ExceptionVector::PageFault as u32, page_fault_exception).unwrap();
	register_exception_handler(ExceptionVector::MachineCheck as u32, machine_check_exception)
		.unwrap();
}

/// Redirect the faulting thread into its termination routine. The handler
/// returns normally; the patched frame makes the thread run
/// `terminated_thread_entry` in its own context as soon as it resumes.
fn terminate_faulting_thread(state: &mut IrqState, cause: ExitCause, what: &str) {
	let terminable = try_core_scheduler().is_some_and(|scheduler| !scheduler.is_idle());

	if !terminable {
		error!("{:?}", state);
		panic!("{what} exception outside of a terminable thread");
	}

	warn!(
		"{what} exception in thread {}, terminating it",
		core_scheduler().get_current_thread_id()
	);
	CoreLocal::get().set_pending_exit_cause(cause);
	state.eip = scheduler::terminated_thread_entry as usize;
}

fn divide_error_exception(state: &mut IrqState) {
	terminate_faulting_thread(state, ExitCause::DivByZero, "Divide Error (#DE)");
}

fn invalid_opcode_exception(state: &mut IrqState) {
	terminate_faulting_thread(state, ExitCause::InvalidOpcode, "Invalid Opcode (#UD)");
}

fn general_protection_exception(state: &mut IrqState) {
	error!("error code {:#x}", state.error_code);
	terminate_faulting_thread(state, ExitCause::ProtectionFault, "General Protection (#GP)");
}

fn page_fault_exception(state: &mut IrqState) {
	error!(
		"page fault at {:#010x} (error code {:#x})",
		processor::read_cr2(),
		state.error_code
	);
	terminate_faulting_thread(state, ExitCause::PageFault, "Page Fault (#PF)");
}

/// The other CPUs are halted through a non-maskable interrupt when one CPU
/// panics; park this one for good.
fn nmi_exception(_state: &mut IrqState) {
	processor::shutdown();
}

fn double_fault_exception(state: &mut IrqState) {
	error!("{:?}", state);
	panic!("Double Fault (#DF) exception");
}

fn machine_check_exception(state: &mut IrqState) {
	error!("{:?}", state);
	panic!("Machine Check (#MC) exception");
}

/// First FPU/SSE use after a context switch. Hand the FPU over lazily.
fn device_not_available_exception(_state: &mut IrqState) {
	// Clear CR0.TS so this does not fire again before the next switch.
	processor::clear_task_switched_flag();
	core_scheduler().fpu_switch();
}
