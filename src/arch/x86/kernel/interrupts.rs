//! The interrupt dispatcher.
//!
//! All 256 vectors funnel through mechanically generated assembly stubs into
//! [`dispatch_interrupt`], which owns the handler table, filters spurious
//! lines reported by the interrupt controller and signals the end of
//! interrupt for device lines.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::{OnceCell, TicketMutex};

use crate::arch::x86::kernel::core_local::increment_irq_counter;
use crate::arch::x86::kernel::processor::EFLAGS_IF;
use crate::error::{KernelError, Result};

/// Number of gates in the interrupt descriptor table.
pub const IDT_ENTRIES: usize = 256;

/// First vector that belongs to a hardware interrupt controller.
pub const MIN_INTERRUPT_LINE: u32 = 32;

/// Last manageable vector.
pub const MAX_INTERRUPT_LINE: u32 = IDT_ENTRIES as u32 - 1;

/// Last CPU exception vector.
pub const MAX_EXCEPTION_LINE: u32 = 31;

/// Software vector that enters the scheduler. It is exempt from the
/// disabled-state filtering so that a thread can yield from inside a
/// critical section.
pub const SCHEDULER_INT_LINE: u32 = 122;

/// Software vector raised to capture the register file on a kernel panic.
pub const PANIC_INT_LINE: u32 = 125;

/// Register file and stack state saved by the interrupt entry stubs.
///
/// Handlers receive a mutable reference and may patch `eip` to redirect the
/// interrupted thread, which the exception layer uses to route a faulting
/// thread into its termination routine.
#[repr(C)]
pub struct IrqState {
	pub gs: usize,
	pub fs: usize,
	pub es: usize,
	pub ds: usize,
	pub edi: usize,
	pub esi: usize,
	pub ebp: usize,
	pub esp: usize,
	pub ebx: usize,
	pub edx: usize,
	pub ecx: usize,
	pub eax: usize,
	/// Vector number pushed by the entry stub.
	pub int_no: usize,
	/// Error code pushed by the CPU, or a stub-provided zero.
	pub error_code: usize,
	pub eip: usize,
	pub cs: usize,
	pub eflags: usize,
}

impl fmt::Debug for IrqState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "interrupt {} (error code {:#x})", self.int_no, self.error_code)?;
		writeln!(
			f,
			"eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
			self.eax, self.ebx, self.ecx, self.edx
		)?;
		writeln!(
			f,
			"esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
			self.esi, self.edi, self.ebp, self.esp
		)?;
		write!(
			f,
			"eip={:#010x} cs={:#06x} ds={:#06x} eflags={:#010x}",
			self.eip, self.cs, self.ds, self.eflags
		)
	}
}

pub type IntHandler = fn(&mut IrqState);

/// Classification of an incoming vector by the interrupt controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqClass {
	Regular,
	Spurious,
}

/// The capability every interrupt controller driver provides.
pub trait IntController: Send + Sync {
	/// Mask or unmask an IRQ line at the controller.
	fn set_irq_mask(&self, irq: u32, masked: bool) -> Result<()>;

	/// Signal the end of interrupt for an IRQ line.
	fn set_irq_eoi(&self, irq: u32);

	/// Decide whether an incoming vector was raised by a real source.
	fn handle_spurious(&self, vector: u32) -> IrqClass;

	/// Translate an IRQ line into the interrupt vector it is wired to.
	fn get_irq_int_line(&self, irq: u32) -> Result<u32>;
}

#[derive(Copy, Clone)]
struct IntGate {
	handler: Option<IntHandler>,
	enabled: bool,
}

impl IntGate {
	const EMPTY: Self = Self {
		handler: None,
		enabled: false,
	};
}

/// The 256-entry handler table behind the dispatcher.
pub(crate) struct IntHandlerTable {
	gates: [IntGate; IDT_ENTRIES],
}

impl IntHandlerTable {
	pub const fn new() -> Self {
		Self {
			gates: [IntGate::EMPTY; IDT_ENTRIES],
		}
	}

	fn register(&mut self, line: u32, handler: IntHandler) -> Result<()> {
		let gate = &mut self.gates[line as usize];
		if gate.handler.is_some() {
			return Err(KernelError::InterruptAlreadyRegistered);
		}

		gate.handler = Some(handler);
		gate.enabled = true;
		Ok(())
	}

	fn remove(&mut self, line: u32) -> Result<()> {
		let gate = &mut self.gates[line as usize];
		if gate.handler.is_none() {
			return Err(KernelError::InterruptNotRegistered);
		}

		*gate = IntGate::EMPTY;
		Ok(())
	}

	fn entry(&self, line: u32) -> IntGate {
		self.gates[line as usize]
	}
}

/// Guarded by explicit interrupt disabling at every access, so the plain
/// ticket lock is sufficient even though the dispatcher reads the table from
/// interrupt context.
static INT_HANDLERS: TicketMutex<IntHandlerTable> = TicketMutex::new(IntHandlerTable::new());

static INT_CONTROLLER: OnceCell<&'static (dyn IntController + Send + Sync)> = OnceCell::new();

/// Interrupts observed without a real source.
static SPURIOUS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Device interrupts dropped because the interrupted context had interrupts
/// disabled.
static DROPPED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-CPU interrupt counters.
#[repr(align(64))]
pub struct IrqStatistics {
	counters: [AtomicU64; IDT_ENTRIES],
}

impl IrqStatistics {
	pub const fn new() -> Self {
		Self {
			counters: [const { AtomicU64::new(0) }; IDT_ENTRIES],
		}
	}

	pub fn inc(&self, pos: u8) {
		self.counters[pos as usize].fetch_add(1, Ordering::Relaxed);
	}

	pub fn get(&self, pos: u8) -> u64 {
		self.counters[pos as usize].load(Ordering::Relaxed)
	}
}

/// Install the active interrupt controller driver. All dispatching before
/// this call treats every vector as regular and skips the end of interrupt.
pub(crate) fn install_controller(controller: &'static (dyn IntController + Send + Sync)) {
	INT_CONTROLLER
		.set(controller)
		.unwrap_or_else(|_| panic!("interrupt controller installed twice"));
}

pub(crate) fn controller() -> Option<&'static (dyn IntController + Send + Sync)> {
	INT_CONTROLLER.get().copied()
}

fn with_table<R>(f: impl FnOnce(&mut IntHandlerTable) -> R) -> R {
	let prev = disable();
	let result = f(&mut INT_HANDLERS.lock());
	restore(prev);
	result
}

/// Register `handler` for the interrupt vector `line`.
///
/// Vectors below [`MIN_INTERRUPT_LINE`] belong to the exception layer and
/// are rejected here; see [`super::exceptions::register_exception_handler`].
pub fn register_int_handler(line: u32, handler: IntHandler) -> Result<()> {
	if !(MIN_INTERRUPT_LINE..=MAX_INTERRUPT_LINE).contains(&line) {
		return Err(KernelError::UnauthorizedInterruptLine);
	}

	with_table(|table| table.register(line, handler))
}

/// Remove the handler registered for the interrupt vector `line`.
pub fn remove_int_handler(line: u32) -> Result<()> {
	if !(MIN_INTERRUPT_LINE..=MAX_INTERRUPT_LINE).contains(&line) {
		return Err(KernelError::UnauthorizedInterruptLine);
	}

	with_table(|table| table.remove(line))
}

/// Register `handler` for an IRQ line of the interrupt controller.
pub fn register_irq_handler(irq: u32, handler: IntHandler) -> Result<()> {
	let controller = controller().ok_or(KernelError::NoSuchIrqLine)?;
	register_int_handler(controller.get_irq_int_line(irq)?, handler)
}

/// Register `handler` for an exception vector. Used by the exception layer
/// only.
pub(crate) fn register_exception_gate(line: u32, handler: IntHandler) -> Result<()> {
	if line > MAX_EXCEPTION_LINE {
		return Err(KernelError::UnauthorizedInterruptLine);
	}

	with_table(|table| table.register(line, handler))
}

pub(crate) fn remove_exception_gate(line: u32) -> Result<()> {
	if line > MAX_EXCEPTION_LINE {
		return Err(KernelError::UnauthorizedInterruptLine);
	}

	with_table(|table| table.remove(line))
}

/// Mask or unmask an IRQ line at the active interrupt controller.
pub fn set_irq_mask(irq: u32, masked: bool) -> Result<()> {
	controller()
		.ok_or(KernelError::NoSuchIrqLine)?
		.set_irq_mask(irq, masked)
}

pub fn get_spurious_count() -> u64 {
	SPURIOUS_COUNTER.load(Ordering::Relaxed)
}

#[allow(dead_code)]
pub fn get_dropped_count() -> u64 {
	DROPPED_COUNTER.load(Ordering::Relaxed)
}

/// The single C-level entry point invoked by all 256 assembly stubs.
#[unsafe(no_mangle)]
pub extern "C" fn dispatch_interrupt(state: &mut IrqState) {
	use crate::arch::x86::kernel::core_local::{CoreLocal, try_core_scheduler};

	if let Some(core_local) = CoreLocal::try_get() {
		core_local.set_in_interrupt(true);
	}

	dispatch(state);

	// Context switches requested by a handler happen only now, after the
	// end of interrupt is out the door; a freshly created thread would
	// otherwise leave the controller waiting for an acknowledgement that
	// never comes.
	if let Some(core_local) = CoreLocal::try_get() {
		core_local.set_in_interrupt(false);

		if core_local.take_reschedule_request()
			&& let Some(scheduler) = try_core_scheduler()
		{
			scheduler.schedule_in_irq();
		}
	}
}

fn dispatch(state: &mut IrqState) {
	let vector = state.int_no as u32;
	increment_irq_counter(vector as u8);

	// The panic vector is delivered no matter what state was interrupted.
	if vector == PANIC_INT_LINE {
		invoke(vector, state);
		return;
	}

	// A device interrupt that arrives while the interrupted context had
	// interrupts disabled must not run its handler; the scheduler vector is
	// exempt so that blocked threads can yield from critical sections.
	if vector >= MIN_INTERRUPT_LINE
		&& vector != SCHEDULER_INT_LINE
		&& state.eflags & EFLAGS_IF == 0
	{
		DROPPED_COUNTER.fetch_add(1, Ordering::Relaxed);
		send_eoi(vector);
		return;
	}

	if vector != SCHEDULER_INT_LINE
		&& let Some(controller) = controller()
		&& controller.handle_spurious(vector) == IrqClass::Spurious
	{
		SPURIOUS_COUNTER.fetch_add(1, Ordering::Relaxed);
		return;
	}

	invoke(vector, state);
	send_eoi(vector);
}

fn invoke(vector: u32, state: &mut IrqState) {
	let gate = with_table(|table| table.entry(vector));

	match gate.handler {
		Some(handler) if gate.enabled => handler(state),
		_ => default_panic_handler(state),
	}
}

fn send_eoi(vector: u32) {
	if vector >= MIN_INTERRUPT_LINE
		&& vector != SCHEDULER_INT_LINE
		&& let Some(controller) = controller()
	{
		controller.set_irq_eoi(vector - MIN_INTERRUPT_LINE);
	}
}

/// Handler of last resort: an unregistered vector is a kernel bug.
fn default_panic_handler(state: &mut IrqState) {
	error!("{:?}", state);
	panic!("unhandled interrupt {}", state.int_no);
}

/// Disables interrupts on this CPU and returns the previous state of the
/// interrupt flag (0 = disabled, non-zero = enabled).
#[cfg(target_os = "none")]
#[inline]
pub fn disable() -> usize {
	let eflags: usize;

	unsafe {
		core::arch::asm!("pushfd", "pop {}", "cli", out(reg) eflags, options(nomem));
	}
	eflags & EFLAGS_IF
}

/// Re-enables interrupts iff `prev` reports that they were enabled when the
/// matching [`disable`] was issued.
#[cfg(target_os = "none")]
#[inline]
pub fn restore(prev: usize) {
	if prev != 0 {
		unsafe {
			core::arch::asm!("sti", options(nomem, nostack));
		}
	}
}

#[cfg(target_os = "none")]
#[inline]
pub fn enable() {
	unsafe {
		core::arch::asm!("sti", options(nomem, nostack));
	}
}

/// Enables interrupts and halts until the next one arrives, atomically: the
/// `sti` shadow guarantees no interrupt can slip in before the `hlt`.
#[cfg(target_os = "none")]
#[inline]
pub fn enable_and_wait() {
	unsafe {
		core::arch::asm!("sti", "hlt", options(nomem, nostack));
	}
}

#[cfg(not(target_os = "none"))]
mod host {
	use core::cell::Cell;

	std::thread_local! {
		static HOST_IF: Cell<bool> = const { Cell::new(true) };
	}

	pub fn disable() -> usize {
		HOST_IF.with(|flag| if flag.replace(false) { super::EFLAGS_IF } else { 0 })
	}

	pub fn restore(prev: usize) {
		if prev != 0 {
			HOST_IF.with(|flag| flag.set(true));
		}
	}

	pub fn enable() {
		HOST_IF.with(|flag| flag.set(true));
	}

	pub fn enable_and_wait() {
		enable();
	}

	pub fn eflags() -> usize {
		HOST_IF.with(|flag| if flag.get() { super::EFLAGS_IF } else { 0 })
	}
}

#[cfg(not(target_os = "none"))]
pub use self::host::{disable, enable, enable_and_wait, restore};

/// Run `f` with interrupts disabled on this CPU.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
	let prev = disable();
	let result = f();
	restore(prev);
	result
}

/// Issue the software interrupt `line` on this CPU. On return an end of
/// interrupt is signalled for device lines.
pub fn raise_interrupt(line: u32) -> Result<()> {
	if line >= IDT_ENTRIES as u32 {
		return Err(KernelError::OutOfRange);
	}

	#[cfg(target_os = "none")]
	{
		unsafe extern "C" {
			fn sw_int_stubs();
		}

		// The thunks are laid out in eight byte slots; see the assembly
		// block below.
		let thunk: extern "C" fn() =
			unsafe { core::mem::transmute(sw_int_stubs as usize + 8 * line as usize) };
		thunk();
	}

	#[cfg(not(target_os = "none"))]
	{
		// The host has no software interrupts; feed a synthetic frame with
		// the simulated interrupt flag straight into the dispatcher.
		let mut state = IrqState {
			gs: 0,
			fs: 0,
			es: 0,
			ds: 0,
			edi: 0,
			esi: 0,
			ebp: 0,
			esp: 0,
			ebx: 0,
			edx: 0,
			ecx: 0,
			eax: 0,
			int_no: line as usize,
			error_code: 0,
			eip: 0,
			cs: 0,
			eflags: host::eflags(),
		};
		dispatch_interrupt(&mut state);
	}

	send_eoi(line);
	Ok(())
}

// The interrupt entry stubs. Each occupies a fixed 16 byte slot so that the
// IDT installer can compute the entry address of vector i as
// `interrupt_stubs + 16 * i`. Vectors for which the CPU pushes an error code
// skip the dummy push.
#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
	".section .text",
	".p2align 4",
	"interrupt_common:",
	"pusha",
	"push ds",
	"push es",
	"push fs",
	"push gs",
	"push esp",
	"call dispatch_interrupt",
	"add esp, 4",
	"pop gs",
	"pop fs",
	"pop es",
	"pop ds",
	"popa",
	"add esp, 8",
	"iretd",
	".p2align 4",
	".global interrupt_stubs",
	"interrupt_stubs:",
	".set vec, 0",
	".rept 256",
	".p2align 4",
	".if (vec == 8) || ((vec >= 10) && (vec <= 14)) || (vec == 17) || (vec == 21) || (vec == 29) || (vec == 30)",
	".else",
	"push 0",
	".endif",
	// push imm32 with the vector number, hand-encoded so the symbolic
	// operand cannot be mistaken for a memory reference.
	".byte 0x68",
	".long vec",
	"jmp interrupt_common",
	".set vec, vec + 1",
	".endr",
	// Thunks for raise_interrupt, eight bytes apart.
	".p2align 4",
	".global sw_int_stubs",
	"sw_int_stubs:",
	".set vec, 0",
	".rept 256",
	".p2align 3",
	"int vec",
	"ret",
	".set vec, vec + 1",
	".endr",
);

#[cfg(test)]
mod tests {
	use super::*;

	fn nop_handler(_state: &mut IrqState) {}

	#[test]
	fn register_rejects_exception_range() {
		assert_eq!(
			register_int_handler(17, nop_handler),
			Err(KernelError::UnauthorizedInterruptLine)
		);
		assert_eq!(
			remove_int_handler(3),
			Err(KernelError::UnauthorizedInterruptLine)
		);
	}

	#[test]
	fn register_remove_contract() {
		let mut table = IntHandlerTable::new();

		assert_eq!(table.register(200, nop_handler), Ok(()));
		assert_eq!(
			table.register(200, nop_handler),
			Err(KernelError::InterruptAlreadyRegistered)
		);
		assert_eq!(table.remove(200), Ok(()));
		assert_eq!(table.remove(200), Err(KernelError::InterruptNotRegistered));

		// A fresh slot can be reused after removal.
		assert_eq!(table.register(200, nop_handler), Ok(()));
		assert!(table.entry(200).enabled);
	}

	#[test]
	fn raise_rejects_out_of_range() {
		assert_eq!(raise_interrupt(4096), Err(KernelError::OutOfRange));
	}

	#[test]
	fn disable_restore_compose() {
		enable();
		let prev = disable();
		assert_ne!(prev, 0);

		// Nested critical sections keep interrupts off until the outermost
		// restore runs.
		let inner = disable();
		assert_eq!(inner, 0);
		restore(inner);
		restore(prev);
		assert_eq!(disable(), EFLAGS_IF);
		enable();
	}

	#[test]
	fn disabled_state_blocks_device_vectors() {
		use core::sync::atomic::{AtomicUsize, Ordering};

		static FIRED: AtomicUsize = AtomicUsize::new(0);

		fn counting_handler(_state: &mut IrqState) {
			FIRED.fetch_add(1, Ordering::Relaxed);
		}

		register_int_handler(210, counting_handler).unwrap();

		enable();
		raise_interrupt(210).unwrap();
		assert_eq!(FIRED.load(Ordering::Relaxed), 1);

		let prev = disable();
		raise_interrupt(210).unwrap();
		assert_eq!(FIRED.load(Ordering::Relaxed), 1);

		restore(prev);
		raise_interrupt(210).unwrap();
		assert_eq!(FIRED.load(Ordering::Relaxed), 2);

		remove_int_handler(210).unwrap();
	}

	#[test]
	fn scheduler_vector_is_exempt_from_gating() {
		use core::sync::atomic::{AtomicUsize, Ordering};

		static FIRED: AtomicUsize = AtomicUsize::new(0);

		fn counting_handler(_state: &mut IrqState) {
			FIRED.fetch_add(1, Ordering::Relaxed);
		}

		with_table(|table| table.register(SCHEDULER_INT_LINE, counting_handler)).unwrap();

		let prev = disable();
		raise_interrupt(SCHEDULER_INT_LINE).unwrap();
		restore(prev);
		assert_eq!(FIRED.load(Ordering::Relaxed), 1);

		with_table(|table| table.remove(SCHEDULER_INT_LINE)).unwrap();
	}
}
