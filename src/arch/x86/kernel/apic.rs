//! Support for the local and I/O APICs: CPU enumeration through the ACPI
//! MADT, the per-CPU timer, inter-processor interrupts and the bring-up of
//! the application processors.

use alloc::vec::Vec;
#[cfg(feature = "smp")]
use core::hint::spin_loop;
use core::ptr;
#[cfg(feature = "smp")]
use core::sync::atomic::AtomicU32;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hermit_sync::OnceCell;

#[cfg(feature = "acpi")]
use crate::arch::x86::kernel::acpi;
use crate::arch::x86::kernel::interrupts::{
	self, IntController, IrqClass, IrqState, MIN_INTERRUPT_LINE,
};
use crate::arch::x86::kernel::processor;
use crate::config::TIMER_FREQUENCY_IN_HZ;
use crate::error::{KernelError, Result};
use crate::scheduler::CoreId;

/// Vector of the per-CPU APIC timer.
pub const TIMER_INT_LINE: u32 = 123;
/// Vector used to poke a CPU whose scheduler has input from another core.
#[cfg(feature = "smp")]
pub const WAKEUP_INT_LINE: u32 = 121;
/// Vector reported by the local APIC for internal errors.
const ERROR_INT_LINE: u32 = 126;
/// Vector the local APIC delivers when an interrupt vanishes before
/// delivery. The handler must neither run nor acknowledge anything.
const SPURIOUS_INT_LINE: u32 = 127;

// Register offsets of the memory-mapped local APIC.
const APIC_ID: usize = 0x020;
const APIC_TPR: usize = 0x080;
const APIC_EOI: usize = 0x0b0;
const APIC_SIVR: usize = 0x0f0;
const APIC_ESR: usize = 0x280;
const APIC_ICR_LOW: usize = 0x300;
const APIC_ICR_HIGH: usize = 0x310;
const APIC_LVT_TIMER: usize = 0x320;
const APIC_LVT_THERMAL: usize = 0x330;
const APIC_LVT_PMC: usize = 0x340;
const APIC_LVT_LINT0: usize = 0x350;
const APIC_LVT_LINT1: usize = 0x360;
const APIC_LVT_ERROR: usize = 0x370;
const APIC_TIMER_INIT_COUNT: usize = 0x380;
const APIC_TIMER_CUR_COUNT: usize = 0x390;
const APIC_TIMER_DIVIDE: usize = 0x3e0;

const APIC_SIVR_ENABLED: u32 = 1 << 8;
const APIC_LVT_MASK: u32 = 1 << 16;
const APIC_LVT_TIMER_PERIODIC: u32 = 1 << 17;
const APIC_DIV_CONF_DIVIDE_BY_8: u32 = 0b0010;
#[cfg(feature = "smp")]
const APIC_ICR_DELIVERY_MODE_FIXED: u32 = 0x000;
#[cfg(feature = "smp")]
const APIC_ICR_DELIVERY_MODE_INIT: u32 = 0x500;
#[cfg(feature = "smp")]
const APIC_ICR_DELIVERY_MODE_STARTUP: u32 = 0x600;
const APIC_ICR_DELIVERY_MODE_NMI: u32 = 0x400;
const APIC_ICR_DELIVERY_STATUS_PENDING: u32 = 1 << 12;
#[cfg(feature = "smp")]
const APIC_ICR_LEVEL_TRIGGERED: u32 = 1 << 15;
const APIC_ICR_LEVEL_ASSERT: u32 = 1 << 14;
const APIC_ICR_DEST_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;

/// Register index of the I/O APIC version register.
const IOAPIC_REG_VER: u32 = 0x01;
/// Redirection table base of the I/O APIC.
const IOAPIC_REG_TABLE: u32 = 0x10;

/// Base address of the memory-mapped local APIC, zero while undetected.
static LOCAL_APIC_ADDRESS: AtomicUsize = AtomicUsize::new(0);
/// Base address of the memory-mapped I/O APIC, zero while undetected.
static IOAPIC_ADDRESS: AtomicUsize = AtomicUsize::new(0);

/// The local APIC ids of all usable CPUs. The index is the core id.
static CPU_LOCAL_APIC_IDS: OnceCell<Vec<u8>> = OnceCell::new();

/// IRQ-to-GSI remappings announced by the MADT.
static IRQ_OVERRIDES: OnceCell<Vec<IrqOverride>> = OnceCell::new();

/// Timer counter value corresponding to one microsecond, determined during
/// calibration.
static CALIBRATED_COUNTER_VALUE: AtomicU64 = AtomicU64::new(0);

/// Set to one by the boot processor when all application processors have
/// been counted.
#[cfg(feature = "smp")]
static INIT_SEQUENCE_END: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy)]
struct IrqOverride {
	source_irq: u8,
	gsi: u32,
}

#[cfg(feature = "acpi")]
#[repr(C, packed)]
struct AcpiMadtHeader {
	local_apic_address: u32,
	flags: u32,
}

#[cfg(feature = "acpi")]
#[repr(C, packed)]
struct AcpiMadtRecordHeader {
	entry_type: u8,
	length: u8,
}

#[cfg(feature = "acpi")]
#[repr(C, packed)]
struct ProcessorLocalApicRecord {
	acpi_processor_id: u8,
	apic_id: u8,
	flags: u32,
}

#[cfg(feature = "acpi")]
const CPU_FLAG_ENABLED: u32 = 1 << 0;

#[cfg(feature = "acpi")]
#[repr(C, packed)]
struct IoApicRecord {
	id: u8,
	reserved: u8,
	address: u32,
	global_system_interrupt_base: u32,
}

#[cfg(feature = "acpi")]
#[repr(C, packed)]
struct InterruptSourceOverrideRecord {
	bus: u8,
	source: u8,
	global_system_interrupt: u32,
	flags: u16,
}

fn local_apic_read(offset: usize) -> u32 {
	let base = LOCAL_APIC_ADDRESS.load(Ordering::Relaxed);
	debug_assert_ne!(base, 0);
	unsafe { ptr::read_volatile((base + offset) as *const u32) }
}

fn local_apic_write(offset: usize, value: u32) {
	let base = LOCAL_APIC_ADDRESS.load(Ordering::Relaxed);
	debug_assert_ne!(base, 0);
	unsafe {
		ptr::write_volatile((base + offset) as *mut u32, value);
	}
}

fn ioapic_read(reg: u32) -> u32 {
	let base = IOAPIC_ADDRESS.load(Ordering::Relaxed);
	debug_assert_ne!(base, 0);
	unsafe {
		ptr::write_volatile(base as *mut u32, reg);
		ptr::read_volatile((base + 0x10) as *const u32)
	}
}

fn ioapic_write(reg: u32, value: u32) {
	let base = IOAPIC_ADDRESS.load(Ordering::Relaxed);
	debug_assert_ne!(base, 0);
	unsafe {
		ptr::write_volatile(base as *mut u32, reg);
		ptr::write_volatile((base + 0x10) as *mut u32, value);
	}
}

fn ioapic_max_redirection_entry() -> u8 {
	((ioapic_read(IOAPIC_REG_VER) >> 16) & 0xff) as u8
}

/// Whether the local APIC has been detected and enabled.
pub fn is_initialized() -> bool {
	LOCAL_APIC_ADDRESS.load(Ordering::Relaxed) != 0
}

/// Signal the end of interrupt to the local APIC.
pub fn eoi() {
	local_apic_write(APIC_EOI, 0);
}

/// The local APIC id of the calling CPU.
fn lapic_id() -> u8 {
	(local_apic_read(APIC_ID) >> 24) as u8
}

/// Id of the CPU we are running on, determined by looking up the caller's
/// local APIC id in the table enumerated from ACPI. Before the enumeration
/// has happened this returns 0, which keeps single-CPU operation correct.
pub fn current_cpu_id() -> CoreId {
	if !is_initialized() {
		return 0;
	}

	match CPU_LOCAL_APIC_IDS.get() {
		Some(ids) => {
			let id = lapic_id();
			ids.iter().position(|apic_id| *apic_id == id).unwrap_or(0) as CoreId
		}
		None => 0,
	}
}

/// The local APIC id registered for a core.
pub fn get_lapic_id(core_id: CoreId) -> Result<u8> {
	CPU_LOCAL_APIC_IDS
		.get()
		.and_then(|ids| ids.get(core_id as usize).copied())
		.ok_or(KernelError::NoSuchLapicId)
}

/// Number of usable CPUs the MADT announced.
pub fn get_cpu_count() -> u32 {
	CPU_LOCAL_APIC_IDS.get().map_or(1, |ids| ids.len() as u32)
}

/// Walk the MADT and record the local APIC address, the processor records
/// and the IRQ overrides.
#[cfg(feature = "acpi")]
fn detect_from_acpi() -> Result<usize> {
	use core::mem;

	let madt = acpi::get_madt()?;
	let madt_header = unsafe { &*(madt.table_start_address() as *const AcpiMadtHeader) };
	let local_apic_address = madt_header.local_apic_address as usize;

	let mut apic_ids = Vec::new();
	let mut overrides = Vec::new();

	let mut current_address = madt.table_start_address() + mem::size_of::<AcpiMadtHeader>();
	while current_address < madt.table_end_address() {
		let record = unsafe { &*(current_address as *const AcpiMadtRecordHeader) };
		current_address += mem::size_of::<AcpiMadtRecordHeader>();

		match record.entry_type {
			0 => {
				let processor = unsafe { &*(current_address as *const ProcessorLocalApicRecord) };
				if processor.flags & CPU_FLAG_ENABLED != 0 {
					debug!("Found enabled CPU with local APIC id {}", {
						processor.apic_id
					});
					apic_ids.push(processor.apic_id);
				}
			}
			1 => {
				let ioapic = unsafe { &*(current_address as *const IoApicRecord) };
				debug!("Found I/O APIC at {:#x}", { ioapic.address });
				IOAPIC_ADDRESS.store(ioapic.address as usize, Ordering::Relaxed);
			}
			2 => {
				let isc = unsafe { &*(current_address as *const InterruptSourceOverrideRecord) };
				debug!("IRQ {} is remapped to GSI {}", isc.source, {
					isc.global_system_interrupt
				});
				overrides.push(IrqOverride {
					source_irq: isc.source,
					gsi: isc.global_system_interrupt,
				});
			}
			_ => {}
		}

		current_address += record.length as usize - mem::size_of::<AcpiMadtRecordHeader>();
	}

	if apic_ids.is_empty() {
		return Err(KernelError::AcpiUnsupported);
	}

	CPU_LOCAL_APIC_IDS.set(apic_ids).ok();
	IRQ_OVERRIDES.set(overrides).ok();
	Ok(local_apic_address)
}

#[cfg(not(feature = "acpi"))]
fn detect_from_acpi() -> Result<usize> {
	Err(KernelError::AcpiUnsupported)
}

/// Program this CPU's local APIC: mask the unused local vectors, accept all
/// priorities and enable it through the spurious interrupt vector register.
fn init_local_apic() {
	local_apic_write(APIC_LVT_TIMER, APIC_LVT_MASK);
	local_apic_write(APIC_LVT_THERMAL, APIC_LVT_MASK);
	local_apic_write(APIC_LVT_PMC, APIC_LVT_MASK);
	local_apic_write(APIC_LVT_LINT0, APIC_LVT_MASK);
	local_apic_write(APIC_LVT_LINT1, APIC_LVT_MASK);
	local_apic_write(APIC_LVT_ERROR, ERROR_INT_LINE);
	local_apic_write(APIC_TPR, 0);
	local_apic_write(APIC_SIVR, APIC_SIVR_ENABLED | SPURIOUS_INT_LINE);
}

/// Determine the counter value for one microsecond. Interrupt delivery for
/// the timer stays masked during calibration.
fn calibrate_timer() {
	let microseconds = 30_000;

	local_apic_write(APIC_TIMER_DIVIDE, APIC_DIV_CONF_DIVIDE_BY_8);
	local_apic_write(APIC_TIMER_INIT_COUNT, u32::MAX);

	processor::udelay(microseconds);

	let elapsed = u64::from(u32::MAX - local_apic_read(APIC_TIMER_CUR_COUNT));
	CALIBRATED_COUNTER_VALUE.store(elapsed / microseconds, Ordering::Relaxed);
	local_apic_write(APIC_TIMER_INIT_COUNT, 0);

	debug!(
		"Calibrated APIC timer: {} counts per microsecond",
		CALIBRATED_COUNTER_VALUE.load(Ordering::Relaxed)
	);
}

/// Let this CPU's APIC timer fire the scheduler tick periodically.
pub fn init_lapic_timer() {
	let period_in_us = 1_000_000 / TIMER_FREQUENCY_IN_HZ;
	let init_count = (CALIBRATED_COUNTER_VALUE.load(Ordering::Relaxed) * period_in_us)
		.min(u64::from(u32::MAX)) as u32;

	local_apic_write(APIC_TIMER_DIVIDE, APIC_DIV_CONF_DIVIDE_BY_8);
	local_apic_write(APIC_LVT_TIMER, APIC_LVT_TIMER_PERIODIC | TIMER_INT_LINE);
	local_apic_write(APIC_TIMER_INIT_COUNT, init_count);
}

/// Mask every redirection entry of the I/O APIC; lines are opened by
/// `set_irq_mask` once a handler exists.
fn init_ioapic() {
	let max_entry = ioapic_max_redirection_entry() as u32;
	info!("I/O APIC provides {} redirection entries", max_entry + 1);

	for gsi in 0..=max_entry {
		ioapic_write(
			IOAPIC_REG_TABLE + 2 * gsi,
			(MIN_INTERRUPT_LINE + gsi) | APIC_LVT_MASK,
		);
		// Route everything to the boot processor.
		ioapic_write(IOAPIC_REG_TABLE + 2 * gsi + 1, 0);
	}
}

#[cfg(feature = "smp")]
fn icr_send(destination_apic_id: u8, flags: u32) {
	// xAPIC mode: destination in the high dword, everything else in the low
	// dword, which also starts the transmission.
	local_apic_write(APIC_ICR_HIGH, u32::from(destination_apic_id) << 24);
	local_apic_write(APIC_ICR_LOW, flags);

	while local_apic_read(APIC_ICR_LOW) & APIC_ICR_DELIVERY_STATUS_PENDING != 0 {
		spin_loop();
	}
}

/// The interrupt controller capability backed by the APIC pair.
pub struct ApicDriver;

pub static APIC_DRIVER: ApicDriver = ApicDriver;

fn translate_irq_to_gsi(irq: u32) -> u32 {
	IRQ_OVERRIDES
		.get()
		.and_then(|overrides| {
			overrides
				.iter()
				.find(|o| u32::from(o.source_irq) == irq)
				.map(|o| o.gsi)
		})
		.unwrap_or(irq)
}

impl IntController for ApicDriver {
	fn set_irq_mask(&self, irq: u32, masked: bool) -> Result<()> {
		let gsi = translate_irq_to_gsi(irq);
		if gsi > ioapic_max_redirection_entry() as u32 {
			return Err(KernelError::NoSuchIrqLine);
		}

		let mut entry = ioapic_read(IOAPIC_REG_TABLE + 2 * gsi);
		if masked {
			entry |= APIC_LVT_MASK;
		} else {
			entry &= !APIC_LVT_MASK;
		}
		ioapic_write(IOAPIC_REG_TABLE + 2 * gsi, entry);
		Ok(())
	}

	fn set_irq_eoi(&self, _irq: u32) {
		// The local APIC acknowledges whatever is currently in service.
		eoi();
	}

	fn handle_spurious(&self, vector: u32) -> IrqClass {
		if vector == SPURIOUS_INT_LINE {
			// The spurious vector never sets an in-service bit.
			return IrqClass::Spurious;
		}

		IrqClass::Regular
	}

	fn get_irq_int_line(&self, irq: u32) -> Result<u32> {
		let gsi = translate_irq_to_gsi(irq);
		if gsi > ioapic_max_redirection_entry() as u32 {
			return Err(KernelError::NoSuchIrqLine);
		}

		Ok(MIN_INTERRUPT_LINE + gsi)
	}
}

fn error_interrupt_handler(state: &mut IrqState) {
	error!("APIC LVT error interrupt, ESR: {:#x}", {
		// Writing the ESR latches the current error set before reading.
		local_apic_write(APIC_ESR, 0);
		local_apic_read(APIC_ESR)
	});
	error!("{:?}", state);
	panic!("APIC error");
}

#[cfg(feature = "smp")]
fn wakeup_interrupt_handler(_state: &mut IrqState) {
	if let Some(scheduler) = crate::arch::x86::kernel::core_local::try_core_scheduler() {
		scheduler.check_input();
		crate::arch::x86::kernel::core_local::CoreLocal::get().request_reschedule();
	}
}

/// Detect the APIC pair through ACPI and take over interrupt delivery from
/// the PIC. On success the APIC driver is the installed interrupt
/// controller capability.
pub fn init() -> Result<()> {
	let local_apic_address = detect_from_acpi()?;
	LOCAL_APIC_ADDRESS.store(local_apic_address, Ordering::Relaxed);
	info!(
		"Local APIC at {:#x}, {} CPU(s)",
		local_apic_address,
		get_cpu_count()
	);

	if IOAPIC_ADDRESS.load(Ordering::Relaxed) == 0 {
		warn!("MADT does not announce an I/O APIC");
		LOCAL_APIC_ADDRESS.store(0, Ordering::Relaxed);
		return Err(KernelError::AcpiUnsupported);
	}

	init_local_apic();
	calibrate_timer();
	init_ioapic();

	interrupts::register_int_handler(ERROR_INT_LINE, error_interrupt_handler)?;
	#[cfg(feature = "smp")]
	interrupts::register_int_handler(WAKEUP_INT_LINE, wakeup_interrupt_handler)?;

	interrupts::install_controller(&APIC_DRIVER);
	Ok(())
}

/// Per-CPU part of the APIC setup for a freshly booted application
/// processor.
#[cfg(feature = "smp")]
pub fn init_ap() {
	init_local_apic();
	init_lapic_timer();
}

/// Send an inter-processor interrupt to wake up a core that may be sitting
/// in its idle loop.
#[cfg(feature = "smp")]
pub fn wakeup_core(core_id_to_wakeup: CoreId) {
	if !is_initialized() || core_id_to_wakeup == current_cpu_id() {
		return;
	}

	if let Ok(apic_id) = get_lapic_id(core_id_to_wakeup) {
		icr_send(
			apic_id,
			APIC_ICR_LEVEL_ASSERT | APIC_ICR_DELIVERY_MODE_FIXED | WAKEUP_INT_LINE,
		);
	}
}

/// Stop all other CPUs dead. Only used on the panic path, hence the
/// non-maskable delivery.
pub fn ipi_halt_other_cores() {
	if !is_initialized() || get_cpu_count() <= 1 {
		return;
	}

	local_apic_write(
		APIC_ICR_LOW,
		APIC_ICR_DEST_ALL_EXCLUDING_SELF | APIC_ICR_LEVEL_ASSERT | APIC_ICR_DELIVERY_MODE_NMI,
	);
}

/// Wake up every application processor enumerated from the MADT.
///
/// The protocol per CPU is INIT, a delay, STARTUP with the trampoline page,
/// a delay, and one retry of STARTUP. A CPU that does not report within the
/// bounded window is excluded instead of hanging the boot processor.
#[cfg(all(target_arch = "x86", target_os = "none", feature = "smp"))]
pub fn boot_application_processors() {
	use alloc::alloc::{Layout, alloc};

	use super::smp_boot;
	use super::{CPU_ONLINE, application_processor_entry};
	use crate::config::{KERNEL_STACK_SIZE, MAX_CORES};

	if !is_initialized() {
		return;
	}

	let Some(apic_ids) = CPU_LOCAL_APIC_IDS.get() else {
		return;
	};
	if apic_ids.len() <= 1 {
		return;
	}

	smp_boot::prepare_trampoline(application_processor_entry);

	let boot_core = current_cpu_id() as usize;
	let trampoline_page = (smp_boot::SMP_BOOT_CODE_ADDRESS >> 12) as u32;

	for (core_id, &apic_id) in apic_ids.iter().enumerate() {
		if core_id == boot_core {
			continue;
		}
		if core_id >= MAX_CORES {
			warn!("Ignoring CPUs beyond the supported maximum of {MAX_CORES}");
			break;
		}

		debug!("Waking up CPU {core_id} with local APIC id {apic_id}");

		// The AP boot stack is never reclaimed: it becomes the stack of
		// that core's idle thread.
		let layout = Layout::from_size_align(KERNEL_STACK_SIZE, 16).unwrap();
		let stack = unsafe { alloc(layout) };
		assert!(!stack.is_null());
		smp_boot::set_boot_stack(stack as usize + KERNEL_STACK_SIZE - 16);

		let booted = CPU_ONLINE.load(Ordering::Acquire);

		icr_send(
			apic_id,
			APIC_ICR_LEVEL_TRIGGERED | APIC_ICR_LEVEL_ASSERT | APIC_ICR_DELIVERY_MODE_INIT,
		);
		icr_send(
			apic_id,
			APIC_ICR_LEVEL_TRIGGERED | APIC_ICR_DELIVERY_MODE_INIT,
		);
		processor::udelay(20_000);

		icr_send(apic_id, APIC_ICR_DELIVERY_MODE_STARTUP | trampoline_page);
		processor::udelay(30_000);

		if CPU_ONLINE.load(Ordering::Acquire) == booted {
			icr_send(apic_id, APIC_ICR_DELIVERY_MODE_STARTUP | trampoline_page);
		}

		// Bounded wait; a silent CPU must not hang the whole machine.
		let mut waited_us: u64 = 0;
		while CPU_ONLINE.load(Ordering::Acquire) == booted && waited_us < 100_000 {
			processor::udelay(1_000);
			waited_us += 1_000;
		}

		if CPU_ONLINE.load(Ordering::Acquire) == booted {
			error!("CPU {core_id} (local APIC id {apic_id}) did not answer the STARTUP IPI");
		}
	}

	INIT_SEQUENCE_END.store(1, Ordering::Release);
}

/// Spin until the boot processor has finished counting the APs.
#[cfg(feature = "smp")]
pub fn wait_for_init_sequence_end() {
	while INIT_SEQUENCE_END.load(Ordering::Acquire) == 0 {
		spin_loop();
	}
}
