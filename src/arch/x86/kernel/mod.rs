#[cfg(feature = "acpi")]
pub mod acpi;
pub mod apic;
pub mod core_local;
pub mod exceptions;
pub mod idt;
pub mod interrupts;
pub mod pic;
pub mod pit;
pub mod processor;
pub mod scheduler;
pub mod serial;
#[cfg(all(target_arch = "x86", target_os = "none", feature = "smp"))]
pub mod smp_boot;
mod start;
pub mod switch;

use core::sync::atomic::{AtomicU32, Ordering};

use self::core_local::CoreLocal;

/// Count of CPUs that finished initialization.
pub static CPU_ONLINE: AtomicU32 = AtomicU32::new(0);

/// Number of CPUs that are up and participating in scheduling.
pub fn get_processor_count() -> u32 {
	CPU_ONLINE.load(Ordering::Acquire).max(1)
}

pub fn message_output_init() {
	serial::COM1_PORT.init();
}

pub fn output_message_buf(buf: &[u8]) {
	for byte in buf {
		serial::COM1_PORT.write_byte(*byte);
	}
}

/// Initialize the hardware of the boot processor: interrupt tables, the
/// interrupt controller, CPU enumeration and the per-CPU state block.
pub fn boot_processor_init() {
	processor::detect_frequency();
	idt::install();
	exceptions::install();
	pic::init();

	#[cfg(feature = "acpi")]
	match acpi::init() {
		Ok(()) => {
			if let Err(err) = apic::init() {
				warn!("APIC initialization failed: {err}");
			}
		}
		Err(err) => warn!("ACPI initialization failed: {err}"),
	}

	if apic::is_initialized() {
		pic::mask_all();
	} else {
		// Fall back to the legacy controller.
		interrupts::install_controller(&pic::PIC_DRIVER);
	}

	// With the APIC tables parsed, the boot CPU knows its real id.
	CoreLocal::install(core_local::core_id());
	crate::mm::init();

	CPU_ONLINE.fetch_add(1, Ordering::Release);
}

/// Boot all application processors. Returns once every responding CPU has
/// been counted.
#[cfg(all(target_arch = "x86", target_os = "none", feature = "smp"))]
pub fn boot_application_processors() {
	apic::boot_application_processors();
}

#[cfg(all(not(all(target_arch = "x86", target_os = "none")), feature = "smp"))]
pub fn boot_application_processors() {}

/// Initialization of an application processor, running on its boot stack.
#[cfg(feature = "smp")]
pub fn application_processor_init() {
	idt::install();
	apic::init_ap();

	CoreLocal::install(core_local::core_id());
	CPU_ONLINE.fetch_add(1, Ordering::Release);

	// Hold still until the boot processor has counted everyone.
	apic::wait_for_init_sequence_end();
}

#[cfg(not(feature = "smp"))]
pub fn application_processor_init() {}

/// Entry of an application processor, reached from the trampoline.
#[cfg(all(target_arch = "x86", target_os = "none", feature = "smp"))]
pub(crate) unsafe extern "C" fn application_processor_entry() -> ! {
	crate::application_processor_main()
}
