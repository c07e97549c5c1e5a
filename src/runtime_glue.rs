//! Runtime support for the bare-metal target.

use core::panic::PanicInfo;

use crate::arch::x86::kernel::core_local::core_id;
use crate::arch::x86::kernel::{apic, processor};

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
	// Silence the other CPUs first so the report stays readable.
	apic::ipi_halt_other_cores();

	println!();
	println!("[{}][PANIC] {info}", core_id());

	processor::shutdown()
}
