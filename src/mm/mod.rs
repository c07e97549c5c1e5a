//! Kernel heap bring-up.
//!
//! The heap lives in a statically reserved arena inside the kernel image and
//! is claimed by the allocator on first use.

#[cfg(target_os = "none")]
use hermit_sync::RawInterruptTicketMutex;
#[cfg(target_os = "none")]
use talc::{ClaimOnOom, Span, Talc, Talck};

#[cfg(target_os = "none")]
use crate::config::KERNEL_HEAP_SIZE;

#[cfg(target_os = "none")]
#[repr(align(4096))]
struct Arena([u8; KERNEL_HEAP_SIZE]);

#[cfg(target_os = "none")]
static mut ARENA: Arena = Arena([0; KERNEL_HEAP_SIZE]);

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: Talck<RawInterruptTicketMutex, ClaimOnOom> = Talc::new(unsafe {
	ClaimOnOom::new(Span::from_array(core::ptr::addr_of_mut!(ARENA.0)))
})
.lock();

pub fn init() {
	#[cfg(target_os = "none")]
	info!(
		"Kernel heap spans {} KiB at {:p}",
		KERNEL_HEAP_SIZE >> 10,
		core::ptr::addr_of!(ARENA)
	);
}
