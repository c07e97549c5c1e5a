//! The low-level context switch.

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod asm {
	/// Save the caller's context on its stack, publish the resulting stack
	/// pointer through `old_stack` and resume the context stored at
	/// `new_stack`.
	///
	/// CR0.TS is set on the way so that the first FPU instruction of the
	/// resumed thread traps into the lazy FPU switch.
	#[unsafe(naked)]
	pub unsafe extern "C" fn switch_to_task(_old_stack: *mut usize, _new_stack: usize) {
		core::arch::naked_asm!(
			"mov eax, [esp + 4]",
			"mov edx, [esp + 8]",
			// store context
			"pushfd",
			"pusha",
			"mov [eax], esp",
			// load the new context
			"mov esp, edx",
			"mov eax, cr0",
			"or eax, 8",
			"mov cr0, eax",
			"popa",
			"popfd",
			"ret",
		)
	}

	/// Like [`switch_to_task`], but for resuming the thread that already
	/// owns the FPU: CR0.TS stays clear, saving the bogus trap.
	#[unsafe(naked)]
	pub unsafe extern "C" fn switch_to_fpu_owner(_old_stack: *mut usize, _new_stack: usize) {
		core::arch::naked_asm!(
			"mov eax, [esp + 4]",
			"mov edx, [esp + 8]",
			"pushfd",
			"pusha",
			"mov [eax], esp",
			"mov esp, edx",
			"clts",
			"popa",
			"popfd",
			"ret",
		)
	}
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use self::asm::{switch_to_fpu_owner, switch_to_task};

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub unsafe extern "C" fn switch_to_task(_old_stack: *mut usize, _new_stack: usize) {}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub unsafe extern "C" fn switch_to_fpu_owner(_old_stack: *mut usize, _new_stack: usize) {}
