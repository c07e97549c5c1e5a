pub mod kernel;
pub mod mm;

pub use self::kernel::core_local;
pub use self::kernel::interrupts;
pub use self::kernel::processor;
pub use self::kernel::scheduler;
pub use self::kernel::switch::{switch_to_fpu_owner, switch_to_task};
#[cfg(feature = "smp")]
pub use self::kernel::{apic::wakeup_core, boot_application_processors};
pub use self::kernel::{
	application_processor_init, boot_processor_init, get_processor_count, message_output_init,
	output_message_buf,
};
