use thiserror::Error;

/// The kernel-wide error enumeration.
///
/// Programming errors inside the scheduler, the interrupt dispatcher or the
/// synchronization primitives are not represented here; they panic instead.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum KernelError {
	#[error("unexpected null pointer")]
	NullPointer,
	#[error("argument out of range")]
	OutOfRange,
	#[error("access outside of the valid area")]
	OutOfBound,
	#[error("kernel allocation failed")]
	MallocFailed,
	#[error("invalid alignment")]
	Align,
	#[error("operation not permitted")]
	UnauthorizedAction,
	#[error("forbidden priority")]
	ForbiddenPriority,
	#[error("no such id")]
	NoSuchId,
	#[error("interrupt handler already registered")]
	InterruptAlreadyRegistered,
	#[error("interrupt handler not registered")]
	InterruptNotRegistered,
	#[error("no such irq line")]
	NoSuchIrqLine,
	#[error("interrupt line outside of the manageable range")]
	UnauthorizedInterruptLine,
	#[error("checksum mismatch")]
	CheckSumFailed,
	#[error("acpi is not supported on this machine")]
	AcpiUnsupported,
	#[error("acpi has not been initialized")]
	AcpiNotInitialized,
	#[error("no such local apic id")]
	NoSuchLapicId,
	#[error("wrong partition type")]
	WrongPartitionType,
	#[error("file not found")]
	FileNotFound,
	#[error("directory is not empty")]
	DirNotEmpty,
	#[error("name too long")]
	NameTooLong,
	#[error("resource is locked")]
	Locked,
	#[error("operation not supported")]
	NotSupported,
	#[error("mapping already exists")]
	MappingAlreadyExists,
	#[error("semaphore has been destroyed")]
	SemUninitialized,
	#[error("mailbox has been destroyed")]
	MailboxUninitialized,
	#[error("queue has been destroyed")]
	QueueUninitialized,
}

pub type Result<T> = core::result::Result<T, KernelError>;
