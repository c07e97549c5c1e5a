use hermit_sync::InterruptTicketMutex;

use crate::error::{KernelError, Result};
use crate::synch::semaphore::Semaphore;

/// A single-slot, synchronous rendezvous channel.
///
/// Internally two semaphores run the show: `read_sem` counts filled slots,
/// `write_sem` counts empty ones. A `post` therefore blocks while the slot
/// is occupied, a `pend` blocks while it is empty.
pub struct Mailbox<T> {
	read_sem: Semaphore,
	write_sem: Semaphore,
	slot: InterruptTicketMutex<Option<T>>,
}

fn uninitialized(err: KernelError) -> KernelError {
	match err {
		KernelError::SemUninitialized => KernelError::MailboxUninitialized,
		other => other,
	}
}

impl<T> Mailbox<T> {
	pub const fn new() -> Self {
		Self {
			read_sem: Semaphore::new(0),
			write_sem: Semaphore::new(1),
			slot: InterruptTicketMutex::new(None),
		}
	}

	/// Deposit a message, blocking while the slot is occupied.
	pub fn post(&self, value: T) -> Result<()> {
		self.write_sem.acquire().map_err(uninitialized)?;

		let previous = self.slot.lock().replace(value);
		assert!(previous.is_none(), "mailbox slot was already occupied");

		self.read_sem.release().map_err(uninitialized)
	}

	/// Take the message out of the slot, blocking while it is empty.
	pub fn pend(&self) -> Result<T> {
		self.read_sem.acquire().map_err(uninitialized)?;

		let value = self
			.slot
			.lock()
			.take()
			.expect("mailbox slot was empty after a successful pend");

		self.write_sem.release().map_err(uninitialized)?;
		Ok(value)
	}

	/// Whether no message is waiting.
	pub fn is_empty(&self) -> Result<bool> {
		Ok(self.read_sem.count().map_err(uninitialized)? == 0)
	}

	/// Invalidate the mailbox; every parked thread wakes up with
	/// [`KernelError::MailboxUninitialized`].
	pub fn destroy(&self) {
		self.read_sem.destroy();
		self.write_sem.destroy();
	}
}

impl<T> Default for Mailbox<T> {
	fn default() -> Self {
		Self::new()
	}
}
