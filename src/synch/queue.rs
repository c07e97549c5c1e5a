use alloc::vec::Vec;

use hermit_sync::InterruptTicketMutex;

use crate::error::{KernelError, Result};
use crate::synch::semaphore::Semaphore;

/// The ring buffer behind a [`BoundedQueue`].
struct RingBuffer<T> {
	buffer: Vec<Option<T>>,
	head: usize,
	tail: usize,
	size: usize,
}

impl<T> RingBuffer<T> {
	fn new(capacity: usize) -> Self {
		Self {
			buffer: (0..capacity).map(|_| None).collect(),
			head: 0,
			tail: 0,
			size: 0,
		}
	}

	fn enqueue(&mut self, value: T) {
		let previous = self.buffer[self.tail].replace(value);
		assert!(previous.is_none(), "ring buffer slot was still occupied");

		self.tail = (self.tail + 1) % self.buffer.len();
		self.size += 1;
	}

	fn dequeue(&mut self) -> T {
		let value = self.buffer[self.head]
			.take()
			.expect("ring buffer slot was empty");

		self.head = (self.head + 1) % self.buffer.len();
		self.size -= 1;
		value
	}
}

fn uninitialized(err: KernelError) -> KernelError {
	match err {
		KernelError::SemUninitialized => KernelError::QueueUninitialized,
		other => other,
	}
}

/// A bounded, blocking multi-producer multi-consumer queue.
///
/// `read_sem` counts stored items, `write_sem` counts free slots; the ring
/// indices themselves are guarded by the queue's own lock.
pub struct BoundedQueue<T> {
	read_sem: Semaphore,
	write_sem: Semaphore,
	ring: InterruptTicketMutex<RingBuffer<T>>,
}

impl<T> BoundedQueue<T> {
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0, "a queue needs at least one slot");

		Self {
			read_sem: Semaphore::new(0),
			write_sem: Semaphore::new(capacity as isize),
			ring: InterruptTicketMutex::new(RingBuffer::new(capacity)),
		}
	}

	/// Append a value, blocking while the queue is full.
	pub fn post(&self, value: T) -> Result<()> {
		self.write_sem.acquire().map_err(uninitialized)?;
		self.ring.lock().enqueue(value);
		self.read_sem.release().map_err(uninitialized)
	}

	/// Take the oldest value, blocking while the queue is empty.
	pub fn pend(&self) -> Result<T> {
		self.read_sem.acquire().map_err(uninitialized)?;
		let value = self.ring.lock().dequeue();
		self.write_sem.release().map_err(uninitialized)?;
		Ok(value)
	}

	/// Number of stored items.
	pub fn size(&self) -> usize {
		self.ring.lock().size
	}

	pub fn is_empty(&self) -> bool {
		self.size() == 0
	}

	/// Invalidate the queue; every parked thread wakes up with
	/// [`KernelError::QueueUninitialized`].
	pub fn destroy(&self) {
		self.read_sem.destroy();
		self.write_sem.destroy();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ring_wraps_around() {
		let mut ring = RingBuffer::new(3);

		ring.enqueue(1);
		ring.enqueue(2);
		assert_eq!(ring.dequeue(), 1);

		ring.enqueue(3);
		ring.enqueue(4);
		assert_eq!(ring.size, 3);

		assert_eq!(ring.dequeue(), 2);
		assert_eq!(ring.dequeue(), 3);
		assert_eq!(ring.dequeue(), 4);
		assert_eq!(ring.size, 0);

		// Indices have wrapped; the buffer stays usable.
		ring.enqueue(5);
		assert_eq!(ring.dequeue(), 5);
	}

	#[test]
	#[should_panic(expected = "ring buffer slot was empty")]
	fn dequeue_on_empty_is_a_bug() {
		let mut ring = RingBuffer::<u32>::new(2);
		ring.dequeue();
	}
}
