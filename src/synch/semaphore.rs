use alloc::collections::VecDeque;

use hermit_sync::InterruptTicketMutex;

use crate::arch::x86::kernel::core_local::{core_scheduler, is_in_interrupt};
use crate::error::{KernelError, Result};
use crate::scheduler;
use crate::scheduler::task::{ThreadHandle, WaitReason};

struct SemaphoreState {
	/// Resource available count. Negative initial values are allowed.
	count: isize,
	/// Cleared by `destroy`; parked threads observe this and bail out.
	ready: bool,
	/// Waiting threads in arrival order. Priority is deliberately not
	/// honored here.
	queue: VecDeque<ThreadHandle>,
}

impl SemaphoreState {
	/// Non-blocking acquisition attempt. Reports the count left after a
	/// successful decrement.
	fn try_acquire(&mut self) -> Result<isize> {
		if !self.ready {
			return Err(KernelError::SemUninitialized);
		}

		if self.count < 1 {
			return Err(KernelError::Locked);
		}

		self.count -= 1;
		Ok(self.count)
	}

	/// Increment the count and take the next thread to wake, if any.
	fn release(&mut self) -> Result<Option<ThreadHandle>> {
		if !self.ready {
			return Err(KernelError::SemUninitialized);
		}

		self.count += 1;
		if self.count > 0 {
			Ok(self.queue.pop_front())
		} else {
			Ok(None)
		}
	}

	fn tear_down(&mut self) -> Option<ThreadHandle> {
		self.ready = false;
		self.queue.pop_front()
	}
}

/// A counting, blocking semaphore.
///
/// Access is granted while the counter is positive; each acquisition blocks
/// the calling thread until that holds, and each release increments the
/// counter and unblocks the longest waiting thread.
pub struct Semaphore {
	state: InterruptTicketMutex<SemaphoreState>,
}

impl Semaphore {
	/// Creates a new semaphore with the initial count specified.
	pub const fn new(count: isize) -> Self {
		Self {
			state: InterruptTicketMutex::new(SemaphoreState {
				count,
				ready: true,
				queue: VecDeque::new(),
			}),
		}
	}

	/// Acquire a resource, blocking until one is available.
	///
	/// Fails with [`KernelError::SemUninitialized`] if the semaphore is
	/// destroyed, also while the caller is already parked on it.
	pub fn acquire(&self) -> Result<()> {
		let core_scheduler = core_scheduler();

		loop {
			let mut locked_state = self.state.lock();

			if !locked_state.ready {
				return Err(KernelError::SemUninitialized);
			}

			if locked_state.count > 0 {
				locked_state.count -= 1;
				return Ok(());
			}

			// No resource; park ourselves and retry after the wakeup. The
			// predicate must be re-checked because a destroy may have
			// intervened.
			let handle = core_scheduler.block_current_thread(WaitReason::Sem);
			locked_state.queue.push_back(handle);
			drop(locked_state);

			core_scheduler.reschedule();
		}
	}

	/// Non-blocking variant of [`Semaphore::acquire`]. On success the count
	/// remaining after the decrement is reported; otherwise
	/// [`KernelError::Locked`] is returned and the count is untouched.
	pub fn try_acquire(&self) -> Result<isize> {
		self.state.lock().try_acquire()
	}

	/// Release a resource, waking the longest waiting thread.
	pub fn release(&self) -> Result<()> {
		let waiter = self.state.lock().release()?;

		if let Some(handle) = waiter {
			// Handlers must not schedule on top of the running interrupt.
			scheduler::unblock_thread(handle, WaitReason::Sem, !is_in_interrupt());
		}

		Ok(())
	}

	/// The current count.
	pub fn count(&self) -> Result<isize> {
		let locked_state = self.state.lock();

		if !locked_state.ready {
			return Err(KernelError::SemUninitialized);
		}

		Ok(locked_state.count)
	}

	/// Invalidate the semaphore and wake every parked thread. The woken
	/// threads observe the invalidation and fail their pending acquire with
	/// [`KernelError::SemUninitialized`].
	pub fn destroy(&self) {
		loop {
			let waiter = self.state.lock().tear_down();

			match waiter {
				Some(handle) => scheduler::unblock_thread(handle, WaitReason::Sem, false),
				None => break,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::scheduler::task::{NORMAL_PRIO, ThreadId};

	fn state(count: isize) -> SemaphoreState {
		SemaphoreState {
			count,
			ready: true,
			queue: VecDeque::new(),
		}
	}

	fn handle(id: i32) -> ThreadHandle {
		ThreadHandle::new(ThreadId::from(id), NORMAL_PRIO, 0)
	}

	#[test]
	fn try_acquire_reports_remaining_count() {
		let mut state = state(2);

		assert_eq!(state.try_acquire(), Ok(1));
		assert_eq!(state.try_acquire(), Ok(0));
		assert_eq!(state.try_acquire(), Err(KernelError::Locked));
		// A failed attempt must not consume anything.
		assert_eq!(state.count, 0);
	}

	#[test]
	fn release_balances_acquire() {
		let mut state = state(0);
		let initial = state.count;
		let mut posts = 0isize;
		let mut pends = 0isize;

		for _ in 0..5 {
			state.release().unwrap();
			posts += 1;
		}
		while state.try_acquire().is_ok() {
			pends += 1;
		}

		assert_eq!(posts - pends, state.count - initial);
	}

	#[test]
	fn release_wakes_in_fifo_order() {
		let mut state = state(0);
		state.queue.push_back(handle(1));
		state.queue.push_back(handle(2));
		state.queue.push_back(handle(3));

		assert_eq!(state.release().unwrap().unwrap().get_id(), ThreadId::from(1));
		assert_eq!(state.release().unwrap().unwrap().get_id(), ThreadId::from(2));
		assert_eq!(state.release().unwrap().unwrap().get_id(), ThreadId::from(3));
		assert_eq!(state.release().unwrap(), None);
	}

	#[test]
	fn tear_down_drains_all_waiters() {
		let mut state = state(0);
		state.queue.push_back(handle(1));
		state.queue.push_back(handle(2));

		assert!(state.tear_down().is_some());
		assert!(state.tear_down().is_some());
		assert!(state.tear_down().is_none());
		assert_eq!(state.try_acquire(), Err(KernelError::SemUninitialized));
	}

	#[test]
	fn negative_initial_count_needs_extra_releases() {
		let mut state = state(-2);

		assert_eq!(state.try_acquire(), Err(KernelError::Locked));
		state.release().unwrap();
		state.release().unwrap();
		assert_eq!(state.try_acquire(), Err(KernelError::Locked));
		state.release().unwrap();
		assert_eq!(state.try_acquire(), Ok(0));
	}
}
