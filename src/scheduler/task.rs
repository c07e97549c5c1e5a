use alloc::collections::VecDeque;
use alloc::rc::Rc;
use core::cell::RefCell;
use core::num::NonZeroU64;
use core::{cmp, fmt};

use crate::arch::x86::kernel::processor::FpuState;
use crate::arch::x86::kernel::scheduler::ThreadStacks;
use crate::arch::x86::mm::{PhysAddr, VirtAddr};
use crate::scheduler::CoreId;

/// Returns the least significant set bit, i.e. the most urgent occupied
/// priority of a bitmap.
#[inline]
fn lsb(n: u64) -> Option<u32> {
	NonZeroU64::new(n).map(|n| n.trailing_zeros())
}

/// The status of a thread - used for scheduling.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ThreadStatus {
	Ready,
	Running,
	/// Blocked with a wakeup deadline.
	Sleeping,
	/// Blocked on a synchronization primitive.
	Waiting(WaitReason),
	/// Blocked until another thread exits.
	Joining,
	/// Ran to completion, not yet reaped.
	Zombie,
	/// Reaped; the control block is about to be released.
	Dead,
	Idle,
}

/// Why a thread is parked in a wait list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(dead_code)]
pub enum WaitReason {
	Sem,
	Mutex,
	Mailbox,
	Queue,
	Io,
	Join,
}

/// How a thread came to its end.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitCause {
	/// The entry function returned.
	Normal,
	DivByZero,
	PageFault,
	InvalidOpcode,
	ProtectionFault,
	Killed,
}

/// Unique identifier for a thread.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub struct ThreadId(i32);

impl ThreadId {
	pub const fn into(self) -> i32 {
		self.0
	}

	pub const fn from(x: i32) -> Self {
		ThreadId(x)
	}
}

impl fmt::Display for ThreadId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Priority of a thread. Smaller values run first; 0 is the most urgent.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct Priority(u8);

impl Priority {
	pub const fn into(self) -> u8 {
		self.0
	}

	pub const fn from(x: u8) -> Self {
		Priority(x)
	}
}

impl fmt::Display for Priority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[allow(dead_code)]
pub const HIGH_PRIO: Priority = Priority::from(8);
pub const NORMAL_PRIO: Priority = Priority::from(16);
#[allow(dead_code)]
pub const LOW_PRIO: Priority = Priority::from(32);
/// The least urgent priority a thread can be created with.
pub const LOWEST_PRIO: Priority = Priority::from(62);
/// Reserved for the per-CPU idle threads.
pub const IDLE_PRIO: Priority = Priority::from(63);

/// Number of priority levels.
pub const NO_PRIORITIES: usize = 64;

/// Maximum length of a thread name in bytes.
pub const THREAD_NAME_LEN: usize = 32;

pub(crate) type ThreadName = heapless::String<THREAD_NAME_LEN>;

/// Build a thread name, silently truncating to the fixed capacity.
pub(crate) fn thread_name(name: &str) -> ThreadName {
	let mut truncated = ThreadName::new();
	for c in name.chars() {
		if truncated.push(c).is_err() {
			break;
		}
	}
	truncated
}

/// A weak, copyable reference to a thread. Its validity ends when the
/// thread is reaped; every holder has to be prepared for the id to be gone.
#[derive(Copy, Clone, Debug)]
pub(crate) struct ThreadHandle {
	id: ThreadId,
	priority: Priority,
	core_id: CoreId,
}

impl ThreadHandle {
	pub fn new(id: ThreadId, priority: Priority, core_id: CoreId) -> Self {
		Self {
			id,
			priority,
			core_id,
		}
	}

	pub fn get_id(&self) -> ThreadId {
		self.id
	}

	pub fn get_priority(&self) -> Priority {
		self.priority
	}

	pub fn get_core_id(&self) -> CoreId {
		self.core_id
	}
}

impl Ord for ThreadHandle {
	fn cmp(&self, other: &Self) -> cmp::Ordering {
		self.id.cmp(&other.id)
	}
}

impl PartialOrd for ThreadHandle {
	fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl PartialEq for ThreadHandle {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for ThreadHandle {}

/// The per-CPU ready queue: one FIFO list per priority plus an occupancy
/// bitmap scanned from the most urgent bit.
pub(crate) struct PriorityTaskQueue {
	queues: [VecDeque<Rc<RefCell<Thread>>>; NO_PRIORITIES],
	prio_bitmap: u64,
}

impl PriorityTaskQueue {
	pub const fn new() -> PriorityTaskQueue {
		PriorityTaskQueue {
			queues: [const { VecDeque::new() }; NO_PRIORITIES],
			prio_bitmap: 0,
		}
	}

	/// Add a thread by its priority to the queue.
	pub fn push(&mut self, thread: Rc<RefCell<Thread>>) {
		let i = thread.borrow().prio.into() as usize;
		assert!(i < NO_PRIORITIES, "priority {i} is invalid");

		self.prio_bitmap |= 1 << i;
		self.queues[i].push_back(thread);
	}

	fn pop_from_queue(&mut self, queue_index: usize) -> Option<Rc<RefCell<Thread>>> {
		let thread = self.queues[queue_index].pop_front();
		if self.queues[queue_index].is_empty() {
			self.prio_bitmap &= !(1 << queue_index);
		}

		thread
	}

	pub fn is_empty(&self) -> bool {
		self.prio_bitmap == 0
	}

	/// Pop the most urgent thread from the queue.
	pub fn pop(&mut self) -> Option<Rc<RefCell<Thread>>> {
		if let Some(i) = lsb(self.prio_bitmap) {
			return self.pop_from_queue(i as usize);
		}

		None
	}

	/// Pop the next thread if it is at least as urgent as `prio`.
	pub fn pop_with_prio(&mut self, prio: Priority) -> Option<Rc<RefCell<Thread>>> {
		if let Some(i) = lsb(self.prio_bitmap)
			&& i <= u32::from(prio.into())
		{
			return self.pop_from_queue(i as usize);
		}

		None
	}

	/// The most urgent priority currently queued.
	#[allow(dead_code)]
	pub fn get_highest_priority(&self) -> Priority {
		match lsb(self.prio_bitmap) {
			Some(i) => Priority::from(i as u8),
			None => IDLE_PRIO,
		}
	}

	/// Requeue a ready thread under a new priority.
	pub fn set_priority(&mut self, handle: ThreadHandle, prio: Priority) -> Result<(), ()> {
		let old_priority = handle.get_priority().into() as usize;
		let Some(index) = self.queues[old_priority]
			.iter()
			.position(|thread| thread.borrow().id == handle.get_id())
		else {
			return Err(());
		};

		let thread = self.queues[old_priority].remove(index).ok_or(())?;
		if self.queues[old_priority].is_empty() {
			self.prio_bitmap &= !(1 << old_priority);
		}

		thread.borrow_mut().prio = prio;
		self.push(thread);
		Ok(())
	}
}

/// A thread control block.
#[repr(align(64))]
pub(crate) struct Thread {
	/// Unique identifier.
	pub id: ThreadId,
	/// Identifier of the creating thread. Orphans are inherited by INIT.
	pub parent_id: ThreadId,
	/// Human readable name.
	pub name: ThreadName,
	pub status: ThreadStatus,
	pub prio: Priority,
	/// The priority the thread was created with, kept so that a boosted
	/// priority can be restored.
	pub base_prio: Priority,
	/// The CPU this thread is pinned to.
	pub core_id: CoreId,
	/// Last stack pointer before a context switch to another thread.
	pub last_stack_pointer: VirtAddr,
	/// Page directory loaded while this thread runs.
	pub page_directory: PhysAddr,
	/// Last FPU state before a context switch to another thread using the FPU.
	pub last_fpu_state: FpuState,
	/// The thread's kernel stack.
	pub stacks: ThreadStacks,
	pub exit_code: i32,
	pub exit_cause: ExitCause,
	/// Timer tick of the first and the last schedule.
	pub start_ticks: u64,
	pub end_ticks: u64,
}

pub(crate) trait ThreadFrame {
	/// Create the initial stack frame for a new thread.
	fn create_stack_frame(&mut self, func: extern "C" fn(usize) -> i32, arg: usize);
}

impl Thread {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		tid: ThreadId,
		parent_id: ThreadId,
		name: ThreadName,
		core_id: CoreId,
		status: ThreadStatus,
		prio: Priority,
		stacks: ThreadStacks,
	) -> Thread {
		debug!("Creating thread {tid} ({name}) on core {core_id}");

		Thread {
			id: tid,
			parent_id,
			name,
			status,
			prio,
			base_prio: prio,
			core_id,
			last_stack_pointer: VirtAddr::zero(),
			page_directory: crate::arch::x86::kernel::processor::read_cr3(),
			last_fpu_state: FpuState::new(),
			stacks,
			exit_code: 0,
			exit_cause: ExitCause::Normal,
			start_ticks: 0,
			end_ticks: 0,
		}
	}

	/// The idle thread of a CPU inherits the boot stack and is its own
	/// parent; it never exits.
	pub fn new_idle(tid: ThreadId, core_id: CoreId) -> Thread {
		debug!("Creating idle thread {tid} for core {core_id}");

		Thread {
			id: tid,
			parent_id: tid,
			name: thread_name("idle"),
			status: ThreadStatus::Idle,
			prio: IDLE_PRIO,
			base_prio: IDLE_PRIO,
			core_id,
			last_stack_pointer: VirtAddr::zero(),
			page_directory: crate::arch::x86::kernel::processor::read_cr3(),
			last_fpu_state: FpuState::new(),
			stacks: ThreadStacks::from_boot_stacks(),
			exit_code: 0,
			exit_cause: ExitCause::Normal,
			start_ticks: 0,
			end_ticks: 0,
		}
	}
}

impl fmt::Debug for Thread {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"thread {} \"{}\" (parent {}, core {}, prio {}/{}, {:?}, \
			 exit {} ({:?}), alive ticks {}..{})",
			self.id,
			self.name,
			self.parent_id,
			self.core_id,
			self.prio,
			self.base_prio,
			self.status,
			self.exit_code,
			self.exit_cause,
			self.start_ticks,
			self.end_ticks
		)
	}
}

struct BlockedThread {
	thread: Rc<RefCell<Thread>>,
	/// Deadline in milliseconds of uptime; `None` blocks indefinitely.
	wakeup_time: Option<u64>,
}

/// Queue of blocked threads of one CPU, ordered by wakeup deadline with the
/// indefinitely blocked at the tail.
pub(crate) struct BlockedThreadQueue {
	list: VecDeque<BlockedThread>,
}

impl BlockedThreadQueue {
	pub const fn new() -> Self {
		Self {
			list: VecDeque::new(),
		}
	}

	/// Park a thread, optionally until a deadline. The caller has already
	/// set the blocked status.
	pub fn add(&mut self, thread: Rc<RefCell<Thread>>, wakeup_time: Option<u64>) {
		{
			let borrowed = thread.borrow();
			debug!("Blocking thread {}", borrowed.id);
			assert!(
				matches!(
					borrowed.status,
					ThreadStatus::Sleeping | ThreadStatus::Waiting(_) | ThreadStatus::Joining
				),
				"thread {} is not in a blocked state",
				borrowed.id
			);
		}

		let node = BlockedThread {
			thread,
			wakeup_time,
		};

		if let Some(deadline) = wakeup_time {
			let index = self
				.list
				.iter()
				.position(|n| n.wakeup_time.is_none_or(|t| t > deadline))
				.unwrap_or(self.list.len());
			self.list.insert(index, node);
		} else {
			self.list.push_back(node);
		}
	}

	/// Manually wake up a blocked thread. Returns the thread and the status
	/// it was parked with, or `None` if the id is not parked here.
	pub fn custom_wakeup(&mut self, id: ThreadId) -> Option<(Rc<RefCell<Thread>>, ThreadStatus)> {
		let index = self
			.list
			.iter()
			.position(|node| node.thread.borrow().id == id)?;
		let node = self.list.remove(index)?;

		let mut borrowed = node.thread.borrow_mut();
		debug!("Waking up thread {}", borrowed.id);
		let previous_status = borrowed.status;
		borrowed.status = ThreadStatus::Ready;
		drop(borrowed);

		Some((node.thread, previous_status))
	}

	/// The wake-up pass: move every thread whose deadline has elapsed into
	/// the ready queue. Stops at the first thread that is not yet due.
	pub fn handle_waiting_threads(&mut self, now_ms: u64, ready_queue: &mut PriorityTaskQueue) {
		while let Some(node) = self.list.front() {
			match node.wakeup_time {
				Some(deadline) if deadline <= now_ms => {
					let node = self.list.pop_front().unwrap();
					node.thread.borrow_mut().status = ThreadStatus::Ready;
					ready_queue.push(node.thread);
				}
				_ => break,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::arch::x86::kernel::scheduler::ThreadStacks;

	fn test_thread(id: i32, prio: Priority) -> Rc<RefCell<Thread>> {
		let mut thread = Thread::new(
			ThreadId::from(id),
			ThreadId::from(0),
			thread_name("test"),
			0,
			ThreadStatus::Ready,
			prio,
			ThreadStacks::from_boot_stacks(),
		);
		// Tests never switch contexts; the stack stays untouched.
		thread.status = ThreadStatus::Ready;
		Rc::new(RefCell::new(thread))
	}

	#[test]
	fn priority_queue_orders_by_urgency() {
		let mut queue = PriorityTaskQueue::new();
		queue.push(test_thread(1, Priority::from(30)));
		queue.push(test_thread(2, Priority::from(5)));
		queue.push(test_thread(3, Priority::from(62)));
		queue.push(test_thread(4, Priority::from(5)));

		// Priority 5 runs first, FIFO within the level.
		assert_eq!(queue.pop().unwrap().borrow().id, ThreadId::from(2));
		assert_eq!(queue.pop().unwrap().borrow().id, ThreadId::from(4));
		assert_eq!(queue.pop().unwrap().borrow().id, ThreadId::from(1));
		assert_eq!(queue.pop().unwrap().borrow().id, ThreadId::from(3));
		assert!(queue.pop().is_none());
		assert!(queue.is_empty());
	}

	#[test]
	fn pop_with_prio_respects_threshold() {
		let mut queue = PriorityTaskQueue::new();
		queue.push(test_thread(1, Priority::from(40)));

		// A thread running at priority 10 must not be preempted by 40.
		assert!(queue.pop_with_prio(Priority::from(10)).is_none());
		// An equal or less urgent runner yields the slot.
		assert!(queue.pop_with_prio(Priority::from(40)).is_some());
	}

	#[test]
	fn set_priority_requeues() {
		let mut queue = PriorityTaskQueue::new();
		queue.push(test_thread(7, Priority::from(50)));
		let handle = ThreadHandle::new(ThreadId::from(7), Priority::from(50), 0);

		queue.set_priority(handle, Priority::from(3)).unwrap();
		assert_eq!(queue.get_highest_priority(), Priority::from(3));

		let thread = queue.pop().unwrap();
		assert_eq!(thread.borrow().prio, Priority::from(3));
	}

	#[test]
	fn blocked_queue_wakes_in_deadline_order() {
		let mut blocked = BlockedThreadQueue::new();
		let mut ready = PriorityTaskQueue::new();

		let mut sleeper = |id, deadline| {
			let thread = test_thread(id, NORMAL_PRIO);
			thread.borrow_mut().status = ThreadStatus::Sleeping;
			blocked.add(thread, Some(deadline));
		};

		sleeper(1, 300);
		sleeper(2, 100);
		sleeper(3, 200);

		let waiter = test_thread(4, NORMAL_PRIO);
		waiter.borrow_mut().status = ThreadStatus::Waiting(WaitReason::Sem);
		blocked.add(waiter, None);

		blocked.handle_waiting_threads(150, &mut ready);
		assert_eq!(ready.pop().unwrap().borrow().id, ThreadId::from(2));
		assert!(ready.pop().is_none());

		blocked.handle_waiting_threads(1000, &mut ready);
		assert_eq!(ready.pop().unwrap().borrow().id, ThreadId::from(3));
		assert_eq!(ready.pop().unwrap().borrow().id, ThreadId::from(1));
		// The indefinitely parked waiter is never promoted by the wake-up
		// pass.
		assert!(ready.pop().is_none());

		let (woken, previous) = blocked.custom_wakeup(ThreadId::from(4)).unwrap();
		assert_eq!(previous, ThreadStatus::Waiting(WaitReason::Sem));
		assert_eq!(woken.borrow().status, ThreadStatus::Ready);
	}

	#[test]
	fn thread_names_are_truncated() {
		let name = thread_name("a-name-that-goes-way-beyond-the-32-byte-limit");
		assert_eq!(name.len(), THREAD_NAME_LEN);
	}
}
