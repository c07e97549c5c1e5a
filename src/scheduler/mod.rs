use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::Rc;
use core::cell::RefCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering};

use ahash::RandomState;
use crossbeam_utils::Backoff;
use hashbrown::HashMap;
use hermit_sync::InterruptTicketMutex;
#[cfg(feature = "smp")]
use hermit_sync::SpinMutex;
use smallvec::SmallVec;

use crate::arch;
use crate::arch::x86::kernel::core_local::*;
use crate::arch::x86::kernel::interrupts::{self, SCHEDULER_INT_LINE};
use crate::arch::x86::kernel::processor;
use crate::arch::x86::kernel::scheduler::ThreadStacks;
use crate::arch::x86::kernel::switch::{switch_to_fpu_owner, switch_to_task};
#[cfg(feature = "smp")]
use crate::config::MAX_CORES;
use crate::error::{KernelError, Result};
use crate::scheduler::task::*;
use crate::time;

pub mod task;

/// Unique identifier for a CPU core.
pub type CoreId = u32;

/// Number of threads excluding the per-CPU idle threads.
static NO_THREADS: AtomicU32 = AtomicU32::new(0);

/// The global thread table, holding a weak handle for every live thread.
static THREADS: InterruptTicketMutex<HashMap<ThreadId, ThreadHandle, RandomState>> =
	InterruptTicketMutex::new(HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)));

/// Exit code and cause of finished threads, consumed by `join`.
static EXIT_STATES: InterruptTicketMutex<HashMap<ThreadId, (i32, ExitCause), RandomState>> =
	InterruptTicketMutex::new(HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)));

/// Map between a thread id and the threads waiting to join it.
static WAITING_JOINERS: InterruptTicketMutex<BTreeMap<ThreadId, VecDeque<ThreadHandle>>> =
	InterruptTicketMutex::new(BTreeMap::new());

/// Parent/child relations, kept as integer keys so that no control block
/// ever holds a pointer into another core's control blocks.
static FAMILY: InterruptTicketMutex<BTreeMap<ThreadId, FamilyRecord>> =
	InterruptTicketMutex::new(BTreeMap::new());

/// Per-core scheduler input queues, filled by other cores.
#[cfg(feature = "smp")]
static SCHEDULER_INPUTS: SpinMutex<[Option<&'static InterruptTicketMutex<SchedulerInput>>; MAX_CORES]> =
	SpinMutex::new([None; MAX_CORES]);

/// Id of the INIT thread, the inheritor of every orphaned thread.
static INIT_THREAD_ID: AtomicI32 = AtomicI32::new(-1);

static SYSTEM_STATE: AtomicU8 = AtomicU8::new(SystemState::Booting as u8);

/// Lifecycle of the whole kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemState {
	Booting = 0,
	Running = 1,
	Halted = 2,
}

pub fn get_system_state() -> SystemState {
	match SYSTEM_STATE.load(Ordering::Acquire) {
		0 => SystemState::Booting,
		1 => SystemState::Running,
		_ => SystemState::Halted,
	}
}

pub(crate) fn set_system_state(state: SystemState) {
	SYSTEM_STATE.store(state as u8, Ordering::Release);
}

struct FamilyRecord {
	parent: ThreadId,
	children: SmallVec<[ThreadId; 4]>,
}

/// Requests another core has queued for this core's scheduler.
pub(crate) struct SchedulerInput {
	/// Threads created by another core.
	new_threads: VecDeque<NewThread>,
	/// Threads another core wants woken up, with the wait reason to check.
	wakeup_threads: VecDeque<(ThreadHandle, WaitReason)>,
}

impl SchedulerInput {
	pub fn new() -> Self {
		Self {
			new_threads: VecDeque::new(),
			wakeup_threads: VecDeque::new(),
		}
	}
}

#[repr(align(64))]
pub(crate) struct PerCoreScheduler {
	/// Core id of this per-core scheduler.
	core_id: CoreId,
	/// The thread that currently occupies this CPU.
	current_thread: Rc<RefCell<Thread>>,
	/// The idle thread of this CPU.
	idle_thread: Rc<RefCell<Thread>>,
	/// The thread whose context currently sits in the FPU.
	fpu_owner: Rc<RefCell<Thread>>,
	/// Threads ready to run, by priority.
	ready_queue: PriorityTaskQueue,
	/// Sleeping and waiting threads, ordered by wakeup deadline.
	blocked_threads: BlockedThreadQueue,
	/// Exited threads awaiting the release of their control blocks.
	zombie_threads: VecDeque<Rc<RefCell<Thread>>>,
	/// How often this CPU scheduled.
	schedule_count: u64,
	/// How often the idle thread was selected.
	idle_schedule_count: u64,
}

struct NewThread {
	tid: ThreadId,
	parent_id: ThreadId,
	name: ThreadName,
	func: extern "C" fn(usize) -> i32,
	arg: usize,
	prio: Priority,
	core_id: CoreId,
	stacks: ThreadStacks,
}

impl From<NewThread> for Thread {
	fn from(value: NewThread) -> Self {
		let NewThread {
			tid,
			parent_id,
			name,
			func,
			arg,
			prio,
			core_id,
			stacks,
		} = value;
		let mut thread = Thread::new(
			tid,
			parent_id,
			name,
			core_id,
			ThreadStatus::Ready,
			prio,
			stacks,
		);
		thread.create_stack_frame(func, arg);
		thread
	}
}

impl PerCoreScheduler {
	/// Create a new thread.
	///
	/// `affinity` pins the thread to a CPU; without one the cores are used
	/// round-robin. The returned id is a weak handle whose validity ends
	/// when the thread is reaped.
	pub fn spawn(
		name: &str,
		func: extern "C" fn(usize) -> i32,
		arg: usize,
		prio: Priority,
		stack_size: usize,
		affinity: Option<CoreId>,
	) -> Result<ThreadId> {
		if prio > LOWEST_PRIO {
			return Err(KernelError::ForbiddenPriority);
		}

		let core_id = match affinity {
			Some(core_id) => {
				if core_id >= arch::get_processor_count() {
					return Err(KernelError::OutOfRange);
				}
				core_id
			}
			None => {
				static CORE_COUNTER: AtomicU32 = AtomicU32::new(0);
				CORE_COUNTER.fetch_add(1, Ordering::SeqCst) % arch::get_processor_count()
			}
		};

		let stacks = ThreadStacks::new(stack_size)?;
		let tid = get_tid();
		let parent_id = core_scheduler().get_current_thread_id();
		let new_thread = NewThread {
			tid,
			parent_id,
			name: thread_name(name),
			func,
			arg,
			prio,
			core_id,
			stacks,
		};

		// Link the new thread into the global tables and its target core's
		// ready queue in one critical section.
		let wakeup = interrupts::without_interrupts(|| {
			#[cfg(feature = "smp")]
			let mut input_locked = get_scheduler_input(core_id).lock();

			WAITING_JOINERS.lock().insert(tid, VecDeque::with_capacity(1));
			THREADS
				.lock()
				.insert(tid, ThreadHandle::new(tid, prio, core_id));
			{
				let mut family = FAMILY.lock();
				family.insert(
					tid,
					FamilyRecord {
						parent: parent_id,
						children: SmallVec::new(),
					},
				);
				family
					.entry(parent_id)
					.or_insert_with(|| FamilyRecord {
						parent: parent_id,
						children: SmallVec::new(),
					})
					.children
					.push(tid);
			}
			NO_THREADS.fetch_add(1, Ordering::SeqCst);

			if core_id == core_scheduler().core_id {
				let thread = Rc::new(RefCell::new(Thread::from(new_thread)));
				core_scheduler().ready_queue.push(thread);
				false
			} else {
				#[cfg(feature = "smp")]
				{
					input_locked.new_threads.push_back(new_thread);
					true
				}
				#[cfg(not(feature = "smp"))]
				panic!("invalid core id {core_id}")
			}
		});

		debug!("Created thread {tid} with priority {prio} on core {core_id}");

		#[cfg(feature = "smp")]
		if wakeup {
			arch::wakeup_core(core_id);
		}
		#[cfg(not(feature = "smp"))]
		let _ = wakeup;

		Ok(tid)
	}

	/// Terminate the current thread with the given exit code and cause.
	pub fn exit_with_cause(&mut self, exit_code: i32, cause: ExitCause) -> ! {
		let init_id = get_init_thread_id();

		interrupts::without_interrupts(|| {
			let id = {
				let mut borrowed = self.current_thread.borrow_mut();
				assert_ne!(
					borrowed.status,
					ThreadStatus::Idle,
					"the idle thread cannot exit"
				);

				debug!(
					"Finishing thread {} with exit code {exit_code} ({cause:?})",
					borrowed.id
				);
				borrowed.status = ThreadStatus::Zombie;
				borrowed.exit_code = exit_code;
				borrowed.exit_cause = cause;
				borrowed.end_ticks = time::get_timer_ticks();
				borrowed.id
			};
			NO_THREADS.fetch_sub(1, Ordering::SeqCst);

			// Publish the return state before anyone can observe the thread
			// as gone.
			EXIT_STATES.lock().insert(id, (exit_code, cause));

			// INIT has no ancestor left that could inherit anything.
			if Some(id) != init_id {
				reparent_children(id, init_id);
			}

			// Wake whoever is joining this thread. The table lock must be
			// gone before the wakeup crosses cores.
			let joiners = WAITING_JOINERS.lock().remove(&id);
			if let Some(joiners) = joiners {
				for handle in joiners {
					unblock_thread(handle, WaitReason::Join, false);
				}
			}
		});

		self.reschedule();
		unreachable!()
	}

	/// Trigger the software scheduler vector.
	pub fn reschedule(&mut self) {
		interrupts::raise_interrupt(SCHEDULER_INT_LINE).unwrap();
	}

	/// The wake-up pass: promote every sleeper whose deadline has elapsed.
	pub fn handle_waiting_threads(&mut self) {
		interrupts::without_interrupts(|| {
			self.blocked_threads
				.handle_waiting_threads(time::get_uptime_ms(), &mut self.ready_queue);
		});
	}

	/// Park the current thread for a synchronization primitive. The caller
	/// keeps running until it invokes `reschedule`, which it must do after
	/// releasing the primitive's internal lock.
	pub fn block_current_thread(&mut self, reason: WaitReason) -> ThreadHandle {
		interrupts::without_interrupts(|| {
			let handle = {
				let mut borrowed = self.current_thread.borrow_mut();
				assert_ne!(
					borrowed.status,
					ThreadStatus::Idle,
					"cannot block the idle thread"
				);

				borrowed.status = if reason == WaitReason::Join {
					ThreadStatus::Joining
				} else {
					ThreadStatus::Waiting(reason)
				};
				ThreadHandle::new(borrowed.id, borrowed.prio, borrowed.core_id)
			};

			self.blocked_threads.add(self.current_thread.clone(), None);
			handle
		})
	}

	/// Park the current thread until the deadline (milliseconds of uptime).
	fn block_current_thread_until(&mut self, deadline_ms: u64) {
		interrupts::without_interrupts(|| {
			{
				let mut borrowed = self.current_thread.borrow_mut();
				assert_ne!(
					borrowed.status,
					ThreadStatus::Idle,
					"cannot block the idle thread"
				);
				borrowed.status = ThreadStatus::Sleeping;
			}

			self.blocked_threads
				.add(self.current_thread.clone(), Some(deadline_ms));
		});
	}

	/// Wake a thread parked on this core after validating the wait reason.
	fn unblock_local(&mut self, handle: ThreadHandle, expected_reason: WaitReason) {
		interrupts::without_interrupts(|| {
			let (thread, previous_status) = self
				.blocked_threads
				.custom_wakeup(handle.get_id())
				.expect("tried to wake a thread that is not blocked on this core");

			let reason_matches = match expected_reason {
				WaitReason::Join => previous_status == ThreadStatus::Joining,
				reason => previous_status == ThreadStatus::Waiting(reason),
			};
			assert!(
				reason_matches,
				"thread {} was parked as {previous_status:?}, not for {expected_reason:?}",
				handle.get_id()
			);

			self.ready_queue.push(thread);
		});
	}

	/// Process requests queued by other cores.
	#[cfg(feature = "smp")]
	pub fn check_input(&mut self) {
		let mut input_locked = CoreLocal::get().scheduler_input.lock();

		while let Some((handle, reason)) = input_locked.wakeup_threads.pop_front() {
			self.unblock_local(handle, reason);
		}

		while let Some(new_thread) = input_locked.new_threads.pop_front() {
			let thread = Rc::new(RefCell::new(Thread::from(new_thread)));
			self.ready_queue.push(thread);
		}
	}

	/// Release the control blocks and stacks of reaped threads.
	fn cleanup_threads(&mut self) {
		while let Some(zombie) = self.zombie_threads.pop_front() {
			let id = {
				let mut borrowed = zombie.borrow_mut();
				borrowed.status = ThreadStatus::Dead;
				debug!("Cleaning up {:?}", borrowed);
				borrowed.id
			};

			THREADS.lock().remove(&id);
			// Dropping the reference releases stack and control block.
		}
	}

	/// Save the FPU context for the previous owner and restore it for the
	/// current thread, which wants to use the FPU now.
	pub fn fpu_switch(&mut self) {
		if !Rc::ptr_eq(&self.current_thread, &self.fpu_owner) {
			debug!(
				"Switching FPU owner from thread {} to {}",
				self.fpu_owner.borrow().id,
				self.current_thread.borrow().id
			);

			self.fpu_owner.borrow_mut().last_fpu_state.save();
			self.current_thread.borrow().last_fpu_state.restore();
			self.fpu_owner = self.current_thread.clone();
		}
	}

	#[inline]
	pub fn get_current_thread_id(&self) -> ThreadId {
		interrupts::without_interrupts(|| self.current_thread.borrow().id)
	}

	#[inline]
	pub fn get_current_thread_handle(&self) -> ThreadHandle {
		interrupts::without_interrupts(|| {
			let borrowed = self.current_thread.borrow();
			ThreadHandle::new(borrowed.id, borrowed.prio, borrowed.core_id)
		})
	}

	/// Whether this CPU currently runs its idle thread.
	pub fn is_idle(&self) -> bool {
		interrupts::without_interrupts(|| self.current_thread.borrow().status == ThreadStatus::Idle)
	}

	/// Record the first-schedule timestamp of the current thread.
	pub fn record_start_time(&mut self) {
		interrupts::without_interrupts(|| {
			self.current_thread.borrow_mut().start_ticks = time::get_timer_ticks();
		});
	}

	/// Change the priority of a thread on this core.
	pub fn set_priority(&mut self, id: ThreadId, prio: Priority) -> Result<()> {
		trace!("Changing priority of thread {id} to {prio}");

		interrupts::without_interrupts(|| {
			let handle = get_thread_handle(id).ok_or(KernelError::NoSuchId)?;

			if handle.get_core_id() != self.core_id {
				warn!("Cannot change the priority of a thread owned by another core");
				return Err(KernelError::UnauthorizedAction);
			}

			if self.current_thread.borrow().id == id {
				self.current_thread.borrow_mut().prio = prio;
			} else {
				self.ready_queue
					.set_priority(handle, prio)
					.map_err(|()| KernelError::NoSuchId)?;
			}

			Ok(())
		})
	}

	/// Select the next thread and switch to it. Must run with interrupts
	/// disabled, from interrupt context: a well-formed frame to resume the
	/// outgoing thread lives on its kernel stack.
	pub fn schedule_in_irq(&mut self) {
		self.schedule_count += 1;

		// A reschedule is idle time well spent on housekeeping.
		self.cleanup_threads();

		let (id, last_stack_pointer, prio, status) = {
			let mut borrowed = self.current_thread.borrow_mut();
			(
				borrowed.id,
				ptr::from_mut(&mut borrowed.last_stack_pointer).cast::<usize>(),
				borrowed.prio,
				borrowed.status,
			)
		};

		let mut new_thread = None;

		if status == ThreadStatus::Running {
			// Round robin within the priority: an equally urgent thread may
			// take over.
			if let Some(thread) = self.ready_queue.pop_with_prio(prio) {
				new_thread = Some(thread);
			}
		} else {
			if status == ThreadStatus::Zombie {
				self.zombie_threads.push_back(self.current_thread.clone());
			}

			if let Some(thread) = self.ready_queue.pop() {
				new_thread = Some(thread);
			} else if status != ThreadStatus::Idle {
				// By construction the idle thread is always runnable.
				new_thread = Some(self.idle_thread.clone());
			}
		}

		if let Some(thread) = new_thread {
			if status == ThreadStatus::Running {
				self.current_thread.borrow_mut().status = ThreadStatus::Ready;
				self.ready_queue.push(self.current_thread.clone());
			}

			let (new_id, new_stack_pointer, is_idle, page_directory) = {
				let mut borrowed = thread.borrow_mut();
				let is_idle = borrowed.status == ThreadStatus::Idle;
				if !is_idle {
					borrowed.status = ThreadStatus::Running;
				}

				(
					borrowed.id,
					borrowed.last_stack_pointer.as_usize(),
					is_idle,
					borrowed.page_directory,
				)
			};

			if is_idle {
				self.idle_schedule_count += 1;
			}

			if id != new_id {
				if page_directory != processor::read_cr3() {
					processor::write_cr3(page_directory);
				}

				debug!("Switching thread from {id} to {new_id}");
				let resume_fpu_owner = is_idle || Rc::ptr_eq(&thread, &self.fpu_owner);
				self.current_thread = thread;

				unsafe {
					if resume_fpu_owner {
						switch_to_fpu_owner(last_stack_pointer, new_stack_pointer);
					} else {
						switch_to_task(last_stack_pointer, new_stack_pointer);
					}
				}
			}
		}
	}

	/// The idle loop. Only the idle thread of a CPU runs this.
	pub fn run() -> ! {
		static HALT_BANNER_PRINTED: AtomicBool = AtomicBool::new(false);

		let backoff = Backoff::new();

		loop {
			let core_scheduler = core_scheduler();
			interrupts::disable();

			#[cfg(feature = "smp")]
			core_scheduler.check_input();
			core_scheduler.cleanup_threads();

			if get_system_state() == SystemState::Halted {
				if !HALT_BANNER_PRINTED.swap(true, Ordering::SeqCst) {
					println!();
					println!("*** System halted ({} schedules) ***", {
						core_scheduler.schedule_count
					});
				}
				processor::shutdown();
			}

			if core_scheduler.ready_queue.is_empty() {
				if backoff.is_completed() {
					interrupts::enable_and_wait();
					backoff.reset();
				} else {
					interrupts::enable();
					backoff.snooze();
				}
			} else {
				interrupts::enable();
				core_scheduler.reschedule();
				backoff.reset();
			}
		}
	}
}

fn get_tid() -> ThreadId {
	static TID_COUNTER: AtomicI32 = AtomicI32::new(0);
	let guard = THREADS.lock();

	loop {
		let id = ThreadId::from(TID_COUNTER.fetch_add(1, Ordering::SeqCst));
		if !guard.contains_key(&id) {
			return id;
		}
	}
}

/// Add a per-core scheduler for the current core, including its idle
/// thread.
pub(crate) fn add_current_core() {
	let core_id = core_id();
	let tid = get_tid();
	let idle_thread = Rc::new(RefCell::new(Thread::new_idle(tid, core_id)));

	WAITING_JOINERS.lock().insert(tid, VecDeque::with_capacity(1));
	THREADS
		.lock()
		.insert(tid, ThreadHandle::new(tid, IDLE_PRIO, core_id));

	debug!("Initializing scheduler for core {core_id} with idle thread {tid}");
	let boxed_scheduler = Box::new(PerCoreScheduler {
		core_id,
		current_thread: idle_thread.clone(),
		fpu_owner: idle_thread.clone(),
		idle_thread,
		ready_queue: PriorityTaskQueue::new(),
		blocked_threads: BlockedThreadQueue::new(),
		zombie_threads: VecDeque::new(),
		schedule_count: 0,
		idle_schedule_count: 0,
	});

	set_core_scheduler(Box::into_raw(boxed_scheduler));
	#[cfg(feature = "smp")]
	{
		SCHEDULER_INPUTS.lock()[core_id as usize] = Some(&CoreLocal::get().scheduler_input);
	}
}

#[cfg(feature = "smp")]
fn get_scheduler_input(core_id: CoreId) -> &'static InterruptTicketMutex<SchedulerInput> {
	SCHEDULER_INPUTS.lock()[core_id as usize].expect("scheduler input of an offline core")
}

/// Hold the boot processor until every online core has registered its
/// scheduler, so cross-core spawns cannot outrun the bring-up.
#[cfg(feature = "smp")]
pub(crate) fn wait_until_cores_registered() {
	let expected = arch::get_processor_count() as usize;

	loop {
		let registered = SCHEDULER_INPUTS
			.lock()
			.iter()
			.filter(|input| input.is_some())
			.count();
		if registered >= expected {
			break;
		}

		core::hint::spin_loop();
	}
}

/// Move all children of `id` into INIT's children list and detach `id`
/// from its own parent.
fn reparent_children(id: ThreadId, init_id: Option<ThreadId>) {
	let mut family = FAMILY.lock();

	let Some(record) = family.remove(&id) else {
		return;
	};

	if let Some(parent) = family.get_mut(&record.parent) {
		parent.children.retain(|child| *child != id);
	}

	let Some(init_id) = init_id else {
		assert!(
			record.children.is_empty(),
			"thread {id} exited with children before INIT exists"
		);
		return;
	};

	for child in record.children {
		if let Some(child_record) = family.get_mut(&child) {
			child_record.parent = init_id;
		}
		if let Some(init_record) = family.get_mut(&init_id) {
			init_record.children.push(child);
		}
	}
}

/// Create a thread. See [`PerCoreScheduler::spawn`].
pub fn spawn(
	name: &str,
	func: extern "C" fn(usize) -> i32,
	arg: usize,
	prio: Priority,
	stack_size: usize,
	affinity: Option<CoreId>,
) -> Result<ThreadId> {
	PerCoreScheduler::spawn(name, func, arg, prio, stack_size, affinity)
}

/// Terminate the current thread.
pub fn exit(exit_code: i32) -> ! {
	core_scheduler().exit_with_cause(exit_code, ExitCause::Normal)
}

/// Put the current thread to sleep for at least `ms` milliseconds, give or
/// take one timer tick.
pub fn sleep(ms: u64) -> Result<()> {
	let core_scheduler = core_scheduler();
	if core_scheduler.is_idle() {
		return Err(KernelError::UnauthorizedAction);
	}

	core_scheduler.block_current_thread_until(time::wakeup_deadline_ms(ms));
	core_scheduler.reschedule();
	Ok(())
}

/// Wait until the thread `id` has exited and reap its return state.
pub fn join(id: ThreadId) -> Result<(i32, ExitCause)> {
	let core_scheduler = core_scheduler();

	if core_scheduler.get_current_thread_id() == id {
		return Err(KernelError::UnauthorizedAction);
	}

	debug!(
		"Thread {} is waiting for thread {id}",
		core_scheduler.get_current_thread_id()
	);

	{
		let mut waiting = WAITING_JOINERS.lock();
		if let Some(queue) = waiting.get_mut(&id) {
			queue.push_back(core_scheduler.get_current_thread_handle());
			core_scheduler.block_current_thread(WaitReason::Join);
			drop(waiting);

			core_scheduler.reschedule();
		}
	}

	EXIT_STATES.lock().remove(&id).ok_or(KernelError::NoSuchId)
}

/// Wake a blocked thread, wherever it is parked. `do_schedule` asks for an
/// immediate reschedule; from interrupt context the switch is deferred to
/// the dispatcher epilogue instead.
pub(crate) fn unblock_thread(handle: ThreadHandle, expected_reason: WaitReason, do_schedule: bool) {
	let core_scheduler = core_scheduler();

	if handle.get_core_id() == core_scheduler.core_id {
		core_scheduler.unblock_local(handle, expected_reason);

		if do_schedule {
			if CoreLocal::get().is_in_interrupt() {
				CoreLocal::get().request_reschedule();
			} else {
				core_scheduler.reschedule();
			}
		}
	} else {
		#[cfg(feature = "smp")]
		{
			get_scheduler_input(handle.get_core_id())
				.lock()
				.wakeup_threads
				.push_back((handle, expected_reason));
			arch::wakeup_core(handle.get_core_id());
		}
		#[cfg(not(feature = "smp"))]
		panic!("thread {} lives on an impossible core", handle.get_id());
	}
}

/// Change the priority of a thread.
pub fn set_priority(id: ThreadId, prio: Priority) -> Result<()> {
	if prio > LOWEST_PRIO {
		return Err(KernelError::ForbiddenPriority);
	}

	core_scheduler().set_priority(id, prio)
}

/// Number of live threads, idle threads excluded.
pub fn get_thread_count() -> u32 {
	NO_THREADS.load(Ordering::SeqCst)
}

fn get_thread_handle(id: ThreadId) -> Option<ThreadHandle> {
	THREADS.lock().get(&id).copied()
}

pub(crate) fn set_init_thread_id(id: ThreadId) {
	INIT_THREAD_ID.store(id.into(), Ordering::Release);
}

fn get_init_thread_id() -> Option<ThreadId> {
	match INIT_THREAD_ID.load(Ordering::Acquire) {
		-1 => None,
		id => Some(ThreadId::from(id)),
	}
}

/// Ids of the children the current thread still has.
pub(crate) fn child_of_current_thread() -> Option<ThreadId> {
	let id = core_scheduler().get_current_thread_id();
	FAMILY
		.lock()
		.get(&id)
		.and_then(|record| record.children.first().copied())
}

/// Rust-level entry of every thread: bracket the entry function with the
/// start/end bookkeeping and route its return value into the exit path.
pub(crate) extern "C" fn thread_entry(func: extern "C" fn(usize) -> i32, arg: usize) -> ! {
	core_scheduler().record_start_time();
	let exit_code = func(arg);
	core_scheduler().exit_with_cause(exit_code, ExitCause::Normal)
}

/// Target of the instruction-pointer redirection performed by the
/// exception handlers: runs in the context of the faulting thread at a
/// safe interrupt level and never returns.
pub(crate) extern "C" fn terminated_thread_entry() -> ! {
	let cause = CoreLocal::get()
		.take_pending_exit_cause()
		.unwrap_or(ExitCause::Killed);

	core_scheduler().exit_with_cause(-1, cause)
}
