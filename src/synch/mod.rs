//! Synchronization primitives.
//!
//! All three primitives share the same skeleton: an interrupt-safe spinlock
//! around their state, an initialized flag and a FIFO wait list of thread
//! handles. Wait lists deliberately ignore priority.

pub mod mailbox;
pub mod queue;
pub mod semaphore;
