//! Device drivers.

pub mod blk;
