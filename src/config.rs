#[allow(dead_code)]
pub const KERNEL_HEAP_SIZE: usize = 0x40_0000;

#[allow(dead_code)]
pub const KERNEL_STACK_SIZE: usize = 0x4000;

#[allow(dead_code)]
pub const DEFAULT_STACK_SIZE: usize = 0x8000;

/// Upper bound of CPUs the per-CPU tables are sized for.
#[allow(dead_code)]
pub const MAX_CORES: usize = 8;

/// Frequency of the periodic scheduler tick.
#[allow(dead_code)]
pub const TIMER_FREQUENCY_IN_HZ: u64 = 100;

/// Length of one scheduler tick in milliseconds.
#[allow(dead_code)]
pub const TIMER_GRANULARITY_IN_MS: u64 = 1000 / TIMER_FREQUENCY_IN_HZ;
