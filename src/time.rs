//! The kernel time base: a monotonic tick counter advanced by the periodic
//! timer interrupt of CPU 0.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TIMER_GRANULARITY_IN_MS;

static TIMER_TICKS: AtomicU64 = AtomicU64::new(0);

/// Advance the global time by one tick. Called from the timer interrupt.
pub(crate) fn tick() {
	TIMER_TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since the tick source started.
pub fn get_timer_ticks() -> u64 {
	TIMER_TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since the tick source started.
pub fn get_uptime_ms() -> u64 {
	get_timer_ticks() * TIMER_GRANULARITY_IN_MS
}

/// Absolute deadline in milliseconds for a sleep of `ms`.
///
/// One tick is deducted to compensate for the quantization of the tick
/// source: a sleeper must not come back later than one tick after the
/// requested time.
pub fn wakeup_deadline_ms(ms: u64) -> u64 {
	let now = get_uptime_ms();
	(now + ms).saturating_sub(TIMER_GRANULARITY_IN_MS).max(now)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deadline_is_quantization_compensated() {
		let now = get_uptime_ms();

		// Sleeping for one granularity unit may elapse immediately.
		assert_eq!(wakeup_deadline_ms(TIMER_GRANULARITY_IN_MS), now);
		// Longer sleeps end one tick early.
		assert_eq!(
			wakeup_deadline_ms(5 * TIMER_GRANULARITY_IN_MS),
			now + 4 * TIMER_GRANULARITY_IN_MS
		);
		// A zero sleep never lands in the past.
		assert_eq!(wakeup_deadline_ms(0), now);
	}
}
