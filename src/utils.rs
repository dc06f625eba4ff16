use std::time::Duration;

/// Creates an interval that ticks at `period` without trying to catch up
/// after delays. With `yield_immediately` the first tick fires at once.
pub fn make_periodic_tick(period: Duration, yield_immediately: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		if yield_immediately {
			tokio::time::Instant::now()
		} else {
			tokio::time::Instant::now() + period
		},
		period,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}
