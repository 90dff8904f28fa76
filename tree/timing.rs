use num_traits::ToPrimitive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct Timing {
	pub split_points: TimingDuration,
	pub score_rows: TimingDuration,
	pub accumulate: TimingDuration,
	pub reduce_precision: TimingDuration,
	pub decide: TimingDuration,
	pub insert_leaves: TimingDuration,
	pub final_pass: TimingDuration,
	pub compress: TimingDuration,
}

pub struct TimingDuration(AtomicU64);

impl Timing {
	pub fn new() -> Timing {
		Timing {
			split_points: TimingDuration::new(),
			score_rows: TimingDuration::new(),
			accumulate: TimingDuration::new(),
			reduce_precision: TimingDuration::new(),
			decide: TimingDuration::new(),
			insert_leaves: TimingDuration::new(),
			final_pass: TimingDuration::new(),
			compress: TimingDuration::new(),
		}
	}
}

impl Default for Timing {
	fn default() -> Self {
		Timing::new()
	}
}

impl TimingDuration {
	pub fn new() -> Self {
		Self(AtomicU64::new(0))
	}
	pub fn get(&self) -> Duration {
		Duration::from_nanos(self.0.load(Ordering::Relaxed))
	}
	pub fn inc(&self, value: Duration) -> u64 {
		self.0
			.fetch_add(value.as_nanos().to_u64().unwrap(), Ordering::Relaxed)
	}
}

impl std::fmt::Debug for TimingDuration {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}", self.get())
	}
}
