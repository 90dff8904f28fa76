use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

/// A counter that can be cloned into worker threads and read from a progress reporter.
#[derive(Clone, Debug)]
pub struct ProgressCounter {
	current: Arc<AtomicU64>,
	total: u64,
}

impl ProgressCounter {
	pub fn new(total: u64) -> Self {
		Self {
			current: Arc::new(AtomicU64::new(0)),
			total,
		}
	}

	pub fn total(&self) -> u64 {
		self.total
	}

	pub fn get(&self) -> u64 {
		self.current.load(Ordering::Relaxed)
	}

	pub fn inc(&self, amount: u64) {
		self.current.fetch_add(amount, Ordering::Relaxed);
	}
}

#[test]
fn test_progress_counter() {
	let counter = ProgressCounter::new(4);
	let worker = counter.clone();
	worker.inc(1);
	worker.inc(2);
	assert_eq!(counter.get(), 3);
	assert_eq!(counter.total(), 4);
	worker.inc(5);
	assert_eq!(counter.get(), 8);
}
