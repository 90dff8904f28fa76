use crate::{
	bitset::Bitset,
	constraints::Constraints,
	error::Error,
	split::{NaSplitDirection, Split, SplitKind},
};
use num_traits::ToPrimitive;
use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

/// The kind of values a histogram bins. Integer and categorical columns get one bin per value when the range is small enough.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
	Real,
	Integer,
	Categorical,
}

/**
The statistics kept per bin. `Gaussian` keeps the weight, the weighted response sum, and the weighted sum of squares. `Binomial` is used when the response is 0 or 1, so the sum of squares equals the sum and is not stored.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistogramKind {
	Gaussian,
	Binomial,
}

impl HistogramKind {
	fn stride(self) -> usize {
		match self {
			HistogramKind::Gaussian => 3,
			HistogramKind::Binomial => 2,
		}
	}
}

/// How values are mapped to bins. A layout is fixed when the histogram is declared and shared by every copy of it.
#[derive(Clone, Debug)]
pub struct BinLayout {
	pub column_index: usize,
	pub value_kind: ValueKind,
	/// The inclusive lower bound.
	pub min: f64,
	/// The exclusive upper bound.
	pub max_exclusive: f64,
	pub n_bins: usize,
	/// The number of bins per unit of value.
	pub step: f64,
	/// Explicit bin boundaries. When present, bin `i` holds values in `[split_points[i], split_points[i + 1])`.
	pub split_points: Option<Arc<[f64]>>,
	/// True when every distinct value has its own bin, so children never need finer bins.
	pub exact: bool,
}

impl BinLayout {
	/// Create a layout with evenly spaced bins. `max_bins` is the budget, and integer or categorical ranges narrower than the budget get one bin per value.
	pub fn uniform(
		column_index: usize,
		value_kind: ValueKind,
		min: f64,
		max_exclusive: f64,
		max_bins: usize,
	) -> Result<BinLayout, Error> {
		let bounds_error = || Error::HistogramBounds {
			column_index,
			min,
			max_exclusive,
			n_bins: max_bins,
		};
		let range = max_exclusive - min;
		if !(range > 0.0) || !range.is_finite() {
			return Err(bounds_error());
		}
		let unit_bins = value_kind != ValueKind::Real && range <= max_bins.to_f64().unwrap();
		let (n_bins, step) = if unit_bins {
			(range.to_usize().ok_or_else(bounds_error)?, 1.0)
		} else {
			(max_bins, max_bins.to_f64().unwrap() / range)
		};
		if n_bins < 2 || !step.is_finite() || step <= 0.0 {
			return Err(bounds_error());
		}
		Ok(BinLayout {
			column_index,
			value_kind,
			min,
			max_exclusive,
			n_bins,
			step,
			split_points: None,
			exact: false,
		})
	}

	/// Create a layout whose bins start at the given sorted split points.
	pub fn with_split_points(
		column_index: usize,
		value_kind: ValueKind,
		min: f64,
		max_exclusive: f64,
		split_points: Arc<[f64]>,
		exact: bool,
	) -> Result<BinLayout, Error> {
		let n_bins = split_points.len();
		let range = max_exclusive - min;
		if n_bins < 2 || !(range > 0.0) || !range.is_finite() {
			return Err(Error::HistogramBounds {
				column_index,
				min,
				max_exclusive,
				n_bins,
			});
		}
		Ok(BinLayout {
			column_index,
			value_kind,
			min,
			max_exclusive,
			n_bins,
			step: n_bins.to_f64().unwrap() / range,
			split_points: Some(split_points),
			exact,
		})
	}

	/// Map a value to its bin. Missing values have no bin and go to the NA bucket. A finite value outside `[min, max_exclusive)` means the bounds of the histogram are wrong, and is an error.
	pub fn bin(&self, value: f64) -> Result<Option<usize>, Error> {
		if value.is_nan() {
			return Ok(None);
		}
		let last = self.n_bins - 1;
		if value == f64::NEG_INFINITY {
			return Ok(Some(0));
		}
		if value == f64::INFINITY {
			return Ok(Some(last));
		}
		if value < self.min || value >= self.max_exclusive {
			return Err(Error::HistogramBounds {
				column_index: self.column_index,
				min: self.min,
				max_exclusive: self.max_exclusive,
				n_bins: self.n_bins,
			});
		}
		let bin = match &self.split_points {
			Some(split_points) => split_points
				.partition_point(|point| *point <= value)
				.saturating_sub(1),
			None => {
				let mut bin = ((value - self.min) * self.step)
					.floor()
					.to_usize()
					.unwrap_or(last)
					.min(last);
				// Round-off in the product can land one bin away from the boundaries `bin_at` reports.
				if bin > 0 && value < self.bin_at(bin) {
					bin -= 1;
				} else if bin < last && value >= self.bin_at(bin + 1) {
					bin += 1;
				}
				bin
			}
		};
		Ok(Some(bin.min(last)))
	}

	/// The lower bound of a bin.
	pub fn bin_at(&self, bin: usize) -> f64 {
		match &self.split_points {
			Some(split_points) => split_points
				.get(bin)
				.copied()
				.unwrap_or(self.max_exclusive),
			None => self.min + bin.to_f64().unwrap() / self.step,
		}
	}

	pub fn is_int(&self) -> bool {
		self.value_kind != ValueKind::Real
	}
}

#[derive(Clone, Debug)]
struct PrivateBins {
	/// `stride` values per bin, followed by one more group for the NA bucket.
	values: Vec<f64>,
	min_observed: f64,
	max_observed: f64,
}

impl PrivateBins {
	fn zeros(n_bins: usize, stride: usize) -> PrivateBins {
		PrivateBins {
			values: vec![0.0; (n_bins + 1) * stride],
			min_observed: f64::INFINITY,
			max_observed: f64::NEG_INFINITY,
		}
	}
}

/// Anything (value, response, weight) triples can be accumulated into.
pub trait Accumulate {
	fn accumulate(&mut self, value: f32, response: f32, weight: f32) -> Result<(), Error>;
}

/**
A per-column histogram of one tree node.

A histogram is declared with its layout when its node is created and allocated lazily on the first accumulated row, so histograms of columns that are never scored cost nothing. Worker threads either accumulate into private copies that are combined with [`Histogram::merge`], or into a single [`SharedHistogram`].
*/
#[derive(Clone, Debug)]
pub struct Histogram {
	layout: Arc<BinLayout>,
	kind: HistogramKind,
	bins: Option<PrivateBins>,
}

impl Histogram {
	pub fn new(layout: Arc<BinLayout>, kind: HistogramKind) -> Histogram {
		Histogram {
			layout,
			kind,
			bins: None,
		}
	}

	/// An unallocated histogram with the same layout.
	pub fn empty_copy(&self) -> Histogram {
		Histogram::new(self.layout.clone(), self.kind)
	}

	pub fn layout(&self) -> &BinLayout {
		&self.layout
	}

	pub fn kind(&self) -> HistogramKind {
		self.kind
	}

	pub fn n_bins(&self) -> usize {
		self.layout.n_bins
	}

	pub fn column_index(&self) -> usize {
		self.layout.column_index
	}

	pub fn is_allocated(&self) -> bool {
		self.bins.is_some()
	}

	fn value(&self, slot: usize, offset: usize) -> f64 {
		self.bins
			.as_ref()
			.map(|bins| bins.values[slot * self.kind.stride() + offset])
			.unwrap_or(0.0)
	}

	pub fn weight(&self, bin: usize) -> f64 {
		self.value(bin, 0)
	}

	pub fn weighted_response(&self, bin: usize) -> f64 {
		self.value(bin, 1)
	}

	pub fn weighted_response_squared(&self, bin: usize) -> f64 {
		match self.kind {
			HistogramKind::Gaussian => self.value(bin, 2),
			HistogramKind::Binomial => self.value(bin, 1),
		}
	}

	pub fn na_weight(&self) -> f64 {
		self.weight(self.layout.n_bins)
	}

	pub fn na_weighted_response(&self) -> f64 {
		self.weighted_response(self.layout.n_bins)
	}

	pub fn na_weighted_response_squared(&self) -> f64 {
		self.weighted_response_squared(self.layout.n_bins)
	}

	/// The squared error of the rows in a bin around their mean.
	pub fn bin_se(&self, bin: usize) -> f64 {
		se(
			self.weight(bin),
			self.weighted_response(bin),
			self.weighted_response_squared(bin),
		)
	}

	/// The smallest finite value accumulated, if any.
	pub fn observed_min(&self) -> Option<f64> {
		self.bins
			.as_ref()
			.map(|bins| bins.min_observed)
			.filter(|min| min.is_finite())
	}

	/// The largest finite value accumulated, if any.
	pub fn observed_max(&self) -> Option<f64> {
		self.bins
			.as_ref()
			.map(|bins| bins.max_observed)
			.filter(|max| max.is_finite())
	}

	/// Add the bins of `other`, which must have the same layout. Merging is commutative and associative up to float summation order.
	pub fn merge(&mut self, other: &Histogram) {
		debug_assert!(Arc::ptr_eq(&self.layout, &other.layout) || self.layout.n_bins == other.layout.n_bins);
		let other_bins = match &other.bins {
			Some(other_bins) => other_bins,
			None => return,
		};
		match &mut self.bins {
			None => self.bins = Some(other_bins.clone()),
			Some(bins) => {
				for (value, other_value) in bins.values.iter_mut().zip(other_bins.values.iter()) {
					*value += *other_value;
				}
				bins.min_observed = bins.min_observed.min(other_bins.min_observed);
				bins.max_observed = bins.max_observed.max(other_bins.max_observed);
			}
		}
	}

	/// Round the response sums of every bin to f32 so the result of a layer does not depend on how rows were split between workers. Weights and the NA bucket keep full precision.
	pub fn reduce_precision(&mut self) {
		let stride = self.kind.stride();
		let n_bins = self.layout.n_bins;
		if let Some(bins) = &mut self.bins {
			for bin in bins.values[..n_bins * stride].chunks_mut(stride) {
				for value in bin[1..].iter_mut() {
					*value = value.to_f32().unwrap().to_f64().unwrap();
				}
			}
		}
	}

	/// Create an atomically updated histogram with the same layout, for accumulation by many threads at once.
	pub fn share(&self) -> SharedHistogram {
		SharedHistogram::new(self.layout.clone(), self.kind)
	}

	/**
	Find the split of this column that most reduces the squared error of the node.

	Candidates are the boundaries between bins, NA-vs-rest, and for small integer ranges an equality split. Categorical columns with at least four levels are first sorted by mean response so that a boundary in the sorted order groups levels. Returns `None` when no candidate leaves `min_rows` of weight on each side, or when the best candidate does not improve the error by at least a `min_split_improvement` fraction.

	Under monotone constraints the child predictions recorded in the split are clamped to the node's bounds. Candidates whose clamped predictions break the column's direction, or collapse onto a single bound, are skipped so that a lower ranked candidate can win.
	*/
	pub fn best_split(
		&self,
		min_rows: f64,
		min_split_improvement: f64,
		constraints: Option<&Constraints>,
	) -> Option<Split> {
		if self.bins.is_none() {
			return None;
		}
		let layout = &*self.layout;
		let column_index = layout.column_index;
		let n_bins = layout.n_bins;
		let direction = constraints
			.map(|constraints| constraints.direction(column_index))
			.unwrap_or(0);
		let accepts = |pred_left: f64, pred_right: f64| {
			let d = f64::from(direction);
			direction == 0 || d * pred_left <= d * pred_right
		};
		let min_bound = constraints.and_then(|constraints| constraints.min);
		let max_bound = constraints.and_then(|constraints| constraints.max);
		let clamp = |pred: f64| {
			let pred = max_bound.map(|max| pred.min(max)).unwrap_or(pred);
			min_bound.map(|min| pred.max(min)).unwrap_or(pred)
		};
		// Both sides clamped onto the same bound would leave the node's prediction unchanged.
		let usable = |candidate: &Candidate| {
			let tree_pred_left = clamp(candidate.pred_left());
			let tree_pred_right = clamp(candidate.pred_right());
			let clamped = tree_pred_left != candidate.pred_left() || tree_pred_right != candidate.pred_right();
			accepts(tree_pred_left, tree_pred_right) && !(clamped && tree_pred_left == tree_pred_right)
		};

		let mut w: Vec<f64> = (0..n_bins).map(|bin| self.weight(bin)).collect();
		let mut wy: Vec<f64> = (0..n_bins).map(|bin| self.weighted_response(bin)).collect();
		let mut wyy: Vec<f64> = (0..n_bins)
			.map(|bin| self.weighted_response_squared(bin))
			.collect();
		let na_w = self.na_weight();
		let na_wy = self.na_weighted_response();
		let na_wyy = self.na_weighted_response_squared();

		// Sort the levels of categorical columns by mean response. Empty levels sort first.
		let sorted_levels = if layout.value_kind == ValueKind::Categorical
			&& layout.step == 1.0
			&& layout.split_points.is_none()
			&& n_bins >= 4
		{
			let means: Vec<f64> = (0..n_bins)
				.map(|bin| {
					if w[bin] > 0.0 {
						wy[bin] / w[bin]
					} else {
						-f64::MAX
					}
				})
				.collect();
			let mut order: Vec<usize> = (0..n_bins).collect();
			order.sort_by(|a, b| {
				means[*a]
					.partial_cmp(&means[*b])
					.unwrap_or(std::cmp::Ordering::Equal)
			});
			w = order.iter().map(|level| w[*level]).collect();
			wy = order.iter().map(|level| wy[*level]).collect();
			wyy = order.iter().map(|level| wyy[*level]).collect();
			Some(order)
		} else {
			None
		};

		// lo[b] sums bins below b and hi[b] sums bins at or above b.
		let mut lo_w = vec![0.0; n_bins + 1];
		let mut lo_wy = vec![0.0; n_bins + 1];
		let mut lo_wyy = vec![0.0; n_bins + 1];
		for bin in 0..n_bins {
			lo_w[bin + 1] = lo_w[bin] + w[bin];
			lo_wy[bin + 1] = lo_wy[bin] + wy[bin];
			lo_wyy[bin + 1] = lo_wyy[bin] + wyy[bin];
		}
		let mut hi_w = vec![0.0; n_bins + 1];
		let mut hi_wy = vec![0.0; n_bins + 1];
		let mut hi_wyy = vec![0.0; n_bins + 1];
		for bin in (0..n_bins).rev() {
			hi_w[bin] = hi_w[bin + 1] + w[bin];
			hi_wy[bin] = hi_wy[bin + 1] + wy[bin];
			hi_wyy[bin] = hi_wyy[bin + 1] + wyy[bin];
		}

		let total_w = lo_w[n_bins] + na_w;
		let total_wy = lo_wy[n_bins] + na_wy;
		let total_wyy = lo_wyy[n_bins] + na_wyy;
		if total_w < 2.0 * min_rows {
			log::trace!("column {}: too few rows to split", column_index);
			return None;
		}
		let variance = total_wyy * total_w - total_wy * total_wy;
		if variance.to_f32().unwrap() == 0.0 {
			log::trace!("column {}: constant response", column_index);
			return None;
		}
		let se_before = se(total_w, total_wy, total_wyy);

		let mut best: Option<Candidate> = None;
		let mut consider = |candidate: Candidate| {
			if !usable(&candidate) {
				return;
			}
			let middle = n_bins.to_f64().unwrap() / 2.0;
			let distance = |bin: usize| (bin.to_f64().unwrap() - middle).abs();
			let is_better = match &best {
				None => true,
				Some(best) => {
					candidate.se() < best.se()
						|| (candidate.se() == best.se()
							&& distance(candidate.bin) < distance(best.bin))
				}
			};
			if is_better {
				best = Some(candidate);
			}
		};

		if na_w >= min_rows {
			consider(Candidate {
				bin: 0,
				kind: CandidateKind::Threshold,
				na_direction: NaSplitDirection::NaVsRest,
				left: Side::new(lo_w[n_bins], lo_wy[n_bins], lo_wyy[n_bins]),
				right: Side::new(na_w, na_wy, na_wyy),
			});
		}

		for bin in 1..n_bins {
			if w[bin] == 0.0 {
				continue;
			}
			if lo_w[bin] + na_w < min_rows {
				continue;
			}
			if hi_w[bin] + na_w < min_rows {
				break;
			}
			let lo = Side::new(lo_w[bin], lo_wy[bin], lo_wyy[bin]);
			let hi = Side::new(hi_w[bin], hi_wy[bin], hi_wyy[bin]);
			if na_w == 0.0 {
				consider(Candidate {
					bin,
					kind: CandidateKind::Threshold,
					na_direction: NaSplitDirection::None,
					left: lo,
					right: hi,
				});
				continue;
			}
			let na = Side::new(na_w, na_wy, na_wyy);
			if lo.w + na_w >= min_rows && hi.w >= min_rows {
				consider(Candidate {
					bin,
					kind: CandidateKind::Threshold,
					na_direction: NaSplitDirection::NaLeft,
					left: lo.plus(&na),
					right: hi,
				});
			}
			if lo.w >= min_rows && hi.w + na_w >= min_rows {
				consider(Candidate {
					bin,
					kind: CandidateKind::Threshold,
					na_direction: NaSplitDirection::NaRight,
					left: lo,
					right: hi.plus(&na),
				});
			}
		}

		// Equality splits send a single integer value right and everything else, including missing values, left.
		let allows_equality = layout.value_kind == ValueKind::Integer
			&& layout.step == 1.0
			&& layout.split_points.is_none()
			&& sorted_levels.is_none()
			&& n_bins > 2
			&& direction == 0;
		if allows_equality {
			let total = Side::new(total_w, total_wy, total_wyy);
			for bin in 0..n_bins {
				if w[bin] < min_rows || total_w - w[bin] < min_rows {
					continue;
				}
				let equal = Side::new(w[bin], wy[bin], wyy[bin]);
				let not_equal = total.minus(&equal);
				let candidate = Candidate {
					bin,
					kind: CandidateKind::Equality,
					na_direction: if na_w > 0.0 {
						NaSplitDirection::NaLeft
					} else {
						NaSplitDirection::Left
					},
					left: not_equal,
					right: equal,
				};
				let beats_best = best
					.as_ref()
					.map(|best| candidate.se() < best.se())
					.unwrap_or(true);
				if beats_best && usable(&candidate) {
					best = Some(candidate);
				}
			}
		}

		let best = match best {
			Some(best) => best,
			None => {
				log::trace!("column {}: no candidate split", column_index);
				return None;
			}
		};
		if !(best.se() < se_before * (1.0 - min_split_improvement)) {
			log::trace!("column {}: split does not improve enough", column_index);
			return None;
		}
		let pred_left = best.pred_left();
		let pred_right = best.pred_right();
		if equals_within_one_small_ulp(pred_left.to_f32().unwrap(), pred_right.to_f32().unwrap()) {
			log::trace!("column {}: predictions are equal", column_index);
			return None;
		}
		if best.left.w < min_rows || best.right.w < min_rows {
			return None;
		}
		let tree_pred_left = clamp(pred_left);
		let tree_pred_right = clamp(pred_right);
		if tree_pred_left != pred_left || tree_pred_right != pred_right {
			log::trace!(
				"column {}: predictions {} and {} clamped to {} and {}",
				column_index,
				pred_left,
				pred_right,
				tree_pred_left,
				tree_pred_right,
			);
		}

		let mut na_direction = best.na_direction;
		let kind = match (&sorted_levels, best.kind) {
			(_, CandidateKind::Equality) => SplitKind::NotEqual,
			(Some(order), CandidateKind::Threshold) if na_direction != NaSplitDirection::NaVsRest => {
				SplitKind::Bitset(self.group_bitset(order, &w, best.bin)?)
			}
			_ => SplitKind::LessThan,
		};
		if na_direction == NaSplitDirection::None {
			na_direction = if best.left.w > best.right.w {
				NaSplitDirection::Left
			} else {
				NaSplitDirection::Right
			};
		}
		Some(Split {
			column_index,
			bin: best.bin,
			kind,
			na_direction,
			se_before,
			se_left: best.left.se_around(tree_pred_left),
			se_right: best.right.se_around(tree_pred_right),
			n_left: best.left.w,
			n_right: best.right.w,
			pred_left,
			pred_right,
			tree_pred_left,
			tree_pred_right,
		})
	}

	/// Build the set of levels that go right for a split at position `split_at` of the sorted level order. Levels never seen go with the majority of the seen levels.
	fn group_bitset(&self, order: &[usize], sorted_weights: &[f64], split_at: usize) -> Option<Bitset> {
		let layout = &*self.layout;
		let offset = layout.min.to_i64().unwrap();
		let n_bins = layout.n_bins;
		let mut bitset = Bitset::new(n_bins.to_u32().unwrap(), offset.to_u32()?);
		let mut n_seen_left = 0;
		let mut n_seen_right = 0;
		for (position, (level, weight)) in order.iter().zip(sorted_weights.iter()).enumerate() {
			if *weight == 0.0 {
				continue;
			}
			if position >= split_at {
				bitset.set(level.to_i64().unwrap() + offset);
				n_seen_right += 1;
			} else {
				n_seen_left += 1;
			}
		}
		if n_seen_right > n_seen_left {
			for (level, weight) in order.iter().zip(sorted_weights.iter()) {
				if *weight == 0.0 {
					bitset.set(level.to_i64().unwrap() + offset);
				}
			}
		}
		let n_set = (0..n_bins)
			.filter(|level| bitset.contains(level.to_i64().unwrap() + offset))
			.count();
		if n_set == 0 || n_set == n_bins {
			log::trace!("column {}: group split sends every level one way", layout.column_index);
			return None;
		}
		Some(bitset)
	}
}

impl Accumulate for Histogram {
	fn accumulate(&mut self, value: f32, response: f32, weight: f32) -> Result<(), Error> {
		let layout = &self.layout;
		let stride = self.kind.stride();
		let value = value.to_f64().unwrap();
		let slot = layout.bin(value)?.unwrap_or(layout.n_bins);
		let bins = self
			.bins
			.get_or_insert_with(|| PrivateBins::zeros(layout.n_bins, stride));
		let weight = weight.to_f64().unwrap();
		let response = response.to_f64().unwrap();
		let offset = slot * stride;
		bins.values[offset] += weight;
		bins.values[offset + 1] += weight * response;
		if stride == 3 {
			bins.values[offset + 2] += weight * response * response;
		}
		if value.is_finite() {
			bins.min_observed = bins.min_observed.min(value);
			bins.max_observed = bins.max_observed.max(value);
		}
		Ok(())
	}
}

/// An f64 stored in an `AtomicU64`, updated with compare and swap.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
	fn new(value: f64) -> AtomicF64 {
		AtomicF64(AtomicU64::new(value.to_bits()))
	}

	fn load(&self) -> f64 {
		f64::from_bits(self.0.load(Ordering::Relaxed))
	}

	fn update(&self, f: impl Fn(f64) -> f64) {
		let mut current = self.0.load(Ordering::Relaxed);
		loop {
			let new = f(f64::from_bits(current)).to_bits();
			if new == current {
				return;
			}
			match self
				.0
				.compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
			{
				Ok(_) => return,
				Err(actual) => current = actual,
			}
		}
	}

	fn fetch_add(&self, value: f64) {
		self.update(|current| current + value)
	}
}

/// A histogram that many threads accumulate into at once through atomic updates.
#[derive(Debug)]
pub struct SharedHistogram {
	layout: Arc<BinLayout>,
	kind: HistogramKind,
	values: Vec<AtomicF64>,
	min_observed: AtomicF64,
	max_observed: AtomicF64,
}

impl SharedHistogram {
	pub fn new(layout: Arc<BinLayout>, kind: HistogramKind) -> SharedHistogram {
		let values = (0..(layout.n_bins + 1) * kind.stride())
			.map(|_| AtomicF64::new(0.0))
			.collect();
		SharedHistogram {
			layout,
			kind,
			values,
			min_observed: AtomicF64::new(f64::INFINITY),
			max_observed: AtomicF64::new(f64::NEG_INFINITY),
		}
	}

	pub fn add(&self, value: f32, response: f32, weight: f32) -> Result<(), Error> {
		let stride = self.kind.stride();
		let value = value.to_f64().unwrap();
		let slot = self.layout.bin(value)?.unwrap_or(self.layout.n_bins);
		let weight = weight.to_f64().unwrap();
		let response = response.to_f64().unwrap();
		let offset = slot * stride;
		self.values[offset].fetch_add(weight);
		self.values[offset + 1].fetch_add(weight * response);
		if stride == 3 {
			self.values[offset + 2].fetch_add(weight * response * response);
		}
		if value.is_finite() {
			self.min_observed.update(|min| min.min(value));
			self.max_observed.update(|max| max.max(value));
		}
		Ok(())
	}

	/// Convert back to a plain histogram once every worker is done. A histogram that received no rows stays unallocated, as a private copy would.
	pub fn into_histogram(self) -> Histogram {
		let values: Vec<f64> = self.values.iter().map(|value| value.load()).collect();
		if values.iter().all(|value| *value == 0.0) {
			return Histogram::new(self.layout, self.kind);
		}
		let bins = PrivateBins {
			values,
			min_observed: self.min_observed.load(),
			max_observed: self.max_observed.load(),
		};
		Histogram {
			layout: self.layout,
			kind: self.kind,
			bins: Some(bins),
		}
	}
}

impl<'a> Accumulate for &'a SharedHistogram {
	fn accumulate(&mut self, value: f32, response: f32, weight: f32) -> Result<(), Error> {
		self.add(value, response, weight)
	}
}

/// The upper bound that makes `max` the last value inside a half open range.
pub fn find_max_exclusive(max: f64, is_int: bool) -> f64 {
	let mut step = ulp(max);
	if is_int && step < 1.0 {
		step = 1.0;
	}
	let max_exclusive = max + step;
	if max_exclusive.is_infinite() {
		max
	} else {
		max_exclusive
	}
}

/// The squared error around the mean of rows with weight `w`, weighted response sum `wy`, and weighted sum of squares `wyy`.
pub fn se(w: f64, wy: f64, wyy: f64) -> f64 {
	if w == 0.0 {
		0.0
	} else {
		(wyy - wy * wy / w).max(0.0)
	}
}

fn ulp(value: f64) -> f64 {
	let value = value.abs();
	if !value.is_finite() {
		return f64::INFINITY;
	}
	f64::from_bits(value.to_bits() + 1) - value
}

fn ulp_f32(value: f32) -> f32 {
	let value = value.abs();
	if !value.is_finite() {
		return f32::INFINITY;
	}
	f32::from_bits(value.to_bits() + 1) - value
}

fn equals_within_one_small_ulp(a: f32, b: f32) -> bool {
	(a - b).abs() <= ulp_f32(a).min(ulp_f32(b))
}

#[derive(Clone, Copy, Debug)]
struct Side {
	w: f64,
	wy: f64,
	wyy: f64,
}

impl Side {
	fn new(w: f64, wy: f64, wyy: f64) -> Side {
		Side { w, wy, wyy }
	}

	fn plus(&self, other: &Side) -> Side {
		Side::new(self.w + other.w, self.wy + other.wy, self.wyy + other.wyy)
	}

	fn minus(&self, other: &Side) -> Side {
		Side::new(self.w - other.w, self.wy - other.wy, self.wyy - other.wyy)
	}

	fn se(&self) -> f64 {
		se(self.w, self.wy, self.wyy)
	}

	/// The squared error of the rows around `prediction`, which exceeds `se` unless `prediction` is the mean.
	fn se_around(&self, prediction: f64) -> f64 {
		let mean = self.mean();
		self.se() + self.w * (prediction - mean) * (prediction - mean)
	}

	fn mean(&self) -> f64 {
		if self.w == 0.0 {
			0.0
		} else {
			self.wy / self.w
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CandidateKind {
	Threshold,
	Equality,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
	bin: usize,
	kind: CandidateKind,
	na_direction: NaSplitDirection,
	left: Side,
	right: Side,
}

impl Candidate {
	fn se(&self) -> f64 {
		self.left.se() + self.right.se()
	}

	fn pred_left(&self) -> f64 {
		self.left.mean()
	}

	fn pred_right(&self) -> f64 {
		self.right.mean()
	}
}

#[cfg(test)]
fn integer_histogram(min: f64, max_exclusive: f64, rows: &[(f32, f32)]) -> Histogram {
	let layout = BinLayout::uniform(0, ValueKind::Integer, min, max_exclusive, 20).unwrap();
	let mut histogram = Histogram::new(Arc::new(layout), HistogramKind::Gaussian);
	for (value, response) in rows {
		histogram.accumulate(*value, *response, 1.0).unwrap();
	}
	histogram
}

#[test]
fn test_two_bins() {
	let mut rows = vec![(0.0, 0.0); 10];
	rows.extend(vec![(1.0, 10.0); 10]);
	let histogram = integer_histogram(0.0, 2.0, &rows);
	assert_eq!(histogram.n_bins(), 2);
	let split = histogram.best_split(1.0, 0.0, None).unwrap();
	assert_eq!(split.bin, 1);
	assert_eq!(split.kind, SplitKind::LessThan);
	assert_eq!(split.se_before, 500.0);
	assert_eq!(split.se(), 0.0);
	assert_eq!(split.pred_left, 0.0);
	assert_eq!(split.pred_right, 10.0);
	assert_eq!(split.n_left, 10.0);
	assert_eq!(split.n_right, 10.0);
	assert_eq!(split.na_direction, NaSplitDirection::Right);
	assert_eq!(split.split_value(&histogram, true), Some(0.5));
	assert!(histogram.best_split(15.0, 0.0, None).is_none());
}

#[test]
fn test_constant_response() {
	let layout = BinLayout::uniform(0, ValueKind::Real, 0.0, 20.0, 20).unwrap();
	let mut histogram = Histogram::new(Arc::new(layout), HistogramKind::Gaussian);
	for value in 0..20 {
		histogram.accumulate(value.to_f32().unwrap(), 5.0, 1.0).unwrap();
	}
	assert!(histogram.best_split(1.0, 0.0, None).is_none());
}

#[test]
fn test_merge_is_associative() {
	let layout = Arc::new(BinLayout::uniform(0, ValueKind::Real, 0.0, 8.0, 4).unwrap());
	let part = |values: &[f32]| {
		let mut histogram = Histogram::new(layout.clone(), HistogramKind::Gaussian);
		for value in values {
			histogram.accumulate(*value, *value * 2.0, 1.0).unwrap();
		}
		histogram
	};
	let a = part(&[0.0, 1.0, 7.0]);
	let b = part(&[2.0, f32::NAN, 5.0]);
	let c = part(&[3.0, 3.0, 6.0]);
	let mut left = a.clone();
	left.merge(&b);
	left.merge(&c);
	let mut right = b.clone();
	right.merge(&c);
	let mut right_first = a.empty_copy();
	right_first.merge(&a);
	right_first.merge(&right);
	for bin in 0..=4 {
		assert_eq!(left.weight(bin), right_first.weight(bin));
		assert_eq!(left.weighted_response(bin), right_first.weighted_response(bin));
		assert_eq!(
			left.weighted_response_squared(bin),
			right_first.weighted_response_squared(bin)
		);
	}
	assert_eq!(left.na_weight(), 1.0);
	assert_eq!(left.observed_min(), Some(0.0));
	assert_eq!(left.observed_max(), Some(7.0));
}

#[test]
fn test_shared_matches_private() {
	use rayon::prelude::*;
	let layout = Arc::new(BinLayout::uniform(0, ValueKind::Real, 0.0, 100.0, 10).unwrap());
	let mut private = Histogram::new(layout.clone(), HistogramKind::Gaussian);
	let shared = private.share();
	for value in 0..100 {
		let value = value.to_f32().unwrap();
		private.accumulate(value, value % 7.0, 2.0).unwrap();
	}
	(0..100).into_par_iter().for_each(|value| {
		let value = value.to_f32().unwrap();
		let mut shared = &shared;
		shared.accumulate(value, value % 7.0, 2.0).unwrap();
	});
	let shared = shared.into_histogram();
	for bin in 0..=10 {
		assert_eq!(private.weight(bin), shared.weight(bin));
		assert_eq!(private.weighted_response(bin), shared.weighted_response(bin));
		assert_eq!(
			private.weighted_response_squared(bin),
			shared.weighted_response_squared(bin)
		);
	}
	assert_eq!(shared.observed_max(), Some(99.0));
}

#[test]
fn test_finds_breakpoint() {
	let max_exclusive = find_max_exclusive(99.0, false);
	let layout = BinLayout::uniform(0, ValueKind::Real, 0.0, max_exclusive, 20).unwrap();
	let mut histogram = Histogram::new(Arc::new(layout), HistogramKind::Gaussian);
	for value in 0..100 {
		let response = if value < 60 { 0.0 } else { 1.0 };
		histogram.accumulate(value.to_f32().unwrap(), response, 1.0).unwrap();
	}
	let split = histogram.best_split(1.0, 0.0, None).unwrap();
	assert_eq!(split.bin, 12);
	assert_eq!(split.se(), 0.0);
	let split_value = split.split_value(&histogram, true).unwrap();
	assert!(split_value > 59.0 && split_value < 60.0);
}

#[test]
fn test_na_vs_rest() {
	let layout = BinLayout::uniform(0, ValueKind::Real, 0.0, find_max_exclusive(9.0, false), 10)
		.unwrap();
	let mut histogram = Histogram::new(Arc::new(layout), HistogramKind::Gaussian);
	for value in 0..10 {
		histogram.accumulate(value.to_f32().unwrap(), 0.0, 1.0).unwrap();
		histogram.accumulate(f32::NAN, 10.0, 1.0).unwrap();
	}
	let split = histogram.best_split(5.0, 0.0, None).unwrap();
	assert_eq!(split.na_direction, NaSplitDirection::NaVsRest);
	assert_eq!(split.pred_left, 0.0);
	assert_eq!(split.pred_right, 10.0);
	assert!(!split.is_numeric());
}

#[test]
fn test_group_split() {
	let layout = BinLayout::uniform(0, ValueKind::Categorical, 0.0, 5.0, 1024).unwrap();
	let mut histogram = Histogram::new(Arc::new(layout), HistogramKind::Gaussian);
	let means = [5.0, 1.0, 4.0, 0.0, 3.0];
	for (level, mean) in means.iter().enumerate() {
		for _ in 0..4 {
			histogram.accumulate(level.to_f32().unwrap(), *mean, 1.0).unwrap();
		}
	}
	let split = histogram.best_split(1.0, 0.0, None).unwrap();
	let bitset = match &split.kind {
		SplitKind::Bitset(bitset) => bitset.clone(),
		kind => panic!("expected a group split, got {:?}", kind),
	};
	assert!(bitset.is_small());
	assert_eq!(bitset.levels(), vec![0, 2, 4]);
	assert_eq!(split.pred_left, 0.5);
	assert_eq!(split.pred_right, 4.0);
	assert_eq!(split.na_direction, NaSplitDirection::Right);
}

#[test]
fn test_equality_split() {
	let mut rows = Vec::new();
	for value in 0..5 {
		let response = if value == 3 { 10.0 } else { 0.0 };
		for _ in 0..4 {
			rows.push((value.to_f32().unwrap(), response));
		}
	}
	let histogram = integer_histogram(0.0, 5.0, &rows);
	let split = histogram.best_split(1.0, 0.0, None).unwrap();
	assert_eq!(split.kind, SplitKind::NotEqual);
	assert_eq!(split.bin, 3);
	assert_eq!(split.pred_left, 0.0);
	assert_eq!(split.pred_right, 10.0);
	assert_eq!(split.na_direction, NaSplitDirection::Left);
	assert_eq!(split.split_value(&histogram, true), Some(3.0));
}

#[test]
fn test_monotone_rejects_decreasing_split() {
	let mut rows = vec![(0.0, 0.0); 10];
	rows.extend(vec![(1.0, 10.0); 10]);
	let histogram = integer_histogram(0.0, 2.0, &rows);
	let increasing = Constraints::new(vec![1].into());
	assert!(histogram.best_split(1.0, 0.0, Some(&increasing)).is_some());
	let decreasing = Constraints::new(vec![-1].into());
	assert!(histogram.best_split(1.0, 0.0, Some(&decreasing)).is_none());
}

#[test]
fn test_bounds_skip_splits_clamped_to_one_prediction() {
	let mut rows = vec![(0.0, 100.0); 10];
	rows.extend(vec![(1.0, 200.0); 10]);
	rows.push((2.0, 10.0));
	let histogram = integer_histogram(0.0, 3.0, &rows);
	let unbounded = histogram.best_split(1.0, 0.0, None).unwrap();
	assert_eq!(unbounded.kind, SplitKind::NotEqual);
	assert_eq!(unbounded.bin, 1);
	assert_eq!(unbounded.pred_right, 200.0);
	// Both sides of the best split lie above the bound, so the next best split wins.
	let mut bounded = Constraints::new(vec![0].into());
	bounded.max = Some(50.0);
	let split = histogram.best_split(1.0, 0.0, Some(&bounded)).unwrap();
	assert_eq!(split.kind, SplitKind::LessThan);
	assert_eq!(split.bin, 2);
	assert_eq!(split.pred_left, 150.0);
	assert_eq!(split.pred_right, 10.0);
	assert_eq!(split.tree_pred_left, 50.0);
	assert_eq!(split.tree_pred_right, 10.0);
	assert_eq!(split.se_left, 250_000.0);
	assert_eq!(split.se_right, 0.0);
	let mut tight = Constraints::new(vec![0].into());
	tight.max = Some(5.0);
	assert!(histogram.best_split(1.0, 0.0, Some(&tight)).is_none());
}

#[test]
fn test_bin_mapping() {
	let layout = BinLayout::uniform(0, ValueKind::Real, 0.0, 10.0, 5).unwrap();
	assert_eq!(layout.bin(f64::NAN).unwrap(), None);
	assert_eq!(layout.bin(f64::NEG_INFINITY).unwrap(), Some(0));
	assert_eq!(layout.bin(f64::INFINITY).unwrap(), Some(4));
	assert_eq!(layout.bin(3.9).unwrap(), Some(1));
	assert_eq!(layout.bin_at(2), 4.0);
	let layout =
		BinLayout::with_split_points(0, ValueKind::Real, 0.0, 10.0, vec![0.0, 1.0, 5.0].into(), false)
			.unwrap();
	assert_eq!(layout.bin(0.5).unwrap(), Some(0));
	assert_eq!(layout.bin(5.0).unwrap(), Some(2));
	assert_eq!(layout.bin(7.0).unwrap(), Some(2));
	assert!(matches!(layout.bin(-0.5), Err(Error::HistogramBounds { .. })));
	assert!(matches!(layout.bin(10.0), Err(Error::HistogramBounds { .. })));
	let mut histogram = Histogram::new(Arc::new(layout), HistogramKind::Gaussian);
	assert!(histogram.accumulate(12.0, 1.0, 1.0).is_err());
	assert!(histogram.accumulate(f32::NAN, 1.0, 1.0).is_ok());
	assert!(BinLayout::uniform(3, ValueKind::Real, 1.0, 1.0, 5).is_err());
}
