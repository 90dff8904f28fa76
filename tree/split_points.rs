use crate::{
	error::Error,
	frame::Frame,
	histogram::{BinLayout, Histogram, ValueKind},
};
use canopy_util::finite::Finite;
use itertools::Itertools;
use num_traits::ToPrimitive;
use rand::Rng;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

/// How bin boundaries are chosen for numeric columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub enum HistogramType {
	#[serde(rename = "auto")]
	Auto,
	/// Evenly spaced bins over the range observed at each node.
	#[serde(rename = "uniform_adaptive")]
	UniformAdaptive,
	/// Evenly spaced bins, except that a sparse parent histogram guides where the bins of its children go.
	#[serde(rename = "uniform_robust")]
	UniformRobust,
	/// Random boundaries drawn at each node.
	#[serde(rename = "random")]
	Random,
	/// Quantiles of the whole column, computed once per training run.
	#[serde(rename = "quantiles_global")]
	QuantilesGlobal,
	/// A different type for each column.
	#[serde(rename = "round_robin")]
	RoundRobin,
}

impl Default for HistogramType {
	fn default() -> Self {
		HistogramType::Auto
	}
}

/// A parent histogram whose fraction of non-empty bins is at most this value guides the bins of its children.
pub const LOW_DENSITY_THRESHOLD: f64 = 0.2;

const ROUND_ROBIN_TYPES: [HistogramType; 4] = [
	HistogramType::UniformAdaptive,
	HistogramType::Random,
	HistogramType::QuantilesGlobal,
	HistogramType::UniformRobust,
];

/// Split points computed once over the whole training frame for one column.
#[derive(Clone, Debug)]
pub struct ColumnSplitPoints {
	pub points: Arc<[f64]>,
	/// True when there is one bin per distinct value.
	pub exact: bool,
}

/// The strategy used to choose bin layouts, along with any split points computed up front.
#[derive(Clone, Debug)]
pub struct SplitPointStrategy {
	histogram_type: HistogramType,
	seed: u64,
	columns: Vec<Option<ColumnSplitPoints>>,
}

/// Everything needed to choose the layout of one histogram.
pub struct LayoutRequest<'a> {
	pub column_index: usize,
	pub value_kind: ValueKind,
	pub min: f64,
	pub max_exclusive: f64,
	pub n_bins: usize,
	/// The histogram of the same column at the parent node.
	pub parent: Option<&'a Histogram>,
	/// True if the parent was split on this column.
	pub is_split_column: bool,
}

impl SplitPointStrategy {
	/// Compute split points for every number column. Columns with at most `n_bins` distinct values get exact split points. Other columns get quantiles if any column will use them.
	pub fn new(frame: &Frame, n_bins: usize, histogram_type: HistogramType, seed: u64) -> SplitPointStrategy {
		let mut strategy = SplitPointStrategy {
			histogram_type,
			seed,
			columns: Vec::new(),
		};
		strategy.columns = (0..frame.n_columns())
			.into_par_iter()
			.map(|column_index| {
				let column = frame.column(column_index);
				if column.is_enum() {
					return None;
				}
				let stats = frame.stats(column_index);
				if stats.is_constant() {
					return None;
				}
				let needs_quantiles =
					strategy.histogram_type_for_column(column_index) == HistogramType::QuantilesGlobal;
				compute_column_split_points(&column.data, n_bins, needs_quantiles, stats.is_int, stats.min, stats.max)
			})
			.collect();
		strategy
	}

	pub fn histogram_type(&self) -> HistogramType {
		self.histogram_type
	}

	pub fn column(&self, column_index: usize) -> Option<&ColumnSplitPoints> {
		self.columns.get(column_index).and_then(|points| points.as_ref())
	}

	/// Resolve `Auto` and `RoundRobin` to the type used for a column.
	pub fn histogram_type_for_column(&self, column_index: usize) -> HistogramType {
		match self.histogram_type {
			HistogramType::Auto => HistogramType::UniformAdaptive,
			HistogramType::RoundRobin => {
				let index = self.seed.wrapping_add(column_index.to_u64().unwrap()) % 4;
				ROUND_ROBIN_TYPES[index.to_usize().unwrap()]
			}
			histogram_type => histogram_type,
		}
	}

	/// Choose the bin layout of a histogram.
	pub fn layout(&self, request: LayoutRequest, rng: &mut Xoshiro256Plus) -> Result<BinLayout, Error> {
		let LayoutRequest {
			column_index,
			value_kind,
			min,
			max_exclusive,
			n_bins,
			parent,
			is_split_column,
		} = request;
		let with_points = |points: Vec<f64>, exact: bool| -> Option<Result<BinLayout, Error>> {
			if points.len() < 2 {
				return None;
			}
			Some(BinLayout::with_split_points(
				column_index,
				value_kind,
				min,
				max_exclusive,
				points.into(),
				exact,
			))
		};
		if value_kind != ValueKind::Categorical {
			if let Some(column_points) = self.column(column_index) {
				if column_points.exact {
					let points = limit_to_range(&column_points.points, min, max_exclusive);
					if let Some(layout) = with_points(points, true) {
						return layout;
					}
				}
			}
			let points = match self.histogram_type_for_column(column_index) {
				HistogramType::QuantilesGlobal => self.column(column_index).map(|column_points| {
					let points = limit_to_range(&column_points.points, min, max_exclusive);
					pad_uniformly(points, max_exclusive, n_bins)
				}),
				HistogramType::Random => Some(random_split_points(min, max_exclusive, n_bins, rng)),
				HistogramType::UniformRobust if !is_split_column => {
					parent.and_then(|parent| guided_split_points(parent, min, max_exclusive, n_bins))
				}
				_ => None,
			};
			if let Some(layout) = points.and_then(|points| with_points(points, false)) {
				return layout;
			}
		}
		BinLayout::uniform(column_index, value_kind, min, max_exclusive, n_bins)
	}
}

fn compute_column_split_points(
	data: &[f32],
	n_bins: usize,
	needs_quantiles: bool,
	is_int: bool,
	min: f64,
	max: f64,
) -> Option<ColumnSplitPoints> {
	// Create a histogram of the finite values in the column.
	let mut histogram: BTreeMap<Finite<f64>, usize> = BTreeMap::new();
	let mut histogram_values_count = 0;
	for value in data {
		if let Ok(value) = Finite::new(value.to_f64().unwrap()) {
			*histogram.entry(value).or_insert(0) += 1;
			histogram_values_count += 1;
		}
	}
	// Small integer ranges already get one bin per value from a uniform layout.
	let has_unit_bins = is_int && max - min < n_bins.to_f64().unwrap();
	if histogram.len() <= n_bins && !has_unit_bins {
		let mut points = vec![min];
		points.extend(
			histogram
				.keys()
				.tuple_windows()
				.map(|(a, b)| a.midpoint(*b).get()),
		);
		return Some(ColumnSplitPoints {
			points: points.into(),
			exact: true,
		});
	}
	if !needs_quantiles {
		return None;
	}
	let mut points = vec![min];
	points.extend(
		quantiles_from_histogram(&histogram, histogram_values_count, n_bins)
			.into_iter()
			.filter(|quantile| *quantile > min),
	);
	points.dedup();
	Some(ColumnSplitPoints {
		points: points.into(),
		exact: false,
	})
}

/// Compute the `1 / n_bins` through `(n_bins - 1) / n_bins` quantiles of the values in a histogram, interpolating between neighboring values.
fn quantiles_from_histogram(
	histogram: &BTreeMap<Finite<f64>, usize>,
	histogram_values_count: usize,
	n_bins: usize,
) -> Vec<f64> {
	let total_values_count = histogram_values_count.to_f64().unwrap();
	let quantiles: Vec<f64> = (1..n_bins)
		.map(|i| i.to_f64().unwrap() / n_bins.to_f64().unwrap())
		.collect();
	let quantile_indexes: Vec<usize> = quantiles
		.iter()
		.map(|q| ((total_values_count - 1.0) * q).trunc().to_usize().unwrap())
		.collect();
	let quantile_fracts: Vec<f64> = quantiles
		.iter()
		.map(|q| ((total_values_count - 1.0) * q).fract())
		.collect();
	let mut quantiles: Vec<Option<f64>> = vec![None; quantiles.len()];
	let mut current_count: usize = 0;
	let mut iter = histogram.iter().peekable();
	while let Some((value, count)) = iter.next() {
		let value = value.get();
		current_count += count;
		let next_value = iter.peek().map(|(next_value, _)| next_value.get());
		let quantiles_iter = quantiles
			.iter_mut()
			.zip(quantile_indexes.iter().zip(quantile_fracts.iter()))
			.filter(|(q, (_, _))| q.is_none());
		for (quantile, (index, fract)) in quantiles_iter {
			match (current_count - 1).cmp(index) {
				Ordering::Equal => {
					*quantile = match next_value {
						Some(next_value) if *fract > 0.0 => {
							Some(value * (1.0 - fract) + next_value * fract)
						}
						_ => Some(value),
					};
				}
				Ordering::Greater => *quantile = Some(value),
				Ordering::Less => {}
			}
		}
	}
	quantiles.into_iter().flatten().collect()
}

/// Keep the points strictly inside `(min, max_exclusive)` and start the result at `min`.
pub fn limit_to_range(points: &[f64], min: f64, max_exclusive: f64) -> Vec<f64> {
	let mut limited = vec![min];
	limited.extend(
		points
			.iter()
			.copied()
			.filter(|point| *point > min && *point < max_exclusive),
	);
	limited
}

/// Split the widest gap between points until there are `n_bins` of them. The last gap ends at `max_exclusive`.
pub fn pad_uniformly(mut points: Vec<f64>, max_exclusive: f64, n_bins: usize) -> Vec<f64> {
	while !points.is_empty() && points.len() < n_bins {
		let widest = (0..points.len())
			.map(|i| {
				let end = points.get(i + 1).copied().unwrap_or(max_exclusive);
				(i, end - points[i])
			})
			.max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
		let (i, width) = match widest {
			Some(widest) => widest,
			None => break,
		};
		let midpoint = points[i] + width / 2.0;
		if !(midpoint > points[i]) {
			break;
		}
		points.insert(i + 1, midpoint);
	}
	points
}

fn random_split_points(min: f64, max_exclusive: f64, n_bins: usize, rng: &mut Xoshiro256Plus) -> Vec<f64> {
	let mut points: Vec<f64> = (1..n_bins)
		.map(|_| rng.gen_range(min, max_exclusive))
		.filter(|point| *point > min)
		.collect();
	points.push(min);
	points.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
	points.dedup();
	points
}

/**
Place the bins of a child histogram using its sparse parent.

Every non-empty parent bin inside the child's range keeps its boundaries, so the runs of empty bins between them collapse into single bins. The rest of the budget is spread over the non-empty bins in proportion to their squared error. Returns `None` if the parent is not sparse enough to be worth following.
*/
pub fn guided_split_points(
	parent: &Histogram,
	min: f64,
	max_exclusive: f64,
	n_bins: usize,
) -> Option<Vec<f64>> {
	let layout = parent.layout();
	let non_empty: Vec<usize> = (0..layout.n_bins)
		.filter(|bin| parent.weight(*bin) > 0.0)
		.collect();
	let density = non_empty.len().to_f64().unwrap() / layout.n_bins.to_f64().unwrap();
	if non_empty.is_empty() || density > LOW_DENSITY_THRESHOLD {
		return None;
	}
	let total_se: f64 = non_empty.iter().map(|bin| parent.bin_se(*bin)).sum();
	let budget = n_bins.saturating_sub(2 * non_empty.len() + 1);
	let mut points = vec![min];
	for bin in non_empty {
		let lo = layout.bin_at(bin).max(min);
		let hi = layout.bin_at(bin + 1).min(max_exclusive);
		if !(lo < hi) {
			continue;
		}
		points.push(lo);
		let n_extra = if total_se > 0.0 {
			(budget.to_f64().unwrap() * parent.bin_se(bin) / total_se)
				.floor()
				.to_usize()
				.unwrap_or(0)
		} else {
			0
		};
		let n_parts = (n_extra + 1).to_f64().unwrap();
		for i in 1..=n_extra {
			points.push(lo + (hi - lo) * i.to_f64().unwrap() / n_parts);
		}
		points.push(hi);
	}
	points.retain(|point| *point >= min && *point < max_exclusive);
	points.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
	points.dedup();
	if points.len() < 2 {
		None
	} else {
		Some(points)
	}
}

#[test]
fn test_exact_split_points() {
	let points =
		compute_column_split_points(&[0.5, 1.5, 1.5, 2.25, 0.5], 20, false, false, 0.5, 2.25).unwrap();
	assert!(points.exact);
	assert_eq!(&*points.points, &[0.5, 1.0, 1.875]);
	let integers: Vec<f32> = (0..10).map(|value| value.to_f32().unwrap()).collect();
	assert!(compute_column_split_points(&integers, 20, false, true, 0.0, 9.0).is_none());
}

#[test]
fn test_quantile_split_points() {
	let data: Vec<f32> = (0..100).map(|value| value.to_f32().unwrap()).collect();
	let points = compute_column_split_points(&data, 4, true, true, 0.0, 99.0).unwrap();
	assert!(!points.exact);
	assert_eq!(&*points.points, &[0.0, 24.75, 49.5, 74.25]);
	let limited = limit_to_range(&points.points, 30.0, 80.0);
	assert_eq!(limited, vec![30.0, 49.5, 74.25]);
	assert_eq!(pad_uniformly(limited, 80.0, 4), vec![30.0, 49.5, 61.875, 74.25]);
}

#[test]
fn test_guided_split_points() {
	use crate::histogram::{Accumulate, HistogramKind};
	let layout = BinLayout::uniform(0, ValueKind::Real, 0.0, 100.0, 25).unwrap();
	let mut parent = Histogram::new(Arc::new(layout), HistogramKind::Gaussian);
	parent.accumulate(10.0, 0.0, 1.0).unwrap();
	parent.accumulate(10.0, 4.0, 1.0).unwrap();
	parent.accumulate(90.0, 1.0, 1.0).unwrap();
	parent.accumulate(90.0, 1.0, 1.0).unwrap();
	let points = guided_split_points(&parent, 0.0, 100.0, 20).unwrap();
	assert_eq!(points.len(), 20);
	assert_eq!(&points[..3], &[0.0, 8.0, 8.25]);
	assert_eq!(&points[16..], &[11.75, 12.0, 88.0, 92.0]);
}

#[test]
fn test_random_split_points() {
	use rand::SeedableRng;
	let mut rng = Xoshiro256Plus::seed_from_u64(42);
	let points = random_split_points(-1.0, 1.0, 16, &mut rng);
	assert_eq!(points[0], -1.0);
	assert!(points.iter().tuple_windows().all(|(a, b)| a < b));
	assert!(points.iter().all(|point| *point < 1.0));
}

#[test]
fn test_robust_layout_follows_sparse_parent() {
	use crate::{
		frame::Column,
		histogram::{Accumulate, HistogramKind},
	};
	use rand::SeedableRng;
	let data: Vec<f32> = (0..100).map(|value| value.to_f32().unwrap()).collect();
	let frame = Frame::new(vec![Column::number("x", data)]);
	let layout = BinLayout::uniform(0, ValueKind::Real, 0.0, 100.0, 25).unwrap();
	let mut parent = Histogram::new(Arc::new(layout), HistogramKind::Gaussian);
	parent.accumulate(10.0, 0.0, 1.0).unwrap();
	parent.accumulate(10.0, 4.0, 1.0).unwrap();
	parent.accumulate(90.0, 1.0, 1.0).unwrap();
	parent.accumulate(90.0, 1.0, 1.0).unwrap();
	let request = |is_split_column| LayoutRequest {
		column_index: 0,
		value_kind: ValueKind::Real,
		min: 0.0,
		max_exclusive: 100.0,
		n_bins: 20,
		parent: Some(&parent),
		is_split_column,
	};
	let mut rng = Xoshiro256Plus::seed_from_u64(0);
	let adaptive = SplitPointStrategy::new(&frame, 20, HistogramType::UniformAdaptive, 0);
	let robust = SplitPointStrategy::new(&frame, 20, HistogramType::UniformRobust, 0);
	let adaptive_layout = adaptive.layout(request(false), &mut rng).unwrap();
	let robust_layout = robust.layout(request(false), &mut rng).unwrap();
	assert!(adaptive_layout.split_points.is_none());
	assert_eq!(adaptive_layout.bin(9.0).unwrap(), Some(1));
	let robust_points = robust_layout.split_points.as_ref().unwrap();
	assert_eq!(robust_points.len(), 20);
	assert_eq!(&robust_points[..3], &[0.0, 8.0, 8.25]);
	// The empty stretch between the two occupied parent bins is a single bin.
	assert_eq!(robust_layout.bin(20.0).unwrap(), robust_layout.bin(80.0).unwrap());
	assert_ne!(adaptive_layout.bin(20.0).unwrap(), adaptive_layout.bin(80.0).unwrap());
	// The split column of the parent falls back to uniform bins.
	let split_column_layout = robust.layout(request(true), &mut rng).unwrap();
	assert!(split_column_layout.split_points.is_none());
	assert_eq!(split_column_layout.n_bins, adaptive_layout.n_bins);
}
