/*!
This crate grows ensembles of decision trees from histograms. Rows live in a columnar [`Frame`](frame/struct.Frame.html), each tree is grown breadth first one layer at a time, and the rows of every layer are summarized into one histogram per node and column, from which the best split of each node is chosen. Finished trees are packed into a compact byte encoding that can be scored without allocating.

Two models are built on the engine: a gradient boosted [`Regressor`](struct.Regressor.html) and a binary or multiclass [`RandomForest`](struct.RandomForest.html). For an example of both, see `benchmarks/synthetic.rs`.
*/

#![allow(clippy::tabs_in_doc_comments)]

pub mod bitset;
pub mod build_histogram;
pub mod compressed_tree;
pub mod config;
pub mod constraints;
pub mod error;
mod forest;
pub mod frame;
pub mod grow;
pub mod histogram;
pub mod nids;
mod regressor;
pub mod split;
pub mod split_points;
#[cfg(feature = "timing")]
pub mod timing;
pub mod tree;
pub mod visitor;

use std::collections::BTreeMap;

pub use build_histogram::AccumulationPolicy;
pub use compressed_tree::CompressedTree;
pub use error::{ConfigError, Error};
pub use forest::RandomForest;
pub use frame::{Column, Frame};
pub use regressor::Regressor;
pub use split_points::HistogramType;
pub use visitor::{TreeStats, VisitEvent};

/// These are the options passed to `Regressor::train` and `RandomForest::train`.
#[derive(Clone, Debug)]
pub struct TrainOptions {
	/// How worker threads accumulate histograms.
	pub accumulation: AccumulationPolicy,
	/// If true, a split is abandoned when its split value, rounded to `f32`, no longer separates the values on either side.
	pub check_float_splits: bool,
	/// The fraction of columns each tree may use.
	pub col_sample_rate_per_tree: f32,
	/// How histogram bins are placed for number columns.
	pub histogram_type: HistogramType,
	/// Groups of column names that may be used together on a path from the root. When empty, every column may interact with every other.
	pub interaction_constraints: Vec<Vec<String>>,
	/// The learning rate scales the leaf values to control the effect each tree has on the output. The random forest ignores it.
	pub learning_rate: f32,
	/// The depth of a single tree will never exceed this value.
	pub max_depth: usize,
	/// A split will only be considered valid if the weight of the rows sent to each side is at least this value.
	pub min_rows: f64,
	/// A split must reduce the squared error of its node by at least this fraction.
	pub min_split_improvement: f64,
	/// The direction each named column's effect on the prediction must have: 1 for increasing, -1 for decreasing.
	pub monotone_constraints: BTreeMap<String, i8>,
	/// The number of columns sampled at each node. If `None`, all columns are used, except by the random forest, which samples the square root of the number of columns.
	pub mtries: Option<usize>,
	/// The minimum number of bins for number columns.
	pub n_bins: usize,
	/// The maximum number of bins for enum columns.
	pub n_bins_cats: usize,
	/// The number of bins for number columns at the root.
	pub n_bins_top_level: usize,
	pub n_trees: usize,
	/// Rows are processed in partitions of this many rows.
	pub partition_size: usize,
	/// The fraction of rows each tree is trained on. The rest are out of bag.
	pub sample_rate: f32,
	pub seed: u64,
}

impl Default for TrainOptions {
	fn default() -> Self {
		Self {
			accumulation: AccumulationPolicy::Auto,
			check_float_splits: true,
			col_sample_rate_per_tree: 1.0,
			histogram_type: HistogramType::Auto,
			interaction_constraints: Vec::new(),
			learning_rate: 0.1,
			max_depth: 5,
			min_rows: 10.0,
			min_split_improvement: 1e-5,
			monotone_constraints: BTreeMap::new(),
			mtries: None,
			n_bins: 20,
			n_bins_cats: 1024,
			n_bins_top_level: 1024,
			n_trees: 50,
			partition_size: 4096,
			sample_rate: 1.0,
			seed: 0,
		}
	}
}

/// This struct reports the training progress.
#[derive(Debug)]
pub enum TrainProgress {
	Initializing(canopy_util::progress_counter::ProgressCounter),
	Training(canopy_util::progress_counter::ProgressCounter),
}
