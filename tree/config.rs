/*!
This module defines the `Config` struct, which is read from a YAML file and overrides the defaults of [`TrainOptions`](../struct.TrainOptions.html).
*/

use crate::{
	build_histogram::AccumulationPolicy,
	constraints::{resolve_monotone_constraints, GlobalInteractionConstraints},
	error::ConfigError,
	frame::Frame,
	split_points::HistogramType,
	TrainOptions,
};
use anyhow::{Context, Result};
use std::{collections::BTreeMap, path::Path, sync::Arc};

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	pub accumulation: Option<AccumulationPolicy>,
	pub check_float_splits: Option<bool>,
	pub col_sample_rate_per_tree: Option<f32>,
	pub histogram_type: Option<HistogramType>,
	pub interaction_constraints: Option<Vec<Vec<String>>>,
	pub learning_rate: Option<f32>,
	pub max_depth: Option<usize>,
	pub min_rows: Option<f64>,
	pub min_split_improvement: Option<f64>,
	pub monotone_constraints: Option<BTreeMap<String, i8>>,
	pub mtries: Option<usize>,
	pub n_bins: Option<usize>,
	pub n_bins_cats: Option<usize>,
	pub n_bins_top_level: Option<usize>,
	pub n_trees: Option<usize>,
	pub partition_size: Option<usize>,
	pub sample_rate: Option<f32>,
	pub seed: Option<u64>,
}

/// Load the config from a YAML file, if a path was given.
pub fn load_config(config_path: Option<&Path>) -> Result<Option<Config>> {
	if let Some(config_path) = config_path {
		let config = std::fs::read_to_string(config_path)
			.with_context(|| format!("failed to read config file {}", config_path.display()))?;
		let config = parse_config(&config)
			.with_context(|| format!("failed to parse config file {}", config_path.display()))?;
		Ok(Some(config))
	} else {
		Ok(None)
	}
}

pub fn parse_config(config: &str) -> Result<Config> {
	Ok(serde_yaml::from_str(config)?)
}

impl Config {
	/// Apply the values set in this config on top of `defaults`.
	pub fn train_options(self, defaults: TrainOptions) -> TrainOptions {
		TrainOptions {
			accumulation: self.accumulation.unwrap_or(defaults.accumulation),
			check_float_splits: self.check_float_splits.unwrap_or(defaults.check_float_splits),
			col_sample_rate_per_tree: self
				.col_sample_rate_per_tree
				.unwrap_or(defaults.col_sample_rate_per_tree),
			histogram_type: self.histogram_type.unwrap_or(defaults.histogram_type),
			interaction_constraints: self
				.interaction_constraints
				.unwrap_or(defaults.interaction_constraints),
			learning_rate: self.learning_rate.unwrap_or(defaults.learning_rate),
			max_depth: self.max_depth.unwrap_or(defaults.max_depth),
			min_rows: self.min_rows.unwrap_or(defaults.min_rows),
			min_split_improvement: self.min_split_improvement.unwrap_or(defaults.min_split_improvement),
			monotone_constraints: self.monotone_constraints.unwrap_or(defaults.monotone_constraints),
			mtries: self.mtries.or(defaults.mtries),
			n_bins: self.n_bins.unwrap_or(defaults.n_bins),
			n_bins_cats: self.n_bins_cats.unwrap_or(defaults.n_bins_cats),
			n_bins_top_level: self.n_bins_top_level.unwrap_or(defaults.n_bins_top_level),
			n_trees: self.n_trees.unwrap_or(defaults.n_trees),
			partition_size: self.partition_size.unwrap_or(defaults.partition_size),
			sample_rate: self.sample_rate.unwrap_or(defaults.sample_rate),
			seed: self.seed.unwrap_or(defaults.seed),
		}
	}
}

/// Constraints resolved against the columns of a frame.
#[derive(Debug, Default)]
pub struct ResolvedConstraints {
	pub monotone: Option<Arc<[i8]>>,
	pub interactions: Option<GlobalInteractionConstraints>,
}

impl TrainOptions {
	/// Check the options and resolve column names against `frame`. This runs before any histogram is built.
	pub fn validate(&self, frame: &Frame) -> Result<ResolvedConstraints, ConfigError> {
		let bin_counts = [
			("n_bins", self.n_bins),
			("n_bins_cats", self.n_bins_cats),
			("n_bins_top_level", self.n_bins_top_level),
		];
		for (name, value) in bin_counts.iter().copied() {
			if value < 2 {
				return Err(ConfigError::InvalidBinCount { name, value });
			}
		}
		let rates = [
			("sample_rate", self.sample_rate),
			("col_sample_rate_per_tree", self.col_sample_rate_per_tree),
			("learning_rate", self.learning_rate),
		];
		for (name, value) in rates.iter().copied() {
			if !(value > 0.0 && value <= 1.0) {
				return Err(ConfigError::InvalidRate { name, value });
			}
		}
		let counts = [
			("max_depth", self.max_depth),
			("n_trees", self.n_trees),
			("partition_size", self.partition_size),
			("mtries", self.mtries.unwrap_or(1)),
		];
		for (name, value) in counts.iter().copied() {
			if value == 0 {
				return Err(ConfigError::InvalidCount { name, value });
			}
		}
		let directions = resolve_monotone_constraints(&self.monotone_constraints, frame)?;
		let monotone = if directions.iter().any(|direction| *direction != 0) {
			Some(directions)
		} else {
			None
		};
		let interactions = if self.interaction_constraints.is_empty() {
			None
		} else {
			Some(GlobalInteractionConstraints::new(
				&self.interaction_constraints,
				&frame.column_names(),
			)?)
		};
		Ok(ResolvedConstraints {
			monotone,
			interactions,
		})
	}
}

#[cfg(test)]
fn test_frame() -> Frame {
	use crate::frame::Column;
	Frame::new(vec![
		Column::number("age", vec![1.0, 2.0, 3.0]),
		Column::enumeration(
			"color",
			vec!["red".to_owned(), "blue".to_owned()],
			&[Some(0), Some(1), None],
		),
		Column::number("color.red", vec![0.0, 1.0, 0.0]),
	])
}

#[test]
fn test_parse_config() {
	let config = parse_config(
		"
learning_rate: 0.3
histogram_type: quantiles_global
accumulation: shared
monotone_constraints:
  age: 1
interaction_constraints:
  - [age, color]
",
	)
	.unwrap();
	let options = config.train_options(TrainOptions::default());
	assert_eq!(options.learning_rate, 0.3);
	assert_eq!(options.histogram_type, HistogramType::QuantilesGlobal);
	assert_eq!(options.accumulation, AccumulationPolicy::Shared);
	assert_eq!(options.n_bins, TrainOptions::default().n_bins);
	let resolved = options.validate(&test_frame()).unwrap();
	assert_eq!(&resolved.monotone.unwrap()[..], &[1, 0, 0]);
	let interactions = resolved.interactions.unwrap();
	assert_eq!(
		interactions.allowed_with(0).iter().copied().collect::<Vec<_>>(),
		vec![0, 1, 2]
	);
}

#[test]
fn test_unknown_field_is_rejected() {
	assert!(parse_config("n_bin: 20").is_err());
}

#[test]
fn test_validate_errors() {
	let frame = test_frame();
	let invalid = |options: TrainOptions| options.validate(&frame).unwrap_err();
	assert_eq!(
		invalid(TrainOptions {
			n_bins: 1,
			..Default::default()
		}),
		ConfigError::InvalidBinCount {
			name: "n_bins",
			value: 1
		}
	);
	assert_eq!(
		invalid(TrainOptions {
			sample_rate: 0.0,
			..Default::default()
		}),
		ConfigError::InvalidRate {
			name: "sample_rate",
			value: 0.0
		}
	);
	assert_eq!(
		invalid(TrainOptions {
			mtries: Some(0),
			..Default::default()
		}),
		ConfigError::InvalidCount {
			name: "mtries",
			value: 0
		}
	);
	assert_eq!(
		invalid(TrainOptions {
			monotone_constraints: maplit::btreemap! { "color".to_owned() => -1 },
			..Default::default()
		}),
		ConfigError::MonotoneOnCategorical("color".to_owned())
	);
	assert_eq!(
		invalid(TrainOptions {
			monotone_constraints: maplit::btreemap! { "height".to_owned() => 0 },
			..Default::default()
		}),
		ConfigError::UnknownMonotoneColumn("height".to_owned())
	);
	assert_eq!(
		invalid(TrainOptions {
			interaction_constraints: vec![vec!["age".to_owned(), "weight".to_owned()]],
			..Default::default()
		}),
		ConfigError::UnknownInteractionColumn("weight".to_owned())
	);
}
