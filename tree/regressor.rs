#[cfg(feature = "timing")]
use crate::timing::Timing;
use crate::{
	compressed_tree::CompressedTree,
	error::Error,
	frame::{Frame, TreeInput},
	grow::{grow_tree, leaf_predictions, GrowTreeOptions},
	histogram::HistogramKind,
	split_points::SplitPointStrategy,
	TrainOptions, TrainProgress,
};
use canopy_util::{progress_counter::ProgressCounter, pzip};
use ndarray::prelude::*;
use num_traits::ToPrimitive;
use rayon::prelude::*;
use std::sync::atomic::AtomicBool;

/// `Regressor`s predict continuous target values with gradient boosted trees fit to squared error.
#[derive(Debug)]
pub struct Regressor {
	/// The initial prediction of the model given no trained trees. The bias is the weighted mean of the labels.
	pub bias: f32,
	/// The trees for this model.
	pub trees: Vec<CompressedTree>,
	/// The share of the total squared error reduction contributed by each column.
	pub feature_importances: Vec<f32>,
	/// The training loss after each tree.
	pub losses: Vec<f32>,
}

impl Regressor {
	/**
	Train a regressor.

	Each tree is fit to the residuals of the trees before it. Rows with a missing label are skipped.
	*/
	pub fn train(
		frame: &Frame,
		labels: &[f32],
		weights: Option<&[f32]>,
		train_options: &TrainOptions,
		kill_chip: &AtomicBool,
		update_progress: &mut dyn FnMut(TrainProgress),
	) -> Result<Regressor, Error> {
		TreeInput {
			frame,
			response: labels,
			weights,
		}
		.validate()?;
		let resolved = train_options.validate(frame)?;
		#[cfg(feature = "timing")]
		let timing = Timing::new();

		let progress_counter = ProgressCounter::new(frame.n_columns().to_u64().unwrap());
		update_progress(TrainProgress::Initializing(progress_counter.clone()));
		#[cfg(feature = "timing")]
		let start = std::time::Instant::now();
		let strategy = SplitPointStrategy::new(
			frame,
			train_options.n_bins,
			train_options.histogram_type,
			train_options.seed,
		);
		#[cfg(feature = "timing")]
		timing.split_points.inc(start.elapsed());
		progress_counter.inc(frame.n_columns().to_u64().unwrap());

		let input = TreeInput {
			frame,
			response: labels,
			weights,
		};
		let bias = input.weighted_mean(|_| true).to_f32().unwrap();
		let n_rows = frame.n_rows();
		let mut predictions = vec![bias; n_rows];
		let mut residuals = vec![0.0; n_rows];
		let mut nids = vec![0; n_rows];
		let mut importances = vec![0.0; frame.n_columns()];
		let mut trees = Vec::with_capacity(train_options.n_trees);
		let mut losses = Vec::with_capacity(train_options.n_trees);

		let progress_counter = ProgressCounter::new(train_options.n_trees.to_u64().unwrap());
		update_progress(TrainProgress::Training(progress_counter.clone()));
		for tree_index in 0..train_options.n_trees {
			pzip!(&mut residuals, labels, &predictions).for_each(|(residual, label, prediction)| {
				*residual = label - prediction;
			});
			let grown = grow_tree(
				GrowTreeOptions {
					input: TreeInput {
						frame,
						response: &residuals,
						weights,
					},
					train_options,
					strategy: &strategy,
					interactions: resolved.interactions.as_ref(),
					monotone: resolved.monotone.clone(),
					histogram_kind: HistogramKind::Gaussian,
					seed: train_options.seed.wrapping_add(tree_index.to_u64().unwrap()),
					kill_chip,
					#[cfg(feature = "timing")]
					timing: &timing,
				},
				&mut nids,
			)?;
			leaf_predictions(&grown.tree, &nids, |row, value, _| predictions[row] += value)?;
			for (importance, tree_importance) in importances.iter_mut().zip(grown.importances.iter()) {
				*importance += tree_importance;
			}
			#[cfg(feature = "timing")]
			let start = std::time::Instant::now();
			trees.push(CompressedTree::compress(&grown.tree, tree_index, 0, 1)?);
			#[cfg(feature = "timing")]
			timing.compress.inc(start.elapsed());
			let loss = compute_loss(labels, &predictions);
			log::info!(
				"tree {}: {} leaves, depth {}, loss {}",
				tree_index,
				grown.tree.n_leaves(),
				grown.tree.depth(),
				loss
			);
			losses.push(loss);
			progress_counter.inc(1);
		}
		#[cfg(feature = "timing")]
		log::debug!("{:?}", timing);

		Ok(Regressor {
			bias,
			trees,
			feature_importances: normalize_importances(&importances),
			losses,
		})
	}

	/// Make predictions.
	pub fn predict(&self, features: ArrayView2<f32>, mut predictions: ArrayViewMut1<f32>) -> Result<(), Error> {
		predictions.fill(self.bias);
		let mut row = vec![0.0; features.ncols()];
		for (features, prediction) in features.axis_iter(Axis(0)).zip(predictions.iter_mut()) {
			for (value, feature) in row.iter_mut().zip(features.iter()) {
				*value = *feature;
			}
			for tree in &self.trees {
				*prediction += tree.score(&row)?;
			}
		}
		Ok(())
	}
}

/// The mean of half the squared error over rows with a label.
pub fn compute_loss(labels: &[f32], predictions: &[f32]) -> f32 {
	let (loss, n) = pzip!(labels, predictions)
		.filter(|(label, _)| !label.is_nan())
		.map(|(label, prediction)| (0.5 * (label - prediction).to_f64().unwrap().powi(2), 1usize))
		.reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
	if n == 0 {
		0.0
	} else {
		(loss / n.to_f64().unwrap()).to_f32().unwrap()
	}
}

/// Scale importances so they sum to one.
pub fn normalize_importances(importances: &[f64]) -> Vec<f32> {
	let total: f64 = importances.iter().sum();
	importances
		.iter()
		.map(|importance| {
			if total > 0.0 {
				(importance / total).to_f32().unwrap()
			} else {
				0.0
			}
		})
		.collect()
}

#[test]
fn test_regressor() {
	use crate::frame::Column;
	let xs: Vec<f32> = (0..200).map(|x| x.to_f32().unwrap() / 10.0).collect();
	let zs: Vec<f32> = (0..200).map(|x| (x % 7).to_f32().unwrap()).collect();
	let ys: Vec<f32> = xs.iter().map(|x| if *x < 10.0 { 0.0 } else { 4.0 }).collect();
	let frame = Frame::new(vec![Column::number("x", xs.clone()), Column::number("z", zs.clone())]);
	let train_options = TrainOptions {
		n_trees: 20,
		learning_rate: 0.5,
		max_depth: 2,
		..Default::default()
	};
	let model = Regressor::train(
		&frame,
		&ys,
		None,
		&train_options,
		&AtomicBool::new(false),
		&mut |_| {},
	)
	.unwrap();
	assert_eq!(model.bias, 2.0);
	assert_eq!(model.trees.len(), 20);
	assert!(model.losses.windows(2).all(|losses| losses[1] <= losses[0]));
	assert!(model.losses[19] < 1e-3);
	assert!(model.feature_importances[0] > 0.99);
	let features = Array2::from_shape_vec((2, 2), vec![0.5, 3.0, 15.0, 3.0]).unwrap();
	let mut predictions = Array1::zeros(2);
	model.predict(features.view(), predictions.view_mut()).unwrap();
	assert!((predictions[0] - 0.0).abs() < 0.05);
	assert!((predictions[1] - 4.0).abs() < 0.05);
}

#[test]
fn test_compute_loss() {
	assert_eq!(compute_loss(&[1.0, f32::NAN, 3.0], &[0.0, 5.0, 3.0]), 0.25);
	assert_eq!(normalize_importances(&[1.0, 3.0]), vec![0.25, 0.75]);
	assert_eq!(normalize_importances(&[0.0, 0.0]), vec![0.0, 0.0]);
}

#[test]
fn test_regressor_rejects_mismatched_lengths() {
	use crate::frame::Column;
	let frame = Frame::new(vec![Column::number("x", vec![0.0, 1.0, 2.0, 3.0])]);
	let train = |labels: &[f32], weights: Option<&[f32]>| {
		Regressor::train(
			&frame,
			labels,
			weights,
			&TrainOptions::default(),
			&AtomicBool::new(false),
			&mut |_| {},
		)
	};
	assert!(matches!(
		train(&[0.0, 1.0, 2.0], None),
		Err(Error::LengthMismatch {
			name: "labels",
			expected: 4,
			actual: 3,
		})
	));
	assert!(matches!(
		train(&[0.0, 1.0, 2.0, 3.0], Some(&[1.0, 1.0])),
		Err(Error::LengthMismatch { name: "weights", .. })
	));
}

#[test]
fn test_regressor_monotone_constraint() {
	use crate::frame::Column;
	let xs: Vec<f32> = (0..400).map(|x| x.to_f32().unwrap() / 40.0).collect();
	let zs: Vec<f32> = (0..400).map(|x| (x % 5).to_f32().unwrap()).collect();
	let ys: Vec<f32> = xs
		.iter()
		.zip(zs.iter())
		.map(|(x, z)| x - 2.0 * (2.0 * x).sin() + 0.5 * z)
		.collect();
	let frame = Frame::new(vec![Column::number("x", xs), Column::number("z", zs)]);
	let mut monotone_constraints = std::collections::BTreeMap::new();
	monotone_constraints.insert("x".to_owned(), 1);
	let train_options = TrainOptions {
		n_trees: 20,
		learning_rate: 0.3,
		max_depth: 4,
		min_rows: 5.0,
		monotone_constraints,
		..Default::default()
	};
	let model = Regressor::train(
		&frame,
		&ys,
		None,
		&train_options,
		&AtomicBool::new(false),
		&mut |_| {},
	)
	.unwrap();
	let grid: Vec<f32> = (-10..=110).map(|x| x.to_f32().unwrap() / 10.0).collect();
	for z in 0..5 {
		let mut features = Array2::zeros((grid.len(), 2));
		for (row, x) in grid.iter().enumerate() {
			features[[row, 0]] = *x;
			features[[row, 1]] = z.to_f32().unwrap();
		}
		let mut predictions = Array1::zeros(grid.len());
		model.predict(features.view(), predictions.view_mut()).unwrap();
		for (x, window) in grid.iter().zip(predictions.as_slice().unwrap().windows(2)) {
			assert!(window[0] <= window[1], "prediction decreases after x = {} with z = {}", x, z);
		}
	}
	// Without the constraint the sine term makes predictions fall somewhere.
	let unconstrained = Regressor::train(
		&frame,
		&ys,
		None,
		&TrainOptions {
			monotone_constraints: std::collections::BTreeMap::new(),
			..train_options.clone()
		},
		&AtomicBool::new(false),
		&mut |_| {},
	)
	.unwrap();
	let features = Array2::from_shape_vec((2, 2), vec![2.6, 0.0, 3.7, 0.0]).unwrap();
	let mut predictions = Array1::zeros(2);
	unconstrained.predict(features.view(), predictions.view_mut()).unwrap();
	assert!(predictions[1] < predictions[0]);
}
