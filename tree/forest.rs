#[cfg(feature = "timing")]
use crate::timing::Timing;
use crate::{
	compressed_tree::CompressedTree,
	error::{ConfigError, Error},
	frame::{Frame, TreeInput},
	grow::{grow_tree, leaf_predictions, GrowTreeOptions},
	histogram::HistogramKind,
	regressor::normalize_importances,
	split_points::SplitPointStrategy,
	TrainOptions, TrainProgress,
};
use canopy_util::progress_counter::ProgressCounter;
use ndarray::prelude::*;
use num_traits::ToPrimitive;
use rayon::prelude::*;
use std::{borrow::Cow, cmp::Ordering, sync::atomic::AtomicBool};

/**
A `RandomForest` predicts class probabilities by averaging the leaf probabilities of independently grown trees.

A binary forest grows one tree per round that votes for the positive class. A forest with more classes grows one tree per class per round, each fit to whether the label is that class.
*/
#[derive(Debug)]
pub struct RandomForest {
	pub n_classes: usize,
	/// The trees of every round, with the trees of a round ordered by class.
	pub trees: Vec<CompressedTree>,
	/// The share of the total squared error reduction contributed by each column.
	pub feature_importances: Vec<f32>,
	/// The fraction of rows misclassified by the trees that did not train on them, or `None` if no row was ever out of bag.
	pub oob_error: Option<f32>,
}

impl RandomForest {
	/**
	Train a binary random forest on labels that are 0 or 1. Rows with a missing label are skipped.

	Leaf values are the fraction of positive rows, so the learning rate is not applied. If `mtries` is not set, each node samples the square root of the number of columns.
	*/
	pub fn train(
		frame: &Frame,
		labels: &[f32],
		weights: Option<&[f32]>,
		train_options: &TrainOptions,
		kill_chip: &AtomicBool,
		update_progress: &mut dyn FnMut(TrainProgress),
	) -> Result<RandomForest, Error> {
		RandomForest::train_multiclass(
			frame,
			labels,
			2,
			weights,
			train_options,
			kill_chip,
			update_progress,
		)
	}

	/// Train a random forest on labels that are class indexes below `n_classes`. With two classes this is the same as [`RandomForest::train`].
	pub fn train_multiclass(
		frame: &Frame,
		labels: &[f32],
		n_classes: usize,
		weights: Option<&[f32]>,
		train_options: &TrainOptions,
		kill_chip: &AtomicBool,
		update_progress: &mut dyn FnMut(TrainProgress),
	) -> Result<RandomForest, Error> {
		if n_classes < 2 {
			return Err(ConfigError::InvalidClassCount(n_classes).into());
		}
		TreeInput {
			frame,
			response: labels,
			weights,
		}
		.validate()?;
		check_labels(labels, n_classes)?;
		let resolved = train_options.validate(frame)?;
		let n_columns = frame.n_columns();
		let train_options = TrainOptions {
			learning_rate: 1.0,
			mtries: train_options.mtries.or_else(|| {
				let mtries = n_columns.to_f64().unwrap().sqrt().floor().to_usize().unwrap();
				Some(mtries.max(1))
			}),
			..train_options.clone()
		};
		#[cfg(feature = "timing")]
		let timing = Timing::new();

		let progress_counter = ProgressCounter::new(n_columns.to_u64().unwrap());
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
		progress_counter.inc(n_columns.to_u64().unwrap());

		// The class each tree of a round votes for, and the response it is fit to.
		let responses: Vec<(usize, Cow<[f32]>)> = if n_classes == 2 {
			vec![(1, Cow::Borrowed(labels))]
		} else {
			(0..n_classes)
				.map(|class_id| (class_id, Cow::Owned(one_vs_rest(labels, class_id))))
				.collect()
		};
		let n_votes = responses.len();
		let n_rows = frame.n_rows();
		let mut nids = vec![0; n_rows];
		let mut oob_sums = vec![0.0f64; n_rows * n_votes];
		let mut oob_counts = vec![0usize; n_rows];
		let mut importances = vec![0.0; n_columns];
		let mut trees = Vec::with_capacity(train_options.n_trees * n_votes);

		let progress_counter = ProgressCounter::new(train_options.n_trees.to_u64().unwrap());
		update_progress(TrainProgress::Training(progress_counter.clone()));
		for round in 0..train_options.n_trees {
			// Every tree of a round shares its seed, so each samples the same rows.
			let seed = train_options.seed.wrapping_add(round.to_u64().unwrap());
			for (vote, (class_id, response)) in responses.iter().enumerate() {
				let grown = grow_tree(
					GrowTreeOptions {
						input: TreeInput {
							frame,
							response,
							weights,
						},
						train_options: &train_options,
						strategy: &strategy,
						interactions: resolved.interactions.as_ref(),
						monotone: resolved.monotone.clone(),
						histogram_kind: HistogramKind::Binomial,
						seed,
						kill_chip,
						#[cfg(feature = "timing")]
						timing: &timing,
					},
					&mut nids,
				)?;
				leaf_predictions(&grown.tree, &nids, |row, probability, out_of_bag| {
					if out_of_bag {
						oob_sums[row * n_votes + vote] += probability.to_f64().unwrap();
						if vote == 0 {
							oob_counts[row] += 1;
						}
					}
				})?;
				for (importance, tree_importance) in importances.iter_mut().zip(grown.importances.iter()) {
					*importance += tree_importance;
				}
				log::info!(
					"round {} class {}: {} leaves, depth {}",
					round,
					class_id,
					grown.tree.n_leaves(),
					grown.tree.depth()
				);
				#[cfg(feature = "timing")]
				let start = std::time::Instant::now();
				trees.push(CompressedTree::compress(&grown.tree, round, *class_id, n_classes)?);
				#[cfg(feature = "timing")]
				timing.compress.inc(start.elapsed());
			}
			progress_counter.inc(1);
		}
		#[cfg(feature = "timing")]
		log::debug!("{:?}", timing);

		let oob_error = compute_oob_error(labels, n_classes, &oob_sums, &oob_counts);
		if let Some(oob_error) = oob_error {
			log::info!("out of bag error {}", oob_error);
		}
		Ok(RandomForest {
			n_classes,
			trees,
			feature_importances: normalize_importances(&importances),
			oob_error,
		})
	}

	/// Predict the probability of each class for each row. `probabilities` must have one column per class.
	pub fn predict(&self, features: ArrayView2<f32>, mut probabilities: ArrayViewMut2<f32>) -> Result<(), Error> {
		let mut row = vec![0.0; features.ncols()];
		let mut votes = vec![0.0f32; self.n_classes];
		for (features, mut probabilities) in features.axis_iter(Axis(0)).zip(probabilities.axis_iter_mut(Axis(0))) {
			for (value, feature) in row.iter_mut().zip(features.iter()) {
				*value = *feature;
			}
			votes.iter_mut().for_each(|vote| *vote = 0.0);
			for tree in &self.trees {
				votes[tree.class_id()] += tree.score(&row)?;
			}
			if self.n_classes == 2 {
				let n_trees = self.trees.len().to_f32().unwrap();
				let positive = if n_trees > 0.0 { votes[1] / n_trees } else { 0.0 };
				probabilities[0] = 1.0 - positive;
				probabilities[1] = positive;
			} else {
				let total: f32 = votes.iter().sum();
				for (probability, vote) in probabilities.iter_mut().zip(votes.iter()) {
					*probability = if total > 0.0 {
						vote / total
					} else {
						1.0 / self.n_classes.to_f32().unwrap()
					};
				}
			}
		}
		Ok(())
	}
}

/// Labels must be missing or a class index below `n_classes`.
fn check_labels(labels: &[f32], n_classes: usize) -> Result<(), Error> {
	let n = n_classes.to_f32().unwrap();
	match labels
		.iter()
		.enumerate()
		.find(|(_, label)| !label.is_nan() && !(label.fract() == 0.0 && **label >= 0.0 && **label < n))
	{
		Some((row, value)) => Err(Error::InvalidLabel {
			row,
			value: *value,
			n_classes,
		}),
		None => Ok(()),
	}
}

/// 1 where the label is `class_id`, 0 where it is another class, and missing where it is missing.
fn one_vs_rest(labels: &[f32], class_id: usize) -> Vec<f32> {
	let class = class_id.to_f32().unwrap();
	labels
		.par_iter()
		.map(|label| {
			if label.is_nan() {
				f32::NAN
			} else if *label == class {
				1.0
			} else {
				0.0
			}
		})
		.collect()
}

/**
The fraction of rows with at least one out of bag vote whose averaged vote picks the wrong class.

`oob_sums` holds one vote per row for a binary forest, the summed positive probability, and one vote per class otherwise.
*/
fn compute_oob_error(labels: &[f32], n_classes: usize, oob_sums: &[f64], oob_counts: &[usize]) -> Option<f32> {
	let n_votes = if n_classes == 2 { 1 } else { n_classes };
	let mut n_voted: usize = 0;
	let mut n_wrong: usize = 0;
	for ((label, sums), count) in labels.iter().zip(oob_sums.chunks(n_votes)).zip(oob_counts) {
		if *count == 0 || label.is_nan() {
			continue;
		}
		n_voted += 1;
		let predicted = if n_votes == 1 {
			if sums[0] / count.to_f64().unwrap() >= 0.5 {
				1
			} else {
				0
			}
		} else {
			sums.iter()
				.enumerate()
				.max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
				.map(|(class_id, _)| class_id)
				.unwrap_or(0)
		};
		if predicted != label.to_usize().unwrap() {
			n_wrong += 1;
		}
	}
	if n_voted == 0 {
		None
	} else {
		Some(n_wrong.to_f32().unwrap() / n_voted.to_f32().unwrap())
	}
}

#[test]
fn test_random_forest() {
	use crate::frame::Column;
	let xs: Vec<f32> = (0..400).map(|x| (x % 100).to_f32().unwrap()).collect();
	let zs: Vec<f32> = (0..400).map(|x| (x / 100).to_f32().unwrap()).collect();
	let labels: Vec<f32> = xs.iter().map(|x| if *x >= 50.0 { 1.0 } else { 0.0 }).collect();
	let frame = Frame::new(vec![Column::number("x", xs), Column::number("z", zs)]);
	let train_options = TrainOptions {
		n_trees: 10,
		sample_rate: 0.632,
		mtries: Some(2),
		max_depth: 3,
		..Default::default()
	};
	let forest = RandomForest::train(
		&frame,
		&labels,
		None,
		&train_options,
		&AtomicBool::new(false),
		&mut |_| {},
	)
	.unwrap();
	assert_eq!(forest.n_classes, 2);
	assert_eq!(forest.trees.len(), 10);
	assert!(forest
		.trees
		.iter()
		.all(|tree| (tree.class_id(), tree.n_classes()) == (1, 2)));
	assert!(forest.oob_error.unwrap() < 0.05);
	assert!(forest.feature_importances[0] > 0.9);
	let features = Array2::from_shape_vec((2, 2), vec![10.0, 1.0, 90.0, 2.0]).unwrap();
	let mut probabilities = Array2::zeros((2, 2));
	forest.predict(features.view(), probabilities.view_mut()).unwrap();
	assert_eq!(probabilities, arr2(&[[1.0f32, 0.0], [0.0, 1.0]]));
}

#[test]
fn test_multiclass_random_forest() {
	use crate::frame::Column;
	let xs: Vec<f32> = (0..300).map(|x| x.to_f32().unwrap()).collect();
	let zs: Vec<f32> = (0..300).map(|x| (x % 7).to_f32().unwrap()).collect();
	let labels: Vec<f32> = (0..300).map(|x| (x / 100).to_f32().unwrap()).collect();
	let frame = Frame::new(vec![Column::number("x", xs), Column::number("z", zs)]);
	let train_options = TrainOptions {
		n_trees: 5,
		sample_rate: 0.632,
		mtries: Some(2),
		max_depth: 3,
		..Default::default()
	};
	let forest = RandomForest::train_multiclass(
		&frame,
		&labels,
		3,
		None,
		&train_options,
		&AtomicBool::new(false),
		&mut |_| {},
	)
	.unwrap();
	assert_eq!(forest.trees.len(), 15);
	for class_id in 0..3 {
		let rounds: Vec<usize> = forest
			.trees
			.iter()
			.filter(|tree| tree.class_id() == class_id)
			.map(|tree| tree.tree_id())
			.collect();
		assert_eq!(rounds, vec![0, 1, 2, 3, 4]);
	}
	assert!(forest.trees.iter().all(|tree| tree.n_classes() == 3));
	assert!(forest.oob_error.unwrap() < 0.1);
	let features = Array2::from_shape_vec((3, 2), vec![50.0, 1.0, 150.0, 3.0, 250.0, 5.0]).unwrap();
	let mut probabilities = Array2::zeros((3, 3));
	forest.predict(features.view(), probabilities.view_mut()).unwrap();
	for (class_id, probabilities) in probabilities.axis_iter(Axis(0)).enumerate() {
		assert!((probabilities.sum() - 1.0).abs() < 1e-5);
		assert!(probabilities[class_id] > 0.8);
	}
}

#[test]
fn test_random_forest_rejects_invalid_labels() {
	use crate::frame::Column;
	let frame = Frame::new(vec![Column::number("x", vec![0.0, 1.0, 2.0, 3.0])]);
	let train = |labels: &[f32], n_classes: usize| {
		RandomForest::train_multiclass(
			&frame,
			labels,
			n_classes,
			None,
			&TrainOptions::default(),
			&AtomicBool::new(false),
			&mut |_| {},
		)
	};
	assert!(matches!(
		train(&[0.0, 1.0, 2.0, f32::NAN], 2),
		Err(Error::InvalidLabel {
			row: 2,
			n_classes: 2,
			..
		})
	));
	assert!(matches!(
		train(&[0.0, 0.5, 1.0, 1.0], 2),
		Err(Error::InvalidLabel { row: 1, .. })
	));
	assert!(matches!(
		train(&[0.0, -1.0, 1.0, 2.0], 3),
		Err(Error::InvalidLabel { row: 1, .. })
	));
	assert!(matches!(
		train(&[0.0, 1.0, 1.0], 2),
		Err(Error::LengthMismatch { name: "labels", .. })
	));
	assert!(matches!(
		train(&[0.0, 1.0, 1.0, 0.0], 1),
		Err(Error::Config(ConfigError::InvalidClassCount(1)))
	));
	assert!(train(&[0.0, 1.0, 2.0, f32::NAN], 3).is_ok());
}

#[test]
fn test_compute_oob_error() {
	let labels = [0.0, 1.0, 1.0, f32::NAN];
	assert_eq!(
		compute_oob_error(&labels, 2, &[0.2, 0.4, 3.0, 1.0], &[1, 2, 4, 1]),
		Some(1.0 / 3.0)
	);
	assert_eq!(compute_oob_error(&labels, 2, &[0.0; 4], &[0; 4]), None);
	let labels = [2.0, 0.0, 1.0];
	let sums = [0.1, 0.2, 1.5, 0.3, 0.9, 0.0, 0.0, 0.0, 0.0];
	assert_eq!(compute_oob_error(&labels, 3, &sums, &[2, 1, 0]), Some(0.5));
}
