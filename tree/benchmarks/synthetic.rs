use anyhow::Result;
use canopy_tree::{config::load_config, Column, Frame, RandomForest, Regressor, TrainOptions};
use clap::Clap;
use ndarray::prelude::*;
use num_traits::ToPrimitive;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use serde_json::json;
use std::{path::PathBuf, sync::atomic::AtomicBool, time::Instant};

#[derive(Clap, Debug)]
#[clap(about = "train both models on synthetic data and print metrics as json")]
struct Options {
	#[clap(short, long, about = "the path to a yaml config file")]
	config: Option<PathBuf>,
	#[clap(long, default_value = "100000", about = "the number of training rows")]
	n_rows: usize,
	#[clap(long, default_value = "10", about = "the number of number columns")]
	n_columns: usize,
	#[clap(long, default_value = "0.1", about = "the fraction of values that are missing")]
	missing_fraction: f32,
	#[clap(long, default_value = "0")]
	seed: u64,
}

struct Dataset {
	columns: Vec<Column>,
	regression_labels: Vec<f32>,
	classification_labels: Vec<f32>,
}

/// The regression label depends on the first two number columns and the enum column. The classification label thresholds the noiseless regression label.
fn generate(n_rows: usize, n_columns: usize, missing_fraction: f32, rng: &mut Xoshiro256Plus) -> Dataset {
	let levels: Vec<String> = ["north", "south", "east", "west", "center"]
		.iter()
		.map(|level| level.to_string())
		.collect();
	let mut values: Vec<Vec<f32>> = vec![Vec::with_capacity(n_rows); n_columns];
	let mut codes = Vec::with_capacity(n_rows);
	let mut regression_labels = Vec::with_capacity(n_rows);
	let mut classification_labels = Vec::with_capacity(n_rows);
	for _ in 0..n_rows {
		let row: Vec<f32> = (0..n_columns).map(|_| rng.gen_range(0.0, 1.0)).collect();
		let code = rng.gen_range(0, levels.len());
		let signal = 3.0 * row[0] + (6.0 * row[1]).sin() + if code == 2 { 1.5 } else { 0.0 };
		regression_labels.push(signal + rng.gen_range(-0.1, 0.1));
		classification_labels.push(if signal > 2.0 { 1.0 } else { 0.0 });
		for (column, value) in values.iter_mut().zip(row) {
			column.push(if rng.gen::<f32>() < missing_fraction {
				f32::NAN
			} else {
				value
			});
		}
		codes.push(Some(code.to_u32().unwrap()));
	}
	let mut columns: Vec<Column> = values
		.into_iter()
		.enumerate()
		.map(|(column_index, data)| Column::number(format!("x{}", column_index), data))
		.collect();
	columns.push(Column::enumeration("region", levels, &codes));
	Dataset {
		columns,
		regression_labels,
		classification_labels,
	}
}

fn features(frame: &Frame) -> Array2<f32> {
	let mut features = Array2::zeros((frame.n_rows(), frame.n_columns()));
	for (column_index, column) in frame.columns().iter().enumerate() {
		for (row_index, value) in column.data.iter().enumerate() {
			features[[row_index, column_index]] = *value;
		}
	}
	features
}

fn main() -> Result<()> {
	let env = env_logger::Env::default().default_filter_or("canopy_tree=info");
	env_logger::Builder::from_env(env)
		.format_module_path(false)
		.format_timestamp(None)
		.init();
	let options = Options::parse();
	let train_options = match load_config(options.config.as_deref())? {
		Some(config) => config.train_options(TrainOptions::default()),
		None => TrainOptions::default(),
	};

	// Generate the data.
	let mut rng = Xoshiro256Plus::seed_from_u64(options.seed);
	let n_test_rows = options.n_rows / 4;
	let train = generate(options.n_rows, options.n_columns, options.missing_fraction, &mut rng);
	let test = generate(n_test_rows, options.n_columns, options.missing_fraction, &mut rng);
	let frame_train = Frame::new(train.columns);
	let frame_test = Frame::new(test.columns);
	let features_test = features(&frame_test);
	let kill_chip = AtomicBool::new(false);

	// Train the regressor.
	let start = Instant::now();
	let regressor = Regressor::train(
		&frame_train,
		&train.regression_labels,
		None,
		&train_options,
		&kill_chip,
		&mut |_| {},
	)?;
	let regressor_duration = start.elapsed();
	let mut predictions = Array1::zeros(n_test_rows);
	regressor.predict(features_test.view(), predictions.view_mut())?;
	let mse = predictions
		.iter()
		.zip(test.regression_labels.iter())
		.map(|(prediction, label)| (prediction - label).to_f64().unwrap().powi(2))
		.sum::<f64>()
		/ n_test_rows.to_f64().unwrap();

	// Train the random forest.
	let start = Instant::now();
	let forest = RandomForest::train(
		&frame_train,
		&train.classification_labels,
		None,
		&TrainOptions {
			sample_rate: 0.632,
			max_depth: 20,
			min_rows: 1.0,
			..train_options.clone()
		},
		&kill_chip,
		&mut |_| {},
	)?;
	let forest_duration = start.elapsed();
	let mut probabilities = Array2::zeros((n_test_rows, 2));
	forest.predict(features_test.view(), probabilities.view_mut())?;
	let n_correct = probabilities
		.column(1)
		.iter()
		.zip(test.classification_labels.iter())
		.filter(|(probability, label)| (**probability >= 0.5) == (**label > 0.5))
		.count();
	let accuracy = n_correct.to_f64().unwrap() / n_test_rows.to_f64().unwrap();

	let mean_depth = |trees: &[canopy_tree::CompressedTree]| -> Result<f64> {
		let mut total = 0.0;
		for tree in trees {
			total += tree.stats()?.mean_depth;
		}
		Ok(total / trees.len().max(1).to_f64().unwrap())
	};
	let output = json!({
		"regressor": {
			"mse": mse,
			"duration_ms": regressor_duration.as_millis().to_u64().unwrap(),
			"mean_leaf_depth": mean_depth(&regressor.trees)?,
			"final_train_loss": regressor.losses.last(),
		},
		"random_forest": {
			"accuracy": accuracy,
			"oob_error": forest.oob_error,
			"duration_ms": forest_duration.as_millis().to_u64().unwrap(),
			"mean_leaf_depth": mean_depth(&forest.trees)?,
		},
	});
	println!("{}", output);
	Ok(())
}
