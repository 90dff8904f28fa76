#[cfg(feature = "timing")]
use crate::timing::Timing;
use crate::{
	build_histogram::{build_layer, BuildLayerOptions},
	constraints::{Constraints, GlobalInteractionConstraints},
	error::Error,
	frame::TreeInput,
	histogram::HistogramKind,
	nids::{is_decided, is_out_of_bag, nid_to_oob, oob_to_nid, DECIDED_ROW, OUT_OF_BAG},
	split_points::SplitPointStrategy,
	tree::{sample_columns, DecideOptions, Tree},
	TrainOptions,
};
use num_traits::ToPrimitive;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

pub struct GrowTreeOptions<'a> {
	pub input: TreeInput<'a>,
	pub train_options: &'a TrainOptions,
	pub strategy: &'a SplitPointStrategy,
	pub interactions: Option<&'a GlobalInteractionConstraints>,
	/// The monotone direction of every column, if any column is constrained.
	pub monotone: Option<Arc<[i8]>>,
	pub histogram_kind: HistogramKind,
	pub seed: u64,
	/// Training stops with [`Error::Cancelled`] at the next layer boundary once this is set.
	pub kill_chip: &'a AtomicBool,
	#[cfg(feature = "timing")]
	pub timing: &'a Timing,
}

#[derive(Debug)]
pub struct GrownTree {
	pub tree: Tree,
	/// The squared error improvement contributed by each column.
	pub importances: Vec<f64>,
}

/**
Grow one tree, one layer at a time.

`nids` must have one entry per row. On return, every row that was not skipped holds the id of the leaf it reaches, encoded with [`nid_to_oob`] if the row was out of bag.
*/
pub fn grow_tree(options: GrowTreeOptions, nids: &mut [i32]) -> Result<GrownTree, Error> {
	let GrowTreeOptions {
		input,
		train_options,
		strategy,
		interactions,
		monotone,
		histogram_kind,
		seed,
		kill_chip,
		..
	} = options;
	let TrainOptions {
		accumulation,
		check_float_splits,
		col_sample_rate_per_tree,
		learning_rate,
		max_depth,
		min_rows,
		min_split_improvement,
		mtries,
		n_bins,
		n_bins_cats,
		n_bins_top_level,
		partition_size,
		sample_rate,
		..
	} = *train_options;
	#[cfg(feature = "timing")]
	let timing = options.timing;
	let frame = input.frame;
	let partition_size = partition_size.max(1);

	sample_rows(&input, nids, partition_size, sample_rate, seed);

	let decide_options = DecideOptions {
		frame,
		strategy,
		interactions,
		histogram_kind,
		min_rows,
		min_split_improvement,
		check_float_splits,
		n_bins,
		n_bins_cats,
		mtries,
	};
	let mut tree = Tree::new(seed);
	let all_columns: Vec<usize> = (0..frame.n_columns()).collect();
	let columns = if col_sample_rate_per_tree < 1.0 {
		let n_columns = (frame.n_columns().to_f32().unwrap() * col_sample_rate_per_tree)
			.round()
			.to_usize()
			.unwrap()
			.max(1);
		sample_columns(&all_columns, Some(n_columns), tree.rng())
	} else {
		all_columns
	};
	let in_bag_mean = {
		let nids: &[i32] = nids;
		input.weighted_mean(|row| nids[row] == 0)
	};
	let constraints = monotone.map(Constraints::new);
	tree.push_root(&columns, constraints, n_bins_top_level, &decide_options)?;

	let mut importances = vec![0.0; frame.n_columns()];
	let (mut leaf, mut tmax) = (0, 1);
	for depth in 0..max_depth {
		if kill_chip.load(Ordering::Relaxed) {
			return Err(Error::Cancelled);
		}
		build_layer(
			&mut tree,
			nids,
			BuildLayerOptions {
				input,
				partition_size,
				policy: accumulation,
				leaf,
				tmax,
				is_root_layer: depth == 0,
				#[cfg(feature = "timing")]
				timing,
			},
		)?;
		#[cfg(feature = "timing")]
		let start = std::time::Instant::now();
		let n_splits = tree.decide_layer(leaf, tmax, &decide_options, &mut importances)?;
		#[cfg(feature = "timing")]
		timing.decide.inc(start.elapsed());
		log::debug!(
			"tree {}: layer {} decided {} nodes with {} splits",
			seed,
			depth,
			tmax - leaf,
			n_splits
		);
		if n_splits == 0 {
			break;
		}
		leaf = tmax;
		tmax = tree.len();
		if leaf == tmax {
			break;
		}
	}

	#[cfg(feature = "timing")]
	let start = std::time::Instant::now();
	tree.insert_leaves(learning_rate, in_bag_mean.to_f32().unwrap());
	#[cfg(feature = "timing")]
	timing.insert_leaves.inc(start.elapsed());

	#[cfg(feature = "timing")]
	let start = std::time::Instant::now();
	assign_leaves(&tree, &input, nids, partition_size)?;
	#[cfg(feature = "timing")]
	timing.final_pass.inc(start.elapsed());

	Ok(GrownTree { tree, importances })
}

/// Mark rows that cannot be trained on as decided, and rows left out by sampling as out of bag. Each partition draws from its own generator so the mask does not depend on scheduling.
fn sample_rows(input: &TreeInput, nids: &mut [i32], partition_size: usize, sample_rate: f32, seed: u64) {
	nids.par_chunks_mut(partition_size)
		.enumerate()
		.for_each(|(partition_index, nids)| {
			let first_row = partition_index * partition_size;
			let mut rng = Xoshiro256Plus::seed_from_u64(seed.wrapping_add(first_row.to_u64().unwrap()));
			for (offset, nid) in nids.iter_mut().enumerate() {
				let row = first_row + offset;
				*nid = if input.response[row].is_nan() || input.weight(row) == 0.0 {
					DECIDED_ROW
				} else if sample_rate < 1.0 && rng.gen::<f32>() >= sample_rate {
					OUT_OF_BAG
				} else {
					0
				};
			}
		});
}

/// Route every row that took part in growth to its leaf.
fn assign_leaves(tree: &Tree, input: &TreeInput, nids: &mut [i32], partition_size: usize) -> Result<(), Error> {
	let frame = input.frame;
	nids.par_chunks_mut(partition_size)
		.enumerate()
		.try_for_each(|(partition_index, nids)| {
			let first_row = partition_index * partition_size;
			for (offset, nid) in nids.iter_mut().enumerate() {
				if is_decided(*nid) {
					continue;
				}
				let row = first_row + offset;
				let oob = is_out_of_bag(*nid);
				let node_id = if oob { oob_to_nid(*nid) } else { *nid };
				let leaf = tree.leaf_for(node_id.to_usize().unwrap(), |column_index| {
					frame.column(column_index).data[row]
				})?;
				let leaf = leaf.to_i32().unwrap();
				*nid = if oob { nid_to_oob(leaf) } else { leaf };
			}
			Ok(())
		})
}

/// Call `f(row, prediction, out_of_bag)` for every row that [`grow_tree`] routed to a leaf.
pub fn leaf_predictions(tree: &Tree, nids: &[i32], mut f: impl FnMut(usize, f32, bool)) -> Result<(), Error> {
	for (row, nid) in nids.iter().copied().enumerate() {
		if is_decided(nid) {
			continue;
		}
		let oob = is_out_of_bag(nid);
		let leaf = if oob { oob_to_nid(nid) } else { nid };
		f(row, tree.leaf_prediction(leaf.to_usize().unwrap())?, oob);
	}
	Ok(())
}

#[cfg(test)]
fn step_frame() -> (crate::frame::Frame, Vec<f32>) {
	use crate::frame::{Column, Frame};
	let xs: Vec<f32> = (0..64).map(|x| x.to_f32().unwrap()).collect();
	let ys: Vec<f32> = xs.iter().map(|x| if *x < 32.0 { 1.0 } else { 5.0 }).collect();
	(Frame::new(vec![Column::number("x", xs)]), ys)
}

#[cfg(test)]
fn grow_step_tree(train_options: &TrainOptions, kill_chip: &AtomicBool, nids: &mut [i32]) -> Result<GrownTree, Error> {
	use crate::split_points::HistogramType;
	let (frame, ys) = step_frame();
	let strategy = SplitPointStrategy::new(&frame, train_options.n_bins, HistogramType::UniformAdaptive, 0);
	grow_tree(
		GrowTreeOptions {
			input: TreeInput {
				frame: &frame,
				response: &ys,
				weights: None,
			},
			train_options,
			strategy: &strategy,
			interactions: None,
			monotone: None,
			histogram_kind: HistogramKind::Gaussian,
			seed: 42,
			kill_chip,
			#[cfg(feature = "timing")]
			timing: &Timing::new(),
		},
		nids,
	)
}

#[test]
fn test_grow_tree() {
	let train_options = TrainOptions {
		learning_rate: 1.0,
		partition_size: 10,
		..Default::default()
	};
	let mut nids = vec![0; 64];
	let grown = grow_step_tree(&train_options, &AtomicBool::new(false), &mut nids).unwrap();
	let tree = &grown.tree;
	assert_eq!(tree.n_leaves(), 2);
	assert_eq!(tree.depth(), 1);
	assert_eq!(tree.decided(0).unwrap().split_value, Some(31.5));
	assert_eq!(grown.importances, vec![256.0]);
	for (row, nid) in nids.iter().enumerate() {
		let expected = if row < 32 { 1.0 } else { 5.0 };
		assert_eq!(tree.leaf_prediction(nid.to_usize().unwrap()).unwrap(), expected);
	}
}

#[test]
fn test_grow_tree_with_row_sampling() {
	let train_options = TrainOptions {
		sample_rate: 0.5,
		partition_size: 16,
		..Default::default()
	};
	let mut nids = vec![0; 64];
	let grown = grow_step_tree(&train_options, &AtomicBool::new(false), &mut nids).unwrap();
	let mut n_out_of_bag = 0;
	let mut n_rows = 0;
	leaf_predictions(&grown.tree, &nids, |_, _, out_of_bag| {
		n_rows += 1;
		if out_of_bag {
			n_out_of_bag += 1;
		}
	})
	.unwrap();
	assert_eq!(n_rows, 64);
	assert!(n_out_of_bag > 0 && n_out_of_bag < 64);
}

#[test]
fn test_grow_tree_cancelled() {
	let mut nids = vec![0; 64];
	let result = grow_step_tree(&TrainOptions::default(), &AtomicBool::new(true), &mut nids);
	assert!(matches!(result, Err(Error::Cancelled)));
}

#[cfg(test)]
fn grow_frame(frame: &crate::frame::Frame, ys: &[f32], train_options: &TrainOptions) -> (GrownTree, Vec<i32>) {
	let resolved = train_options.validate(frame).unwrap();
	let strategy = SplitPointStrategy::new(
		frame,
		train_options.n_bins,
		train_options.histogram_type,
		train_options.seed,
	);
	let mut nids = vec![0; frame.n_rows()];
	let grown = grow_tree(
		GrowTreeOptions {
			input: TreeInput {
				frame,
				response: ys,
				weights: None,
			},
			train_options,
			strategy: &strategy,
			interactions: resolved.interactions.as_ref(),
			monotone: resolved.monotone.clone(),
			histogram_kind: HistogramKind::Gaussian,
			seed: train_options.seed,
			kill_chip: &AtomicBool::new(false),
			#[cfg(feature = "timing")]
			timing: &Timing::new(),
		},
		&mut nids,
	)
	.unwrap();
	(grown, nids)
}

#[test]
fn test_interaction_groups_hold_on_every_path() {
	use crate::{
		frame::{Column, Frame},
		tree::Node,
	};
	let mut rng = Xoshiro256Plus::seed_from_u64(3);
	let mut columns = vec![Vec::new(); 4];
	let mut ys = Vec::new();
	for _ in 0..2000 {
		let row: Vec<f32> = (0..4).map(|_| rng.gen_range(0.0, 1.0)).collect();
		let ab = if row[0] > 0.5 && row[1] > 0.5 { 4.0 } else { 0.0 };
		let cd = if row[2] > 0.3 && row[3] > 0.6 { 2.0 } else { 0.0 };
		ys.push(ab + cd);
		for (column, value) in columns.iter_mut().zip(row) {
			column.push(value);
		}
	}
	let names = ["a", "b", "c", "d"];
	let frame = Frame::new(
		names
			.iter()
			.zip(columns)
			.map(|(name, data)| Column::number(*name, data))
			.collect(),
	);
	let train_options = TrainOptions {
		interaction_constraints: vec![
			vec!["a".to_owned(), "b".to_owned()],
			vec!["c".to_owned(), "d".to_owned()],
		],
		learning_rate: 1.0,
		max_depth: 5,
		min_rows: 5.0,
		..Default::default()
	};
	let (grown, _) = grow_frame(&frame, &ys, &train_options);
	let tree = &grown.tree;
	let split_column = |node_id: usize| {
		tree.decided(node_id)
			.ok()
			.and_then(|node| node.split.as_ref())
			.map(|split| split.column_index)
	};
	let mut n_paths_with_two_columns = 0;
	for (node_id, node) in tree.nodes().iter().enumerate() {
		if !matches!(node, Node::Decided(_)) {
			continue;
		}
		let mut path = Vec::new();
		let mut current = Some(node_id);
		while let Some(id) = current {
			path.extend(split_column(id));
			current = match tree.node(id).unwrap() {
				Node::Decided(node) => node.parent,
				Node::Undecided(node) => node.parent,
				Node::Leaf(node) => node.parent,
			};
		}
		let in_ab = path.iter().all(|column| *column < 2);
		let in_cd = path.iter().all(|column| *column >= 2);
		assert!(in_ab || in_cd, "path {:?} mixes groups", path);
		let mut distinct = path.clone();
		distinct.sort_unstable();
		distinct.dedup();
		if distinct.len() == 2 {
			n_paths_with_two_columns += 1;
		}
	}
	assert!(n_paths_with_two_columns > 0);
}

#[test]
fn test_compressed_tree_scores_like_grown_tree() {
	use crate::{
		compressed_tree::CompressedTree,
		frame::{Column, Frame},
		split::SplitKind,
		split_points::HistogramType,
		tree::Node,
	};
	let levels: Vec<String> = ["red", "green", "blue", "gold", "gray"]
		.iter()
		.map(|level| level.to_string())
		.collect();
	let level_effects = [0.0, 5.0, 1.0, 4.0, 2.0];
	let mut rng = Xoshiro256Plus::seed_from_u64(11);
	let mut xs = Vec::new();
	let mut codes = Vec::new();
	let mut ns = Vec::new();
	let mut ys = Vec::new();
	for row in 0..1500 {
		let x: f32 = if row % 7 == 0 { f32::NAN } else { rng.gen_range(0.0, 1.0) };
		let code = if row % 11 == 0 { None } else { Some(rng.gen_range(0, 5u32)) };
		let n = (row % 20).to_f32().unwrap();
		let mut y = code.map(|code| level_effects[code.to_usize().unwrap()]).unwrap_or(2.5);
		y += if x.is_nan() {
			1.5
		} else if x > 0.5 {
			3.0
		} else {
			0.0
		};
		y += if n >= 12.0 { 2.0 } else { 0.0 };
		xs.push(x);
		codes.push(code);
		ns.push(n);
		ys.push(y + rng.gen_range(-0.1, 0.1));
	}
	let frame = Frame::new(vec![
		Column::number("x", xs),
		Column::enumeration("color", levels, &codes),
		Column::number("n", ns),
	]);
	let mut rows: Vec<Vec<f32>> = (0..frame.n_rows())
		.map(|row| frame.columns().iter().map(|column| column.data[row]).collect())
		.collect();
	rows.push(vec![f32::NAN; 3]);
	rows.push(vec![0.75, 9.0, 30.0]);
	rows.push(vec![-1.0, f32::NAN, -4.0]);
	let histogram_types = [
		HistogramType::UniformAdaptive,
		HistogramType::UniformRobust,
		HistogramType::Random,
		HistogramType::QuantilesGlobal,
	];
	for histogram_type in histogram_types.iter().copied() {
		let train_options = TrainOptions {
			histogram_type,
			learning_rate: 1.0,
			max_depth: 6,
			min_rows: 2.0,
			..Default::default()
		};
		let (grown, _) = grow_frame(&frame, &ys, &train_options);
		let tree = &grown.tree;
		assert!(tree.depth() >= 3);
		let has_group_split = tree.nodes().iter().any(|node| {
			matches!(
				node,
				Node::Decided(node) if matches!(node.split.as_ref().map(|split| &split.kind), Some(SplitKind::Bitset(_)))
			)
		});
		assert!(has_group_split);
		let compressed = CompressedTree::compress(tree, 0, 0, 1).unwrap();
		for row in rows.iter() {
			assert_eq!(
				tree.predict(row).unwrap(),
				compressed.score(row).unwrap(),
				"{:?} row {:?}",
				histogram_type,
				row
			);
		}
	}
}

#[test]
fn test_grow_tree_recovers_noisy_breakpoint() {
	use crate::frame::{Column, Frame};
	let mut rng = Xoshiro256Plus::seed_from_u64(5);
	let xs: Vec<f32> = (0..1000).map(|x| x.to_f32().unwrap() / 1000.0).collect();
	let ys: Vec<f32> = xs
		.iter()
		.map(|x| (if *x >= 0.37 { 1.0 } else { 0.0 }) + rng.gen_range(-0.2, 0.2))
		.collect();
	let frame = Frame::new(vec![Column::number("x", xs)]);
	let train_options = TrainOptions {
		learning_rate: 1.0,
		max_depth: 1,
		..Default::default()
	};
	let (grown, _) = grow_frame(&frame, &ys, &train_options);
	let tree = &grown.tree;
	let split_value = tree.decided(0).unwrap().split_value.unwrap();
	assert!((split_value - 0.37).abs() < 0.02, "split at {}", split_value);
	assert!(tree.predict(&[0.1]).unwrap().abs() < 0.05);
	assert!((tree.predict(&[0.9]).unwrap() - 1.0).abs() < 0.05);
}
