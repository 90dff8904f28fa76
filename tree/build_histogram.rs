#[cfg(feature = "timing")]
use crate::timing::Timing;
use crate::{
	error::Error,
	frame::{Frame, TreeInput},
	histogram::{Accumulate, Histogram, SharedHistogram},
	nids::{is_decided, is_out_of_bag, nid_to_oob, oob_to_nid},
	tree::{Tree, UndecidedNode},
};
use num_traits::ToPrimitive;
use rayon::prelude::*;

/// With fewer (node, column) pairs than this, every column gets all threads.
const MAX_NODE_COLUMNS_FOR_ALL_WORKERS: usize = 16 * 1024;

/**
How worker threads accumulate rows into the histograms of a layer.

`Private` gives each worker its own copy of each histogram and merges the copies afterwards. `Shared` has every worker update a single histogram with atomic additions, which uses less memory but contends when many workers hit the same bins. `Auto` uses private copies when there are at least as many active columns as threads, since then workers rarely touch the same histogram.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub enum AccumulationPolicy {
	#[serde(rename = "auto")]
	Auto,
	#[serde(rename = "shared")]
	Shared,
	#[serde(rename = "private")]
	Private,
}

impl Default for AccumulationPolicy {
	fn default() -> Self {
		AccumulationPolicy::Auto
	}
}

impl AccumulationPolicy {
	pub fn use_shared(self, n_active_columns: usize, n_threads: usize) -> bool {
		match self {
			AccumulationPolicy::Auto => n_active_columns < n_threads,
			AccumulationPolicy::Shared => true,
			AccumulationPolicy::Private => false,
		}
	}
}

pub struct BuildLayerOptions<'a> {
	pub input: TreeInput<'a>,
	pub partition_size: usize,
	pub policy: AccumulationPolicy,
	/// The first node of the layer.
	pub leaf: usize,
	/// One past the last node of the layer.
	pub tmax: usize,
	/// The first layer only accumulates, since every in bag row already sits at the root.
	pub is_root_layer: bool,
	#[cfg(feature = "timing")]
	pub timing: &'a Timing,
}

/// The rows of one partition, grouped by the node of the layer they belong to.
struct PartitionRows {
	/// The rows of node `leaf + k` are `rows[offsets[k]..offsets[k + 1]]`.
	offsets: Vec<usize>,
	rows: Vec<usize>,
}

impl PartitionRows {
	fn node_rows(&self, node_offset: usize) -> &[usize] {
		&self.rows[self.offsets[node_offset]..self.offsets[node_offset + 1]]
	}
}

/**
Build the histograms of every node in `leaf..tmax`.

The first pass moves every row down one level by scoring it against the split of the node it sits in, then groups the rows of each partition by their new node. The second pass accumulates the rows of each node into that node's histogram for every column it scores. Each histogram is rounded with [`Histogram::reduce_precision`] once all of its rows are in.
*/
pub fn build_layer(tree: &mut Tree, nids: &mut [i32], options: BuildLayerOptions) -> Result<(), Error> {
	let BuildLayerOptions {
		input,
		partition_size,
		policy,
		leaf,
		tmax,
		is_root_layer,
		..
	} = options;
	#[cfg(feature = "timing")]
	let timing = options.timing;
	let frame = input.frame;
	let partition_size = partition_size.max(1);
	let n_nodes = tmax - leaf;

	// Pass 1: score the rows of every partition and group them by node.
	#[cfg(feature = "timing")]
	let start = std::time::Instant::now();
	let partitions = {
		let tree: &Tree = tree;
		nids.par_chunks_mut(partition_size)
			.enumerate()
			.map(|(partition_index, nids)| {
				let first_row = partition_index * partition_size;
				let node_offsets = score_decide(tree, frame, nids, first_row, leaf, is_root_layer)?;
				sort_rows(&node_offsets, first_row, n_nodes)
			})
			.collect::<Result<Vec<_>, Error>>()?
	};
	#[cfg(feature = "timing")]
	timing.score_rows.inc(start.elapsed());

	// Pass 2: accumulate each active column, in parallel over columns and then over groups of partitions.
	#[cfg(feature = "timing")]
	let start = std::time::Instant::now();
	let results = {
		let nodes = (leaf..tmax)
			.map(|node_id| tree.undecided(node_id))
			.collect::<Result<Vec<&UndecidedNode>, Error>>()?;
		let active_columns = active_columns(&nodes);
		let n_threads = rayon::current_num_threads();
		let use_shared = policy.use_shared(active_columns.len(), n_threads);
		let n_workers = workers_per_column(n_nodes, active_columns.len(), n_threads);
		let group_size = ((partitions.len() + n_workers - 1) / n_workers).max(1);
		log::trace!(
			"accumulating {} columns for {} nodes with {} workers per column ({})",
			active_columns.len(),
			n_nodes,
			n_workers,
			if use_shared { "shared" } else { "private" }
		);
		active_columns
			.par_iter()
			.map(|column_index| -> Result<_, Error> {
				let templates: Vec<Option<&Histogram>> = nodes
					.iter()
					.map(|node| {
						if node.scores_column(*column_index) {
							node.histograms[*column_index].as_ref()
						} else {
							None
						}
					})
					.collect();
				let data = &frame.column(*column_index).data;
				let histograms = if use_shared {
					accumulate_shared(&templates, &partitions, group_size, data, &input)?
				} else {
					accumulate_private(&templates, &partitions, group_size, data, &input)?
				};
				Ok((*column_index, histograms))
			})
			.collect::<Result<Vec<_>, Error>>()?
	};
	#[cfg(feature = "timing")]
	timing.accumulate.inc(start.elapsed());

	#[cfg(feature = "timing")]
	let start = std::time::Instant::now();
	for (column_index, histograms) in results {
		for (node_offset, histogram) in histograms.into_iter().enumerate() {
			if let Some(mut histogram) = histogram {
				histogram.reduce_precision();
				tree.undecided_mut(leaf + node_offset)?.histograms[column_index] = Some(histogram);
			}
		}
	}
	#[cfg(feature = "timing")]
	timing.reduce_precision.inc(start.elapsed());
	Ok(())
}

/// The number of workers that accumulate one column.
pub fn workers_per_column(n_nodes: usize, n_columns: usize, n_threads: usize) -> usize {
	let n_threads = n_threads.max(1);
	if n_nodes * n_columns < MAX_NODE_COLUMNS_FOR_ALL_WORKERS {
		n_threads
	} else {
		(4 * n_threads / n_columns.max(1)).max(1).min(n_threads)
	}
}

/// The columns scored by at least one node, in increasing order.
fn active_columns(nodes: &[&UndecidedNode]) -> Vec<usize> {
	let mut columns: Vec<usize> = nodes
		.iter()
		.flat_map(|node| {
			node.score_columns
				.iter()
				.copied()
				.filter(move |column_index| node.histograms[*column_index].is_some())
		})
		.collect();
	columns.sort_unstable();
	columns.dedup();
	columns
}

/**
Move the rows of one partition down one level.

Rows at a node that turned out not to split fall back to the split of its parent. A row whose child slot is empty stays where it is. Out of bag rows move like any other row but keep their encoding. Returns, for each row, the offset of its new node in the layer, or -1 if the row is not accumulated.
*/
fn score_decide(
	tree: &Tree,
	frame: &Frame,
	nids: &mut [i32],
	first_row: usize,
	leaf: usize,
	is_root_layer: bool,
) -> Result<Vec<i32>, Error> {
	let leaf = leaf.to_i32().unwrap();
	let encode = |nid: i32, oob: bool| if oob { nid_to_oob(nid) } else { nid };
	nids.iter_mut()
		.enumerate()
		.map(|(offset, slot)| -> Result<i32, Error> {
			let row = first_row + offset;
			let mut nid = *slot;
			if is_decided(nid) {
				return Ok(-1);
			}
			let oob = is_out_of_bag(nid);
			if is_root_layer {
				return Ok(if oob { -1 } else { nid - leaf });
			}
			if oob {
				nid = oob_to_nid(nid);
			}
			let mut node = tree.decided(nid.to_usize().unwrap())?;
			if node.split.is_none() {
				match node.parent {
					None => return Ok(if oob { -1 } else { nid - leaf }),
					Some(parent) => {
						nid = parent.to_i32().unwrap();
						*slot = encode(nid, oob);
						node = tree.decided(parent)?;
					}
				}
			}
			let value = |column_index: usize| frame.column(column_index).data[row];
			let child = node
				.direction(value)
				.and_then(|direction| node.child(direction));
			match child {
				Some(child) => {
					nid = child.to_i32().unwrap();
					*slot = encode(nid, oob);
					Ok(if oob { -1 } else { nid - leaf })
				}
				None => Ok(-1),
			}
		})
		.collect()
}

/// Group rows by node offset with a counting sort.
fn sort_rows(node_offsets: &[i32], first_row: usize, n_nodes: usize) -> Result<PartitionRows, Error> {
	let mut offsets = vec![0; n_nodes + 1];
	for node_offset in node_offsets.iter().copied() {
		if node_offset < 0 {
			continue;
		}
		let node_offset = node_offset.to_usize().unwrap();
		if node_offset >= n_nodes {
			return Err(Error::NodeOutOfRange {
				node_id: node_offset,
				n_nodes,
			});
		}
		offsets[node_offset + 1] += 1;
	}
	for k in 0..n_nodes {
		offsets[k + 1] += offsets[k];
	}
	let mut cursors = offsets.clone();
	let mut rows = vec![0; offsets[n_nodes]];
	for (offset, node_offset) in node_offsets.iter().copied().enumerate() {
		if node_offset < 0 {
			continue;
		}
		let cursor = &mut cursors[node_offset.to_usize().unwrap()];
		rows[*cursor] = first_row + offset;
		*cursor += 1;
	}
	Ok(PartitionRows { offsets, rows })
}

fn accumulate_partition<A: Accumulate>(
	histograms: &mut [Option<A>],
	partition: &PartitionRows,
	data: &[f32],
	input: &TreeInput,
) -> Result<(), Error> {
	for (node_offset, histogram) in histograms.iter_mut().enumerate() {
		let histogram = match histogram {
			Some(histogram) => histogram,
			None => continue,
		};
		for row in partition.node_rows(node_offset).iter().copied() {
			histogram.accumulate(data[row], input.response[row], input.weight(row))?;
		}
	}
	Ok(())
}

fn accumulate_private(
	templates: &[Option<&Histogram>],
	partitions: &[PartitionRows],
	group_size: usize,
	data: &[f32],
	input: &TreeInput,
) -> Result<Vec<Option<Histogram>>, Error> {
	let empty = || -> Vec<Option<Histogram>> {
		templates
			.iter()
			.map(|template| template.map(|template| template.empty_copy()))
			.collect()
	};
	partitions
		.par_chunks(group_size)
		.map(|group| -> Result<Vec<Option<Histogram>>, Error> {
			let mut histograms = empty();
			for partition in group {
				accumulate_partition(&mut histograms, partition, data, input)?;
			}
			Ok(histograms)
		})
		.reduce(
			|| Ok(empty()),
			|a, b| match (a, b) {
				(Ok(mut a), Ok(b)) => {
					for (a, b) in a.iter_mut().zip(b.iter()) {
						if let (Some(a), Some(b)) = (a, b) {
							a.merge(b);
						}
					}
					Ok(a)
				}
				(Err(error), _) => Err(error),
				(_, Err(error)) => Err(error),
			},
		)
}

fn accumulate_shared(
	templates: &[Option<&Histogram>],
	partitions: &[PartitionRows],
	group_size: usize,
	data: &[f32],
	input: &TreeInput,
) -> Result<Vec<Option<Histogram>>, Error> {
	let shared: Vec<Option<SharedHistogram>> = templates
		.iter()
		.map(|template| template.map(|template| template.share()))
		.collect();
	partitions
		.par_chunks(group_size)
		.try_for_each(|group| -> Result<(), Error> {
			let mut handles: Vec<Option<&SharedHistogram>> = shared.iter().map(Option::as_ref).collect();
			for partition in group {
				accumulate_partition(&mut handles, partition, data, input)?;
			}
			Ok(())
		})?;
	Ok(shared
		.into_iter()
		.map(|histogram| histogram.map(SharedHistogram::into_histogram))
		.collect())
}

#[cfg(test)]
fn build_test_tree(policy: AccumulationPolicy) -> (Tree, Vec<i32>) {
	use crate::{
		frame::Column,
		nids::OUT_OF_BAG,
		split_points::{HistogramType, SplitPointStrategy},
		tree::test_decide_options,
	};
	let xs: Vec<f32> = (0..40).map(|row| (row % 4).to_f32().unwrap()).collect();
	let frame = Frame::new(vec![Column::number("x", xs.clone())]);
	let input = TreeInput {
		frame: &frame,
		response: &xs,
		weights: None,
	};
	let strategy = SplitPointStrategy::new(&frame, 20, HistogramType::UniformAdaptive, 0);
	let decide_options = test_decide_options(&frame, &strategy);
	let mut tree = Tree::new(0);
	tree.push_root(&[0], None, 20, &decide_options).unwrap();
	let mut nids = vec![0; 40];
	for nid in nids.iter_mut().take(4) {
		*nid = OUT_OF_BAG;
	}
	let mut importances = vec![0.0];
	let (mut leaf, mut tmax) = (0, 1);
	for layer in 0..2 {
		build_layer(
			&mut tree,
			&mut nids,
			BuildLayerOptions {
				input,
				partition_size: 7,
				policy,
				leaf,
				tmax,
				is_root_layer: layer == 0,
				#[cfg(feature = "timing")]
				timing: &Timing::new(),
			},
		)
		.unwrap();
		if layer == 1 {
			break;
		}
		tree.decide_layer(leaf, tmax, &decide_options, &mut importances)
			.unwrap();
		leaf = tmax;
		tmax = tree.len();
	}
	(tree, nids)
}

#[test]
fn test_build_layer() {
	for policy in [AccumulationPolicy::Private, AccumulationPolicy::Shared].iter().copied() {
		let (tree, nids) = build_test_tree(policy);
		assert_eq!(tree.len(), 3);
		let root = tree.decided(0).unwrap();
		assert_eq!(root.split_value, Some(1.5));
		assert_eq!(root.children, [Some(1), Some(2)]);
		let left = tree.undecided(1).unwrap().histograms[0].as_ref().unwrap();
		let right = tree.undecided(2).unwrap().histograms[0].as_ref().unwrap();
		assert_eq!(left.n_bins(), 2);
		assert_eq!((left.weight(0), left.weight(1)), (9.0, 9.0));
		assert_eq!((right.weight(0), right.weight(1)), (9.0, 9.0));
		assert_eq!(right.weighted_response(1), 27.0);
		// Out of bag rows move down the tree without being accumulated.
		assert_eq!(&nids[..4], &[nid_to_oob(1), nid_to_oob(1), nid_to_oob(2), nid_to_oob(2)]);
		assert_eq!(&nids[4..8], &[1, 1, 2, 2]);
	}
}

#[test]
fn test_sort_rows() {
	let partition = sort_rows(&[1, -1, 0, 1, 2, 0], 10, 3).unwrap();
	assert_eq!(partition.node_rows(0), &[12, 15]);
	assert_eq!(partition.node_rows(1), &[10, 13]);
	assert_eq!(partition.node_rows(2), &[14]);
	assert!(sort_rows(&[3], 0, 3).is_err());
}

#[test]
fn test_workers_per_column() {
	assert_eq!(workers_per_column(4, 10, 8), 8);
	assert_eq!(workers_per_column(1024, 64, 8), 1);
	assert_eq!(workers_per_column(1024, 16, 8), 2);
	assert_eq!(workers_per_column(1024, 16, 1), 1);
}
