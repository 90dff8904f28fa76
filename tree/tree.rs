use crate::{
	constraints::{BranchInteractionConstraints, Constraints, GlobalInteractionConstraints},
	error::Error,
	frame::Frame,
	histogram::{find_max_exclusive, Histogram, HistogramKind, ValueKind},
	split::{route, Condition, Direction, NaSplitDirection, Split, SplitKind},
	split_points::{LayoutRequest, SplitPointStrategy},
};
use num_traits::ToPrimitive;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::sync::Arc;

/// Finding the best split of a node is parallelized over columns when the node has more than this many bins in total.
const MIN_BINS_TO_PARALLELIZE: usize = 1024;

/// A child whose squared error is at most this value is already pure and is not split again.
const MIN_SE_TO_SPLIT: f64 = 1e-30;

/**
A tree under construction.

Nodes are stored in an arena and refer to each other by index. The root is at index 0. Children are always created after their parents, and all the children created while deciding one layer have consecutive indexes, which is what lets the histogram scheduler address the nodes of a layer as a range.
*/
#[derive(Clone, Debug)]
pub struct Tree {
	nodes: Vec<Node>,
	depth: usize,
	n_leaves: usize,
	seed: u64,
	rng: Xoshiro256Plus,
}

/// A node is undecided until its histograms are built, then decided, and nodes that end a path become leaves.
#[derive(Clone, Debug)]
pub enum Node {
	Undecided(UndecidedNode),
	Decided(DecidedNode),
	Leaf(LeafNode),
}

#[derive(Clone, Debug)]
pub struct UndecidedNode {
	pub parent: Option<usize>,
	/// One histogram per frame column. Columns that can no longer split this node have `None`.
	pub histograms: Vec<Option<Histogram>>,
	/// The columns searched for the best split of this node.
	pub score_columns: Vec<usize>,
	pub constraints: Option<Constraints>,
	pub interactions: BranchInteractionConstraints,
}

#[derive(Clone, Debug)]
pub struct DecidedNode {
	pub parent: Option<usize>,
	/// `None` if no column could split the node.
	pub split: Option<Split>,
	/// The value numeric splits compare against.
	pub split_value: Option<f32>,
	/// The left and right children. An empty slot means rows sent that way stop here until the slot becomes a leaf.
	pub children: [Option<usize>; 2],
}

#[derive(Clone, Debug)]
pub struct LeafNode {
	pub parent: Option<usize>,
	pub prediction: f32,
}

/// The options that control how the nodes of a layer are decided.
pub struct DecideOptions<'a> {
	pub frame: &'a Frame,
	pub strategy: &'a SplitPointStrategy,
	pub interactions: Option<&'a GlobalInteractionConstraints>,
	pub histogram_kind: HistogramKind,
	pub min_rows: f64,
	pub min_split_improvement: f64,
	pub check_float_splits: bool,
	pub n_bins: usize,
	pub n_bins_cats: usize,
	pub mtries: Option<usize>,
}

impl UndecidedNode {
	/// The columns that have a histogram.
	pub fn histogram_columns(&self) -> Vec<usize> {
		self.histograms
			.iter()
			.enumerate()
			.filter(|(_, histogram)| histogram.is_some())
			.map(|(column_index, _)| column_index)
			.collect()
	}

	pub fn scores_column(&self, column_index: usize) -> bool {
		self.score_columns.binary_search(&column_index).is_ok()
	}

	fn best_split(&self, options: &DecideOptions) -> Option<(Split, Option<f32>)> {
		let candidate = |column_index: &usize| -> Option<(Split, Option<f32>)> {
			let histogram = self.histograms.get(*column_index)?.as_ref()?;
			let split = histogram.best_split(
				options.min_rows,
				options.min_split_improvement,
				self.constraints.as_ref(),
			)?;
			let split_value = if split.is_numeric() {
				Some(split.split_value(histogram, options.check_float_splits)?)
			} else {
				None
			};
			Some((split, split_value))
		};
		// The lowest error wins, and ties go to the lower column index so the result does not depend on scheduling.
		let better = |a: (Split, Option<f32>), b: (Split, Option<f32>)| {
			if b.0.se() < a.0.se() || (b.0.se() == a.0.se() && b.0.column_index < a.0.column_index) {
				b
			} else {
				a
			}
		};
		let n_bins: usize = self
			.score_columns
			.iter()
			.filter_map(|column_index| self.histograms.get(*column_index)?.as_ref())
			.map(|histogram| histogram.n_bins())
			.sum();
		if n_bins > MIN_BINS_TO_PARALLELIZE {
			self.score_columns
				.par_iter()
				.filter_map(candidate)
				.reduce_with(better)
		} else {
			self.score_columns
				.iter()
				.filter_map(candidate)
				.fold(None, |best, candidate| match best {
					None => Some(candidate),
					Some(best) => Some(better(best, candidate)),
				})
		}
	}
}

impl DecidedNode {
	/// The comparison this node applies, or `None` if the node did not split.
	pub fn condition(&self) -> Option<Condition> {
		let split = self.split.as_ref()?;
		if split.na_direction == NaSplitDirection::NaVsRest {
			return Some(Condition::NaVsRest);
		}
		match &split.kind {
			SplitKind::LessThan => self.split_value.map(Condition::LessThan),
			SplitKind::NotEqual => self.split_value.map(Condition::NotEqual),
			SplitKind::Bitset(bitset) => Some(Condition::Group(bitset.view())),
		}
	}

	/// The side a row goes to, given a way to read its column values.
	pub fn direction(&self, value: impl Fn(usize) -> f32) -> Option<Direction> {
		let split = self.split.as_ref()?;
		let condition = self.condition()?;
		Some(route(condition, split.na_direction, value(split.column_index)))
	}

	pub fn child(&self, direction: Direction) -> Option<usize> {
		self.children[direction.index()]
	}
}

impl Tree {
	pub fn new(seed: u64) -> Tree {
		Tree {
			nodes: Vec::new(),
			depth: 0,
			n_leaves: 0,
			seed,
			rng: Xoshiro256Plus::seed_from_u64(seed),
		}
	}

	pub fn nodes(&self) -> &[Node] {
		&self.nodes
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn depth(&self) -> usize {
		self.depth
	}

	pub fn n_leaves(&self) -> usize {
		self.n_leaves
	}

	pub fn seed(&self) -> u64 {
		self.seed
	}

	pub fn rng(&mut self) -> &mut Xoshiro256Plus {
		&mut self.rng
	}

	pub fn node(&self, node_id: usize) -> Result<&Node, Error> {
		self.nodes.get(node_id).ok_or(Error::NodeOutOfRange {
			node_id,
			n_nodes: self.nodes.len(),
		})
	}

	pub fn decided(&self, node_id: usize) -> Result<&DecidedNode, Error> {
		match self.node(node_id)? {
			Node::Decided(node) => Ok(node),
			_ => Err(Error::UnfinishedNode(node_id)),
		}
	}

	pub fn undecided(&self, node_id: usize) -> Result<&UndecidedNode, Error> {
		match self.node(node_id)? {
			Node::Undecided(node) => Ok(node),
			_ => Err(Error::UnfinishedNode(node_id)),
		}
	}

	pub fn undecided_mut(&mut self, node_id: usize) -> Result<&mut UndecidedNode, Error> {
		let n_nodes = self.nodes.len();
		match self.nodes.get_mut(node_id) {
			Some(Node::Undecided(node)) => Ok(node),
			Some(_) => Err(Error::UnfinishedNode(node_id)),
			None => Err(Error::NodeOutOfRange { node_id, n_nodes }),
		}
	}

	pub fn push(&mut self, node: Node) -> usize {
		self.nodes.push(node);
		self.nodes.len() - 1
	}

	/// Create the root node with a histogram for each of `columns` that can be split.
	pub fn push_root(
		&mut self,
		columns: &[usize],
		constraints: Option<Constraints>,
		n_bins_top_level: usize,
		options: &DecideOptions,
	) -> Result<usize, Error> {
		let frame = options.frame;
		let mut histograms = vec![None; frame.n_columns()];
		for column_index in columns.iter().copied() {
			let stats = frame.stats(column_index);
			if stats.is_constant() {
				continue;
			}
			let value_kind = value_kind(frame, column_index);
			let n_bins = match value_kind {
				ValueKind::Categorical => options.n_bins_cats,
				_ => n_bins_top_level.max(options.n_bins),
			};
			let min = stats.min;
			let max_exclusive = find_max_exclusive(stats.max, value_kind != ValueKind::Real);
			if (n_bins.to_f64().unwrap() / (max_exclusive - min)).is_infinite() {
				log::warn!(
					"ignoring column \"{}\" because its range is too narrow to bin",
					frame.column(column_index).name
				);
				continue;
			}
			let layout = options.strategy.layout(
				LayoutRequest {
					column_index,
					value_kind,
					min,
					max_exclusive,
					n_bins,
					parent: None,
					is_split_column: false,
				},
				&mut self.rng,
			)?;
			histograms[column_index] = Some(Histogram::new(Arc::new(layout), options.histogram_kind));
		}
		let mut root = UndecidedNode {
			parent: None,
			histograms,
			score_columns: Vec::new(),
			constraints,
			interactions: BranchInteractionConstraints::root(),
		};
		root.score_columns = sample_columns(&root.histogram_columns(), options.mtries, &mut self.rng);
		Ok(self.push(Node::Undecided(root)))
	}

	/**
	Decide every undecided node in `leaf..tmax`.

	The best split of each node is found in parallel. Children are then created serially in node order, so node ids do not depend on scheduling. A node with no split clears its slot in its parent. The squared error improvement of every split is added to `importances`. Returns the number of nodes that split.
	*/
	pub fn decide_layer(
		&mut self,
		leaf: usize,
		tmax: usize,
		options: &DecideOptions,
		importances: &mut [f64],
	) -> Result<usize, Error> {
		let best_splits = (leaf..tmax)
			.into_par_iter()
			.map(|node_id| -> Result<_, Error> { Ok(self.undecided(node_id)?.best_split(options)) })
			.collect::<Result<Vec<_>, Error>>()?;
		let mut n_splits = 0;
		for (node_id, best_split) in (leaf..tmax).zip(best_splits.into_iter()) {
			let placeholder = Node::Leaf(LeafNode {
				parent: None,
				prediction: 0.0,
			});
			let node = match std::mem::replace(&mut self.nodes[node_id], placeholder) {
				Node::Undecided(node) => node,
				other => {
					self.nodes[node_id] = other;
					return Err(Error::UnfinishedNode(node_id));
				}
			};
			let (split, split_value) = match best_split {
				Some(best_split) => best_split,
				None => {
					self.nodes[node_id] = Node::Decided(DecidedNode {
						parent: node.parent,
						split: None,
						split_value: None,
						children: [None, None],
					});
					self.do_not_split(node_id);
					continue;
				}
			};
			log::trace!(
				"node {} splits on column {} with improvement {}",
				node_id,
				split.column_index,
				split.improvement()
			);
			importances[split.column_index] += split.improvement();
			let mut children = [None, None];
			for direction in [Direction::Left, Direction::Right].iter().copied() {
				if let Some(child) = self.child_node(&node, node_id, &split, direction, options)? {
					children[direction.index()] = Some(self.push(Node::Undecided(child)));
				}
			}
			self.nodes[node_id] = Node::Decided(DecidedNode {
				parent: node.parent,
				split: Some(split),
				split_value,
				children,
			});
			n_splits += 1;
		}
		if n_splits > 0 {
			self.depth += 1;
		}
		Ok(n_splits)
	}

	/// Clear the slot of a node in its parent, so rows that would be sent to it stop at the parent.
	pub fn do_not_split(&mut self, node_id: usize) {
		let parent = match self.nodes.get(node_id) {
			Some(Node::Decided(node)) => node.parent,
			Some(Node::Undecided(node)) => node.parent,
			_ => None,
		};
		if let Some(Node::Decided(parent)) = parent.and_then(|parent| self.nodes.get_mut(parent)) {
			for child in parent.children.iter_mut() {
				if *child == Some(node_id) {
					*child = None;
				}
			}
		}
	}

	/// Declare the histograms of the child on side `direction` of `split`. Returns `None` if the child cannot be split further.
	fn child_node(
		&mut self,
		parent: &UndecidedNode,
		parent_id: usize,
		split: &Split,
		direction: Direction,
		options: &DecideOptions,
	) -> Result<Option<UndecidedNode>, Error> {
		if split.n_rows(direction) < options.min_rows || split.se_side(direction) <= MIN_SE_TO_SPLIT {
			return Ok(None);
		}
		let interactions = match options.interactions {
			Some(global) => parent.interactions.next_level(global, split.column_index),
			None => parent.interactions.clone(),
		};
		let is_group_split = matches!(split.kind, SplitKind::Bitset(_));
		let mut histograms = vec![None; parent.histograms.len()];
		for (column_index, histogram) in parent.histograms.iter().enumerate() {
			let histogram = match histogram {
				Some(histogram) => histogram,
				None => continue,
			};
			if !interactions.is_allowed(column_index) {
				continue;
			}
			let layout = histogram.layout();
			let n_bins_for_kind = match layout.value_kind {
				ValueKind::Categorical => options.n_bins_cats,
				_ => options.n_bins,
			};
			let n_bins = (layout.n_bins / 2).max(n_bins_for_kind);
			// Columns that were accumulated narrow to the range actually seen.
			let (mut min, mut max_exclusive) = if !histogram.is_allocated() || is_group_split {
				(layout.min, layout.max_exclusive)
			} else {
				match (histogram.observed_min(), histogram.observed_max()) {
					(Some(min), Some(max)) => {
						if min == max {
							continue;
						}
						(min, find_max_exclusive(max, layout.is_int()))
					}
					_ => continue,
				}
			};
			if split.na_direction == NaSplitDirection::NaVsRest && direction == Direction::Right {
				continue;
			}
			let is_split_column = column_index == split.column_index;
			if is_split_column && split.na_direction != NaSplitDirection::NaVsRest {
				match split.kind {
					SplitKind::LessThan => {
						let mut boundary = layout.bin_at(split.bin);
						if layout.is_int() {
							boundary = boundary.ceil();
						}
						match direction {
							Direction::Left => max_exclusive = boundary,
							Direction::Right => min = boundary,
						}
					}
					SplitKind::NotEqual => {
						if direction == Direction::Right {
							continue;
						}
					}
					SplitKind::Bitset(_) => {}
				}
			}
			if min > max_exclusive || equals_within_one_small_ulp(min, max_exclusive) {
				continue;
			}
			if (n_bins.to_f64().unwrap() / (max_exclusive - min)).is_infinite() {
				continue;
			}
			if layout.is_int() && !(min + 1.0 < max_exclusive) {
				continue;
			}
			let child_layout = options.strategy.layout(
				LayoutRequest {
					column_index,
					value_kind: layout.value_kind,
					min,
					max_exclusive,
					n_bins,
					parent: Some(histogram),
					is_split_column,
				},
				&mut self.rng,
			)?;
			histograms[column_index] = Some(Histogram::new(Arc::new(child_layout), histogram.kind()));
		}
		if histograms.iter().all(|histogram| histogram.is_none()) {
			return Ok(None);
		}
		let mut child = UndecidedNode {
			parent: Some(parent_id),
			histograms,
			score_columns: Vec::new(),
			constraints: parent
				.constraints
				.as_ref()
				.map(|constraints| constraints.next_level(split, direction)),
			interactions,
		};
		child.score_columns = sample_columns(&child.histogram_columns(), options.mtries, &mut self.rng);
		Ok(Some(child))
	}

	/**
	Turn every open end of the tree into a leaf.

	Each empty child slot, undecided child, and child that could not be split becomes a leaf predicting the side of its parent's split, scaled by `learning_rate`. A tree whose root never split becomes a single leaf predicting `root_prediction`.
	*/
	pub fn insert_leaves(&mut self, learning_rate: f32, root_prediction: f32) {
		let root_splits = matches!(
			self.nodes.first(),
			Some(Node::Decided(DecidedNode { split: Some(_), .. }))
		);
		if !root_splits {
			let root = Node::Leaf(LeafNode {
				parent: None,
				prediction: root_prediction * learning_rate,
			});
			if self.nodes.is_empty() {
				self.nodes.push(root);
			} else {
				self.nodes[0] = root;
			}
			self.n_leaves = 1;
			return;
		}
		let n_nodes = self.nodes.len();
		let mut n_leaves = 0;
		for node_id in 0..n_nodes {
			let (split, children) = match &self.nodes[node_id] {
				Node::Decided(DecidedNode {
					split: Some(split),
					children,
					..
				}) => (split.clone(), *children),
				_ => continue,
			};
			for direction in [Direction::Left, Direction::Right].iter().copied() {
				let needs_leaf = match children[direction.index()] {
					None => true,
					Some(child) => match &self.nodes[child] {
						Node::Undecided(_) => true,
						Node::Decided(DecidedNode { split: None, .. }) => true,
						_ => false,
					},
				};
				if !needs_leaf {
					if let Some(Node::Leaf(_)) = children[direction.index()].map(|child| &self.nodes[child]) {
						n_leaves += 1;
					}
					continue;
				}
				let prediction = split.tree_prediction(direction).to_f32().unwrap() * learning_rate;
				let leaf = self.push(Node::Leaf(LeafNode {
					parent: Some(node_id),
					prediction,
				}));
				n_leaves += 1;
				if let Node::Decided(node) = &mut self.nodes[node_id] {
					node.children[direction.index()] = Some(leaf);
				}
			}
		}
		self.n_leaves = n_leaves;
	}

	/// Follow a row from `node_id` down to its leaf. Rows parked at an unfinished node are routed again from its parent.
	pub fn leaf_for(&self, node_id: usize, value: impl Fn(usize) -> f32) -> Result<usize, Error> {
		let mut node_id = node_id;
		for _ in 0..=self.nodes.len() {
			match self.node(node_id)? {
				Node::Leaf(_) => return Ok(node_id),
				Node::Decided(node) if node.split.is_some() => {
					let direction = node.direction(&value).ok_or(Error::UnfinishedNode(node_id))?;
					node_id = node.child(direction).ok_or(Error::UnfinishedNode(node_id))?;
				}
				Node::Decided(DecidedNode { parent, .. }) | Node::Undecided(UndecidedNode { parent, .. }) => {
					node_id = parent.ok_or(Error::UnfinishedNode(node_id))?;
				}
			}
		}
		Err(Error::UnfinishedNode(node_id))
	}

	pub fn leaf_prediction(&self, node_id: usize) -> Result<f32, Error> {
		match self.node(node_id)? {
			Node::Leaf(leaf) => Ok(leaf.prediction),
			_ => Err(Error::UnfinishedNode(node_id)),
		}
	}

	/// Make a prediction for a row of a finished tree.
	pub fn predict(&self, row: &[f32]) -> Result<f32, Error> {
		let leaf = self.leaf_for(0, |column_index| row[column_index])?;
		self.leaf_prediction(leaf)
	}
}

/// The kind of values a frame column holds.
pub fn value_kind(frame: &Frame, column_index: usize) -> ValueKind {
	if frame.column(column_index).is_enum() {
		ValueKind::Categorical
	} else if frame.stats(column_index).is_int {
		ValueKind::Integer
	} else {
		ValueKind::Real
	}
}

/// Choose `mtries` of `columns` at random, or all of them. The result is sorted.
pub fn sample_columns(columns: &[usize], mtries: Option<usize>, rng: &mut Xoshiro256Plus) -> Vec<usize> {
	match mtries {
		Some(mtries) if mtries < columns.len() => {
			let mut sampled: Vec<usize> = rand::seq::index::sample(rng, columns.len(), mtries.max(1))
				.into_iter()
				.map(|index| columns[index])
				.collect();
			sampled.sort_unstable();
			sampled
		}
		_ => columns.to_vec(),
	}
}

fn equals_within_one_small_ulp(a: f64, b: f64) -> bool {
	let ulp = |value: f64| {
		let value = value.abs();
		f64::from_bits(value.to_bits() + 1) - value
	};
	(a - b).abs() <= ulp(a).min(ulp(b))
}

#[cfg(test)]
pub fn test_decide_options<'a>(frame: &'a Frame, strategy: &'a SplitPointStrategy) -> DecideOptions<'a> {
	DecideOptions {
		frame,
		strategy,
		interactions: None,
		histogram_kind: HistogramKind::Gaussian,
		min_rows: 1.0,
		min_split_improvement: 0.0,
		check_float_splits: true,
		n_bins: 20,
		n_bins_cats: 1024,
		mtries: None,
	}
}

#[test]
fn test_decide_layer() {
	use crate::{frame::Column, histogram::Accumulate, split_points::HistogramType};
	let xs: Vec<f32> = (0..20).map(|x| (x / 10).to_f32().unwrap()).collect();
	let ys: Vec<f32> = xs.iter().map(|x| x * 10.0).collect();
	let frame = Frame::new(vec![Column::number("x", xs.clone())]);
	let strategy = SplitPointStrategy::new(&frame, 20, HistogramType::UniformAdaptive, 0);
	let options = test_decide_options(&frame, &strategy);
	let mut tree = Tree::new(0);
	let root = tree.push_root(&[0], None, 1024, &options).unwrap();
	assert_eq!(root, 0);
	let root_node = tree.undecided_mut(0).unwrap();
	let histogram = root_node.histograms[0].as_mut().unwrap();
	for (x, y) in xs.iter().zip(ys.iter()) {
		histogram.accumulate(*x, *y, 1.0).unwrap();
	}
	let mut importances = vec![0.0];
	let n_splits = tree.decide_layer(0, 1, &options, &mut importances).unwrap();
	assert_eq!(n_splits, 1);
	assert_eq!(tree.depth(), 1);
	assert_eq!(importances, vec![500.0]);
	let root = tree.decided(0).unwrap();
	assert_eq!(root.split_value, Some(0.5));
	// Both sides are pure, so neither child is created.
	assert_eq!(root.children, [None, None]);
	tree.insert_leaves(1.0, 0.0);
	assert_eq!(tree.n_leaves(), 2);
	assert_eq!(tree.predict(&[0.0]).unwrap(), 0.0);
	assert_eq!(tree.predict(&[1.0]).unwrap(), 10.0);
	assert_eq!(tree.predict(&[f32::NAN]).unwrap(), 10.0);
}

#[test]
fn test_do_not_split_prunes_parent_slot() {
	let mut tree = Tree::new(0);
	tree.push(Node::Decided(DecidedNode {
		parent: None,
		split: None,
		split_value: None,
		children: [Some(1), Some(2)],
	}));
	for _ in 0..2 {
		tree.push(Node::Decided(DecidedNode {
			parent: Some(0),
			split: None,
			split_value: None,
			children: [None, None],
		}));
	}
	tree.do_not_split(2);
	assert_eq!(tree.decided(0).unwrap().children, [Some(1), None]);
	assert!(matches!(
		tree.node(7),
		Err(Error::NodeOutOfRange {
			node_id: 7,
			n_nodes: 3
		})
	));
}

#[test]
fn test_unsplit_root_becomes_leaf() {
	let mut tree = Tree::new(0);
	tree.insert_leaves(0.5, 4.0);
	assert_eq!(tree.n_leaves(), 1);
	assert_eq!(tree.predict(&[]).unwrap(), 2.0);
}

#[test]
fn test_sample_columns() {
	let mut rng = Xoshiro256Plus::seed_from_u64(7);
	let columns = vec![1, 3, 5, 7, 9];
	assert_eq!(sample_columns(&columns, None, &mut rng), columns);
	assert_eq!(sample_columns(&columns, Some(10), &mut rng), columns);
	let sampled = sample_columns(&columns, Some(2), &mut rng);
	assert_eq!(sampled.len(), 2);
	assert!(sampled[0] < sampled[1]);
	assert!(sampled.iter().all(|column| columns.contains(column)));
}
