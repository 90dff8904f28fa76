use crate::{
	bitset::BitsetView,
	compressed_tree::{CompressedTree, EncodedChild, EncodedNode},
	error::Error,
	split::{Condition, Direction},
};
use num_traits::ToPrimitive;
use std::fmt::Write;

/**
An event in a depth first walk of a compressed tree.

For each decided node the visitor receives `Pre`, then the events of the left subtree, then `Mid`, then the events of the right subtree, then `Post`. Leaves produce a single `Leaf` event. `direction` is the side of the parent the leaf hangs from, and is `None` for a tree that is a single leaf.
*/
#[derive(Clone, Copy, Debug)]
pub enum VisitEvent<'a> {
	Pre { depth: usize, node: EncodedNode<'a> },
	Mid { depth: usize, node: EncodedNode<'a> },
	Post { depth: usize, node: EncodedNode<'a> },
	Leaf {
		depth: usize,
		value: f32,
		direction: Option<Direction>,
	},
}

/// Summary statistics of the leaves of a tree.
#[derive(Clone, Debug, PartialEq)]
pub struct TreeStats {
	pub min_depth: usize,
	pub max_depth: usize,
	pub mean_depth: f64,
	pub n_leaves: usize,
}

impl CompressedTree {
	/// Walk the tree depth first, left before right, calling `visitor` for every event.
	pub fn visit<'a>(&'a self, visitor: &mut dyn FnMut(VisitEvent<'a>)) -> Result<(), Error> {
		visit_child(self, self.root()?, 0, None, visitor)
	}

	/// Render the tree as nested `if`/`else` blocks, one line per node. Columns are named `x{index}` unless `column_names` is given.
	pub fn to_pretty_string(&self, column_names: Option<&[&str]>) -> Result<String, Error> {
		let mut output = String::new();
		self.visit(&mut |event| {
			let line = match event {
				VisitEvent::Pre { depth, node } => {
					format!("{}if {}", indent(depth), describe_condition(&node, column_names))
				}
				VisitEvent::Mid { depth, .. } => format!("{}else", indent(depth)),
				VisitEvent::Post { .. } => return,
				VisitEvent::Leaf { depth, value, .. } => format!("{}{}", indent(depth), value),
			};
			writeln!(output, "{}", line).unwrap();
		})?;
		Ok(output)
	}

	pub fn stats(&self) -> Result<TreeStats, Error> {
		let mut min_depth = usize::MAX;
		let mut max_depth = 0;
		let mut depth_sum: usize = 0;
		let mut n_leaves = 0;
		self.visit(&mut |event| {
			if let VisitEvent::Leaf { depth, .. } = event {
				min_depth = min_depth.min(depth);
				max_depth = max_depth.max(depth);
				depth_sum += depth;
				n_leaves += 1;
			}
		})?;
		Ok(TreeStats {
			min_depth,
			max_depth,
			mean_depth: depth_sum.to_f64().unwrap() / n_leaves.to_f64().unwrap(),
			n_leaves,
		})
	}
}

fn visit_child<'a>(
	tree: &'a CompressedTree,
	child: EncodedChild,
	depth: usize,
	direction: Option<Direction>,
	visitor: &mut dyn FnMut(VisitEvent<'a>),
) -> Result<(), Error> {
	match child {
		EncodedChild::Leaf(value) => visitor(VisitEvent::Leaf {
			depth,
			value,
			direction,
		}),
		EncodedChild::Node(position) => {
			let node = tree.node(position)?;
			visitor(VisitEvent::Pre { depth, node });
			visit_child(tree, node.children[0], depth + 1, Some(Direction::Left), visitor)?;
			visitor(VisitEvent::Mid { depth, node });
			visit_child(tree, node.children[1], depth + 1, Some(Direction::Right), visitor)?;
			visitor(VisitEvent::Post { depth, node });
		}
	}
	Ok(())
}

fn indent(depth: usize) -> String {
	"\t".repeat(depth)
}

/// Describe the condition under which a row goes left.
fn describe_condition(node: &EncodedNode, column_names: Option<&[&str]>) -> String {
	let column = column_names
		.and_then(|names| names.get(node.column_index).map(|name| name.to_string()))
		.unwrap_or_else(|| format!("x{}", node.column_index));
	let condition = match node.condition {
		Condition::NaVsRest => return format!("{} is not NA", column),
		Condition::LessThan(value) => format!("{} < {}", column, value),
		Condition::NotEqual(value) => format!("{} != {}", column, value),
		Condition::Group(bitset) => format!("{} not in {}", column, format_levels(bitset)),
	};
	if node.na_direction.na_goes_right() {
		condition
	} else {
		format!("{} or NA", condition)
	}
}

fn format_levels(bitset: BitsetView) -> String {
	let start = i64::from(bitset.offset);
	let levels: Vec<String> = (start..start + i64::from(bitset.n_bits))
		.filter(|level| bitset.contains(*level))
		.map(|level| level.to_string())
		.collect();
	format!("{{{}}}", levels.join(", "))
}

#[cfg(test)]
fn events(tree: &CompressedTree) -> Vec<String> {
	let mut events = Vec::new();
	tree.visit(&mut |event| {
		events.push(match event {
			VisitEvent::Pre { depth, node } => format!("pre {} @{}", depth, node.position),
			VisitEvent::Mid { depth, node } => format!("mid {} @{}", depth, node.position),
			VisitEvent::Post { depth, node } => format!("post {} @{}", depth, node.position),
			VisitEvent::Leaf {
				depth,
				value,
				direction,
			} => format!("leaf {} {} {:?}", depth, value, direction),
		})
	})
	.unwrap();
	events
}

#[test]
fn test_visit_order() {
	use crate::compressed_tree::test_tree;
	let compressed = CompressedTree::compress(&test_tree(), 0, 0, 1).unwrap();
	insta::assert_debug_snapshot!(events(&compressed), @r###"
 [
     "pre 0 @0",
     "leaf 1 0 Some(Left)",
     "mid 0 @0",
     "pre 1 @12",
     "leaf 2 10 Some(Left)",
     "mid 1 @12",
     "leaf 2 20 Some(Right)",
     "post 1 @12",
     "post 0 @0",
 ]
 "###);
}

#[test]
fn test_pretty_string() {
	use crate::compressed_tree::test_tree;
	let compressed = CompressedTree::compress(&test_tree(), 0, 0, 1).unwrap();
	assert_eq!(
		compressed.to_pretty_string(Some(&["age", "rooms"])).unwrap(),
		"if age < 1.5\n\t0\nelse\n\tif rooms != 3 or NA\n\t\t10\n\telse\n\t\t20\n"
	);
	assert_eq!(
		compressed.to_pretty_string(None).unwrap().lines().next(),
		Some("if x0 < 1.5")
	);
}

#[test]
fn test_tree_stats() {
	use crate::{compressed_tree::test_tree, tree::Tree};
	let compressed = CompressedTree::compress(&test_tree(), 0, 0, 1).unwrap();
	let stats = compressed.stats().unwrap();
	assert_eq!(
		stats,
		TreeStats {
			min_depth: 1,
			max_depth: 2,
			mean_depth: 5.0 / 3.0,
			n_leaves: 3,
		}
	);
	let mut stump = Tree::new(0);
	stump.insert_leaves(1.0, 1.0);
	let stats = CompressedTree::compress(&stump, 0, 0, 1).unwrap().stats().unwrap();
	assert_eq!((stats.min_depth, stats.max_depth, stats.n_leaves), (0, 0, 1));
}

#[test]
fn test_group_condition_text() {
	use crate::{bitset::Bitset, split::NaSplitDirection};
	let mut bitset = Bitset::new(8, 0);
	bitset.set(1);
	bitset.set(4);
	let node = EncodedNode {
		position: 0,
		column_index: 2,
		na_direction: NaSplitDirection::NaLeft,
		condition: Condition::Group(bitset.view()),
		children: [EncodedChild::Leaf(0.0), EncodedChild::Leaf(1.0)],
		child_positions: [8, 12],
	};
	assert_eq!(describe_condition(&node, None), "x2 not in {1, 4} or NA");
}
