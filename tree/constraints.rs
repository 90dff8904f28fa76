use crate::{
	error::ConfigError,
	frame::Frame,
	split::{Direction, Split},
};
use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

/**
The monotone constraints in effect at a node.

The per-column directions are shared by every node of every tree. Each split on a constrained column narrows the prediction bounds of its children at the midpoint of their predictions, so that every leaf below the left child stays on the correct side of every leaf below the right child.
*/
#[derive(Clone, Debug)]
pub struct Constraints {
	directions: Arc<[i8]>,
	pub min: Option<f64>,
	pub max: Option<f64>,
}

impl Constraints {
	pub fn new(directions: Arc<[i8]>) -> Constraints {
		Constraints {
			directions,
			min: None,
			max: None,
		}
	}

	/// `1` if predictions must not decrease as the column increases, `-1` if they must not increase, and `0` if the column is unconstrained.
	pub fn direction(&self, column_index: usize) -> i8 {
		self.directions.get(column_index).copied().unwrap_or(0)
	}

	/// The constraints for the child on side `way` of `split`.
	pub fn next_level(&self, split: &Split, way: Direction) -> Constraints {
		let direction = self.direction(split.column_index);
		let mut next = self.clone();
		if direction == 0 {
			return next;
		}
		let mid = (split.tree_pred_left + split.tree_pred_right) / 2.0;
		match (direction > 0, way) {
			(true, Direction::Left) | (false, Direction::Right) => next.max = Some(mid),
			(true, Direction::Right) | (false, Direction::Left) => next.min = Some(mid),
		}
		next
	}
}

/// Resolve monotone constraints given by column name into one direction per column of the frame.
pub fn resolve_monotone_constraints(
	monotone_constraints: &BTreeMap<String, i8>,
	frame: &Frame,
) -> Result<Arc<[i8]>, ConfigError> {
	let mut directions = vec![0i8; frame.n_columns()];
	for (name, direction) in monotone_constraints.iter() {
		let column_index = frame
			.columns()
			.iter()
			.position(|column| &column.name == name)
			.ok_or_else(|| ConfigError::UnknownMonotoneColumn(name.clone()))?;
		if !matches!(*direction, -1..=1) {
			return Err(ConfigError::InvalidMonotoneDirection {
				column: name.clone(),
				direction: *direction,
			});
		}
		if *direction != 0 && frame.column(column_index).is_enum() {
			return Err(ConfigError::MonotoneOnCategorical(name.clone()));
		}
		directions[column_index] = *direction;
	}
	Ok(directions.into())
}

/**
Which columns may be used together on a path from the root.

Each declared group lists columns that may interact. A column may appear in several groups, in which case it may interact with the union of them. Columns that appear in no group may only interact with themselves.
*/
#[derive(Clone, Debug)]
pub struct GlobalInteractionConstraints {
	allowed: Vec<Arc<BTreeSet<usize>>>,
}

impl GlobalInteractionConstraints {
	/// Resolve groups of column names. A name matches a column of the same name, or every column whose name starts with the name followed by a `.`, as produced by one hot encoding.
	pub fn new(
		groups: &[Vec<String>],
		column_names: &[&str],
	) -> Result<GlobalInteractionConstraints, ConfigError> {
		let mut allowed: Vec<BTreeSet<usize>> = (0..column_names.len())
			.map(|column_index| std::iter::once(column_index).collect())
			.collect();
		for group in groups {
			let mut seen_names = BTreeSet::new();
			let mut group_columns = BTreeSet::new();
			for name in group {
				if !seen_names.insert(name.as_str()) {
					return Err(ConfigError::DuplicateInteractionColumn(name.clone()));
				}
				let columns = expand_column_name(name, column_names);
				if columns.is_empty() {
					return Err(ConfigError::UnknownInteractionColumn(name.clone()));
				}
				group_columns.extend(columns);
			}
			for column_index in group_columns.iter() {
				allowed[*column_index].extend(group_columns.iter().copied());
			}
		}
		Ok(GlobalInteractionConstraints {
			allowed: allowed.into_iter().map(Arc::new).collect(),
		})
	}

	pub fn allowed_with(&self, column_index: usize) -> &Arc<BTreeSet<usize>> {
		&self.allowed[column_index]
	}
}

fn expand_column_name(name: &str, column_names: &[&str]) -> Vec<usize> {
	let prefix = format!("{}.", name);
	column_names
		.iter()
		.enumerate()
		.filter(|(_, column_name)| **column_name == name || column_name.starts_with(&prefix))
		.map(|(column_index, _)| column_index)
		.collect()
}

/// The columns allowed below a node. The root allows every column.
#[derive(Clone, Debug, Default)]
pub struct BranchInteractionConstraints {
	allowed: Option<Arc<BTreeSet<usize>>>,
}

impl BranchInteractionConstraints {
	pub fn root() -> BranchInteractionConstraints {
		BranchInteractionConstraints { allowed: None }
	}

	pub fn is_allowed(&self, column_index: usize) -> bool {
		self.allowed
			.as_ref()
			.map(|allowed| allowed.contains(&column_index))
			.unwrap_or(true)
	}

	/// The constraints of a child of a node split on `column_index`.
	pub fn next_level(
		&self,
		global: &GlobalInteractionConstraints,
		column_index: usize,
	) -> BranchInteractionConstraints {
		let global_allowed = global.allowed_with(column_index);
		let allowed = match &self.allowed {
			None => global_allowed.clone(),
			Some(allowed) => Arc::new(allowed.intersection(global_allowed).copied().collect()),
		};
		BranchInteractionConstraints {
			allowed: Some(allowed),
		}
	}

	pub fn allowed_columns(&self) -> Option<&BTreeSet<usize>> {
		self.allowed.as_deref()
	}
}

#[cfg(test)]
fn test_split(column_index: usize, tree_pred_left: f64, tree_pred_right: f64) -> Split {
	use crate::split::{NaSplitDirection, SplitKind};
	Split {
		column_index,
		bin: 1,
		kind: SplitKind::LessThan,
		na_direction: NaSplitDirection::Left,
		se_before: 1.0,
		se_left: 0.0,
		se_right: 0.0,
		n_left: 1.0,
		n_right: 1.0,
		pred_left: tree_pred_left,
		pred_right: tree_pred_right,
		tree_pred_left,
		tree_pred_right,
	}
}

#[test]
fn test_monotone_next_level() {
	let constraints = Constraints::new(vec![1, -1, 0].into());
	let increasing = test_split(0, 1.0, 3.0);
	let left = constraints.next_level(&increasing, Direction::Left);
	let right = constraints.next_level(&increasing, Direction::Right);
	assert_eq!((left.min, left.max), (None, Some(2.0)));
	assert_eq!((right.min, right.max), (Some(2.0), None));
	let decreasing = test_split(1, 3.0, 1.0);
	let left = right.next_level(&decreasing, Direction::Left);
	assert_eq!((left.min, left.max), (Some(2.0), None));
	let right = constraints.next_level(&decreasing, Direction::Right);
	assert_eq!((right.min, right.max), (None, Some(2.0)));
	let unconstrained = constraints.next_level(&test_split(2, 0.0, 5.0), Direction::Left);
	assert_eq!((unconstrained.min, unconstrained.max), (None, None));
}

#[test]
fn test_interaction_containment() {
	let column_names = ["a", "b", "c.x", "c.y", "d"];
	let groups = vec![
		vec!["a".to_owned(), "c".to_owned()],
		vec!["a".to_owned(), "b".to_owned()],
	];
	let global = GlobalInteractionConstraints::new(&groups, &column_names).unwrap();
	insta::assert_debug_snapshot!(global.allowed_with(0), @r###"
 {
     0,
     1,
     2,
     3,
 }
 "###);
	let root = BranchInteractionConstraints::root();
	assert!(root.is_allowed(4));
	let below_c = root.next_level(&global, 2);
	assert!(below_c.is_allowed(0));
	assert!(!below_c.is_allowed(1));
	assert!(!below_c.is_allowed(4));
	let below_c_then_a = below_c.next_level(&global, 0);
	assert_eq!(
		below_c_then_a.allowed_columns().unwrap().iter().copied().collect::<Vec<_>>(),
		vec![0, 2, 3]
	);
	let below_d = root.next_level(&global, 4);
	assert_eq!(
		below_d.allowed_columns().unwrap().iter().copied().collect::<Vec<_>>(),
		vec![4]
	);
}

#[test]
fn test_constraint_errors() {
	let column_names = ["a", "b"];
	assert_eq!(
		GlobalInteractionConstraints::new(&[vec!["z".to_owned()]], &column_names).unwrap_err(),
		ConfigError::UnknownInteractionColumn("z".to_owned())
	);
	assert_eq!(
		GlobalInteractionConstraints::new(&[vec!["a".to_owned(), "a".to_owned()]], &column_names)
			.unwrap_err(),
		ConfigError::DuplicateInteractionColumn("a".to_owned())
	);
	use crate::frame::Column;
	let frame = Frame::new(vec![
		Column::number("x", vec![0.0, 1.0]),
		Column::enumeration("e", vec!["p".to_owned(), "q".to_owned()], &[Some(0), Some(1)]),
	]);
	let resolve = |name: &str, direction: i8| {
		let mut constraints = BTreeMap::new();
		constraints.insert(name.to_owned(), direction);
		resolve_monotone_constraints(&constraints, &frame)
	};
	assert_eq!(&*resolve("x", -1).unwrap(), &[-1, 0]);
	assert_eq!(
		resolve("e", 1).unwrap_err(),
		ConfigError::MonotoneOnCategorical("e".to_owned())
	);
	assert_eq!(
		resolve("y", 1).unwrap_err(),
		ConfigError::UnknownMonotoneColumn("y".to_owned())
	);
	assert_eq!(
		resolve("x", 2).unwrap_err(),
		ConfigError::InvalidMonotoneDirection {
			column: "x".to_owned(),
			direction: 2
		}
	);
}
