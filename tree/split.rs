use crate::{
	bitset::{Bitset, BitsetView},
	histogram::{Histogram, ValueKind},
};
use num_traits::ToPrimitive;

/**
The direction missing values take at a split.

The first four are decided during training. `Left` and `Right` are chosen for splits that never saw a missing value, so that missing values at scoring time still have a place to go. The discriminants are part of the compressed tree format.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NaSplitDirection {
	None = 0,
	NaVsRest = 1,
	NaLeft = 2,
	NaRight = 3,
	Left = 4,
	Right = 5,
}

impl NaSplitDirection {
	pub fn to_u8(self) -> u8 {
		self as u8
	}

	pub fn from_u8(value: u8) -> Option<NaSplitDirection> {
		match value {
			0 => Some(NaSplitDirection::None),
			1 => Some(NaSplitDirection::NaVsRest),
			2 => Some(NaSplitDirection::NaLeft),
			3 => Some(NaSplitDirection::NaRight),
			4 => Some(NaSplitDirection::Left),
			5 => Some(NaSplitDirection::Right),
			_ => None,
		}
	}

	pub fn na_goes_right(self) -> bool {
		!matches!(self, NaSplitDirection::NaLeft | NaSplitDirection::Left)
	}
}

/// The side of a split a row is sent to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
	Left,
	Right,
}

impl Direction {
	pub fn index(self) -> usize {
		match self {
			Direction::Left => 0,
			Direction::Right => 1,
		}
	}
}

/// How a split compares a value. `NotEqual` sends values unequal to the split value left and equal values right. `Bitset` sends the levels in the set right.
#[derive(Clone, Debug, PartialEq)]
pub enum SplitKind {
	LessThan,
	NotEqual,
	Bitset(Bitset),
}

/// The best split found by a histogram. Sums and counts are weighted.
#[derive(Clone, Debug)]
pub struct Split {
	pub column_index: usize,
	/// For range splits this is the first bin on the right. For group splits it is the position in the sorted bin order.
	pub bin: usize,
	pub kind: SplitKind,
	pub na_direction: NaSplitDirection,
	/// The squared error of the node without a split.
	pub se_before: f64,
	pub se_left: f64,
	pub se_right: f64,
	pub n_left: f64,
	pub n_right: f64,
	/// The mean response on each side.
	pub pred_left: f64,
	pub pred_right: f64,
	/// The prediction each side contributes to the tree, which respects any monotone bounds.
	pub tree_pred_left: f64,
	pub tree_pred_right: f64,
}

/// The comparison a decided node applies to a row, independent of whether the tree is compressed.
#[derive(Clone, Copy, Debug)]
pub enum Condition<'a> {
	LessThan(f32),
	NotEqual(f32),
	Group(BitsetView<'a>),
	NaVsRest,
}

impl Split {
	pub fn se(&self) -> f64 {
		self.se_left + self.se_right
	}

	pub fn improvement(&self) -> f64 {
		self.se_before - self.se()
	}

	pub fn tree_prediction(&self, direction: Direction) -> f64 {
		match direction {
			Direction::Left => self.tree_pred_left,
			Direction::Right => self.tree_pred_right,
		}
	}

	pub fn n_rows(&self, direction: Direction) -> f64 {
		match direction {
			Direction::Left => self.n_left,
			Direction::Right => self.n_right,
		}
	}

	pub fn se_side(&self, direction: Direction) -> f64 {
		match direction {
			Direction::Left => self.se_left,
			Direction::Right => self.se_right,
		}
	}

	/// A numeric split compares the value against a single float.
	pub fn is_numeric(&self) -> bool {
		self.na_direction != NaSplitDirection::NaVsRest && !matches!(self.kind, SplitKind::Bitset(_))
	}

	/**
	Compute the value a numeric split compares against.

	Rather than using the bin boundary, which round-off can push slightly into a neighboring bin, this finds the nearest non-empty bins on each side and splits halfway between them. Integer columns round to the integers on either side. Returns `None` if the split has to be abandoned because the float split value would misroute training rows.
	*/
	pub fn split_value(&self, histogram: &Histogram, check_float_splits: bool) -> Option<f32> {
		let layout = histogram.layout();
		match self.kind {
			SplitKind::NotEqual => return layout.bin_at(self.bin).to_f32(),
			SplitKind::Bitset(_) => return None,
			SplitKind::LessThan => {}
		}
		if self.na_direction == NaSplitDirection::NaVsRest {
			return None;
		}
		let n_bins = layout.n_bins;
		// Find the highest non-empty bin below the split.
		let mut below = self.bin as isize - 1;
		while below >= 0 && histogram.weight(below as usize) == 0.0 {
			below -= 1;
		}
		// Find the lowest non-empty bin at or above the split.
		let mut above = self.bin;
		while above < n_bins && histogram.weight(above) == 0.0 {
			above += 1;
		}
		let mut lo = layout.bin_at((below + 1) as usize);
		let mut hi = layout.bin_at(above);
		if layout.value_kind != ValueKind::Real {
			if layout.step == 1.0 && layout.split_points.is_none() {
				lo -= 1.0;
			} else {
				lo = lo.floor();
				hi = hi.ceil();
			}
		}
		let split_at = ((lo + hi) / 2.0).to_f32()?;
		if check_float_splits {
			let split_at_wide = f64::from(split_at);
			if lo != hi && (lo > split_at_wide || hi < split_at_wide) {
				log::trace!(
					"abandoning split on column {}: {} does not separate {} and {}",
					self.column_index,
					split_at,
					lo,
					hi
				);
				return None;
			}
		}
		Some(split_at)
	}
}

/// Decide which side of a split a value goes to.
pub fn route(condition: Condition, na_direction: NaSplitDirection, value: f32) -> Direction {
	let mut is_na = value.is_nan();
	let mut goes_right = false;
	if !is_na {
		match condition {
			Condition::NaVsRest => goes_right = false,
			Condition::LessThan(split_value) => goes_right = value >= split_value,
			Condition::NotEqual(split_value) => goes_right = value == split_value,
			Condition::Group(bitset) => match value.to_i64() {
				Some(level) if bitset.is_in_range(level) => goes_right = bitset.contains(level),
				_ => is_na = true,
			},
		}
	}
	if is_na {
		goes_right = na_direction.na_goes_right();
	}
	if goes_right {
		Direction::Right
	} else {
		Direction::Left
	}
}

#[test]
fn test_route_less_than() {
	let condition = Condition::LessThan(2.5);
	assert_eq!(route(condition, NaSplitDirection::Left, 1.0), Direction::Left);
	assert_eq!(route(condition, NaSplitDirection::Left, 2.5), Direction::Right);
	assert_eq!(route(condition, NaSplitDirection::Left, f32::NAN), Direction::Left);
	assert_eq!(route(condition, NaSplitDirection::NaRight, f32::NAN), Direction::Right);
	assert_eq!(route(condition, NaSplitDirection::None, f32::NAN), Direction::Right);
}

#[test]
fn test_route_na_vs_rest() {
	let condition = Condition::NaVsRest;
	assert_eq!(route(condition, NaSplitDirection::NaVsRest, 100.0), Direction::Left);
	assert_eq!(route(condition, NaSplitDirection::NaVsRest, f32::NAN), Direction::Right);
}

#[test]
fn test_route_group() {
	let mut bitset = Bitset::new(4, 0);
	bitset.set(1);
	bitset.set(3);
	let condition = Condition::Group(bitset.view());
	assert_eq!(route(condition, NaSplitDirection::Left, 1.0), Direction::Right);
	assert_eq!(route(condition, NaSplitDirection::Left, 2.0), Direction::Left);
	// Levels outside the bitset behave like missing values.
	assert_eq!(route(condition, NaSplitDirection::Right, 40.0), Direction::Right);
	assert_eq!(route(condition, NaSplitDirection::Left, 40.0), Direction::Left);
}

#[test]
fn test_na_split_direction_codes() {
	for code in 0..6 {
		let direction = NaSplitDirection::from_u8(code).unwrap();
		assert_eq!(direction.to_u8(), code);
	}
	assert_eq!(NaSplitDirection::from_u8(6), None);
}
