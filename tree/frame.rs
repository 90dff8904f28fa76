use crate::error::Error;
use canopy_util::pzip;
use num_traits::ToPrimitive;
use rayon::prelude::*;

/// The type of a training column. Enum columns store their level index as the value, and every column stores missing values as NaN.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnType {
	Number,
	Enum { levels: Vec<String> },
}

#[derive(Clone, Debug)]
pub struct Column {
	pub name: String,
	pub column_type: ColumnType,
	pub data: Vec<f32>,
}

impl Column {
	pub fn number(name: impl Into<String>, data: Vec<f32>) -> Column {
		Column {
			name: name.into(),
			column_type: ColumnType::Number,
			data,
		}
	}

	/// Create an enum column from level indexes, where `None` is a missing value.
	pub fn enumeration(name: impl Into<String>, levels: Vec<String>, codes: &[Option<u32>]) -> Column {
		let data = codes
			.iter()
			.map(|code| code.map(|code| code.to_f32().unwrap()).unwrap_or(f32::NAN))
			.collect();
		Column {
			name: name.into(),
			column_type: ColumnType::Enum { levels },
			data,
		}
	}

	pub fn is_enum(&self) -> bool {
		matches!(self.column_type, ColumnType::Enum { .. })
	}
}

/// Summary statistics over the finite values of a column, computed once when the frame is created.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColumnStats {
	pub min: f64,
	pub max: f64,
	pub n_missing: usize,
	pub is_int: bool,
}

impl ColumnStats {
	fn compute(data: &[f32]) -> ColumnStats {
		data.par_iter()
			.fold(ColumnStats::empty, |mut stats, value| {
				if value.is_nan() {
					stats.n_missing += 1;
				} else if value.is_finite() {
					let value = value.to_f64().unwrap();
					stats.min = stats.min.min(value);
					stats.max = stats.max.max(value);
					stats.is_int &= value.fract() == 0.0;
				}
				stats
			})
			.reduce(ColumnStats::empty, |a, b| ColumnStats {
				min: a.min.min(b.min),
				max: a.max.max(b.max),
				n_missing: a.n_missing + b.n_missing,
				is_int: a.is_int && b.is_int,
			})
	}

	fn empty() -> ColumnStats {
		ColumnStats {
			min: f64::INFINITY,
			max: f64::NEG_INFINITY,
			n_missing: 0,
			is_int: true,
		}
	}

	/// A column with no finite values, or a single distinct finite value, cannot be split.
	pub fn is_constant(&self) -> bool {
		!(self.min < self.max)
	}
}

/// The training features. Rows are processed in fixed size partitions, which are the unit of parallel work in the histogram scheduler.
#[derive(Clone, Debug)]
pub struct Frame {
	columns: Vec<Column>,
	stats: Vec<ColumnStats>,
	n_rows: usize,
}

impl Frame {
	/// Create a frame. All columns must have the same length.
	pub fn new(columns: Vec<Column>) -> Frame {
		let n_rows = columns.first().map(|column| column.data.len()).unwrap_or(0);
		assert!(
			columns.iter().all(|column| column.data.len() == n_rows),
			"all columns must have the same length"
		);
		let stats = columns
			.par_iter()
			.map(|column| ColumnStats::compute(&column.data))
			.collect();
		Frame {
			columns,
			stats,
			n_rows,
		}
	}

	pub fn n_rows(&self) -> usize {
		self.n_rows
	}

	pub fn n_columns(&self) -> usize {
		self.columns.len()
	}

	pub fn columns(&self) -> &[Column] {
		&self.columns
	}

	pub fn column(&self, column_index: usize) -> &Column {
		&self.columns[column_index]
	}

	pub fn stats(&self, column_index: usize) -> &ColumnStats {
		&self.stats[column_index]
	}

	pub fn column_names(&self) -> Vec<&str> {
		self.columns.iter().map(|column| column.name.as_str()).collect()
	}
}

/// The per-row inputs of a single tree: the frame, the response to fit, and optional row weights. Weights default to 1.
#[derive(Clone, Copy)]
pub struct TreeInput<'a> {
	pub frame: &'a Frame,
	pub response: &'a [f32],
	pub weights: Option<&'a [f32]>,
}

impl<'a> TreeInput<'a> {
	/// Check that the response and weights have one entry per row of the frame, and that every weight is finite and not negative.
	pub fn validate(&self) -> Result<(), Error> {
		let n_rows = self.frame.n_rows();
		if self.response.len() != n_rows {
			return Err(Error::LengthMismatch {
				name: "labels",
				expected: n_rows,
				actual: self.response.len(),
			});
		}
		if let Some(weights) = self.weights {
			if weights.len() != n_rows {
				return Err(Error::LengthMismatch {
					name: "weights",
					expected: n_rows,
					actual: weights.len(),
				});
			}
			if let Some((row, value)) = weights
				.iter()
				.enumerate()
				.find(|(_, weight)| !weight.is_finite() || **weight < 0.0)
			{
				return Err(Error::InvalidWeight { row, value: *value });
			}
		}
		Ok(())
	}

	pub fn weight(&self, row_index: usize) -> f32 {
		self.weights.map(|weights| weights[row_index]).unwrap_or(1.0)
	}

	/// Compute the weighted mean of the response over the rows selected by `include`.
	pub fn weighted_mean(&self, include: impl Fn(usize) -> bool + Sync) -> f64 {
		let (sum_weights, sum) = pzip!(0..self.response.len(), self.response)
			.filter(|(row_index, response)| include(*row_index) && !response.is_nan())
			.map(|(row_index, response)| {
				let weight = self.weight(row_index).to_f64().unwrap();
				(weight, weight * response.to_f64().unwrap())
			})
			.reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));
		if sum_weights > 0.0 {
			sum / sum_weights
		} else {
			0.0
		}
	}
}

#[test]
fn test_column_stats() {
	let frame = Frame::new(vec![
		Column::number("a", vec![1.0, f32::NAN, 3.0, -2.0]),
		Column::number("b", vec![0.5, 0.5, 0.5, 0.5]),
		Column::enumeration(
			"c",
			vec!["x".to_owned(), "y".to_owned()],
			&[Some(0), Some(1), None, Some(1)],
		),
	]);
	insta::assert_debug_snapshot!(frame.stats(0), @r###"
 ColumnStats {
     min: -2.0,
     max: 3.0,
     n_missing: 1,
     is_int: true,
 }
 "###);
	assert!(!frame.stats(1).is_int);
	assert!(frame.stats(1).is_constant());
	assert_eq!(frame.stats(2).n_missing, 1);
	assert!(frame.column(2).is_enum());
}

#[test]
fn test_validate_input() {
	let frame = Frame::new(vec![Column::number("a", vec![0.0, 1.0, 2.0])]);
	let input = |response: &'static [f32], weights: Option<&'static [f32]>| TreeInput {
		frame: &frame,
		response,
		weights,
	};
	assert!(input(&[0.0, 1.0, f32::NAN], Some(&[1.0, 0.0, 2.0])).validate().is_ok());
	assert!(matches!(
		input(&[0.0, 1.0], None).validate(),
		Err(Error::LengthMismatch {
			name: "labels",
			expected: 3,
			actual: 2,
		})
	));
	assert!(matches!(
		input(&[0.0, 1.0, 2.0], Some(&[1.0; 4])).validate(),
		Err(Error::LengthMismatch { name: "weights", .. })
	));
	assert!(matches!(
		input(&[0.0, 1.0, 2.0], Some(&[1.0, -1.0, 1.0])).validate(),
		Err(Error::InvalidWeight { row: 1, .. })
	));
	assert!(matches!(
		input(&[0.0, 1.0, 2.0], Some(&[1.0, 1.0, f32::NAN])).validate(),
		Err(Error::InvalidWeight { row: 2, .. })
	));
}
