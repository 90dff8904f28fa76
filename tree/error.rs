use thiserror::Error;

/// Errors that abort a training run or reject a compressed tree.
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("invalid histogram bounds for column {column_index}: min {min}, exclusive max {max_exclusive}, {n_bins} bins")]
	HistogramBounds {
		column_index: usize,
		min: f64,
		max_exclusive: f64,
		n_bins: usize,
	},
	#[error("{name} has {actual} entries but the frame has {expected} rows")]
	LengthMismatch {
		name: &'static str,
		expected: usize,
		actual: usize,
	},
	#[error("label {value} at row {row} is not a class index below {n_classes}")]
	InvalidLabel { row: usize, value: f32, n_classes: usize },
	#[error("weight {value} at row {row} is negative or not finite")]
	InvalidWeight { row: usize, value: f32 },
	#[error("node {node_id} is out of range for a tree with {n_nodes} nodes")]
	NodeOutOfRange { node_id: usize, n_nodes: usize },
	#[error("node {0} is not in the state this operation requires")]
	UnfinishedNode(usize),
	#[error("compressed size mismatch at node {node_id}: computed {expected} bytes, wrote {actual}")]
	SizeMismatch {
		node_id: usize,
		expected: usize,
		actual: usize,
	},
	#[error("column {0} cannot be stored in a compressed tree")]
	ColumnOutOfRange(usize),
	#[error("the subtree at node {0} is too large to compress")]
	SubtreeTooLarge(usize),
	#[error("failed to encode compressed tree")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("failed to decode compressed tree")]
	Decode(#[from] rmp_serde::decode::Error),
	#[error("malformed compressed tree at byte {0}")]
	Malformed(usize),
	#[error("unsupported compressed tree format version {0}")]
	UnsupportedVersion(u8),
	#[error("training was cancelled")]
	Cancelled,
}

/// Errors found while validating training options against the columns of a frame. Each names the offending column or value.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
	#[error("interaction constraint column \"{0}\" was not found in the training columns")]
	UnknownInteractionColumn(String),
	#[error("column \"{0}\" is declared more than once in the interaction constraints")]
	DuplicateInteractionColumn(String),
	#[error("monotone constraint column \"{0}\" was not found in the training columns")]
	UnknownMonotoneColumn(String),
	#[error("monotone constraint on column \"{0}\" is not allowed because the column is categorical")]
	MonotoneOnCategorical(String),
	#[error("monotone constraint on column \"{column}\" has direction {direction}, expected -1, 0 or 1")]
	InvalidMonotoneDirection { column: String, direction: i8 },
	#[error("{name} must be at least 2, got {value}")]
	InvalidBinCount { name: &'static str, value: usize },
	#[error("{name} must be in (0, 1], got {value}")]
	InvalidRate { name: &'static str, value: f32 },
	#[error("{name} must be positive, got {value}")]
	InvalidCount { name: &'static str, value: usize },
	#[error("a classifier needs at least 2 classes, got {0}")]
	InvalidClassCount(usize),
}
