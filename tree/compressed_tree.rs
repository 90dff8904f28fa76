use crate::{
	bitset::{n_bytes_for_bits, BitsetView, SMALL_BITSET_BITS},
	error::Error,
	split::{route, Condition, Direction, NaSplitDirection, Split, SplitKind},
	tree::{DecidedNode, Node, Tree},
};
use num_traits::ToPrimitive;

/// The version written by [`CompressedTree::to_bytes`]. Bytes with any other version are rejected.
pub const FORMAT_VERSION: u8 = 1;

/// Trees read by [`CompressedTree::from_bytes`] may not be deeper than this.
pub const MAX_DEPTH: usize = 1024;

/// The column id of a tree that is a single leaf.
const STUMP_COLUMN: u16 = u16::MAX;

const SKIP_WIDTH_MASK: u8 = 0b0000_0011;
const KIND_MASK: u8 = 0b0000_1100;
const KIND_LESS_THAN: u8 = 0b0000_0000;
const KIND_NOT_EQUAL: u8 = 0b0000_0100;
const KIND_SMALL_BITSET: u8 = 0b0000_1000;
const KIND_LARGE_BITSET: u8 = 0b0000_1100;
const LEFT_LEAF: u8 = 0b0011_0000;
const RIGHT_LEAF: u8 = 0b1100_0000;

/// Header byte, column id, and NA direction.
const NODE_PREFIX_SIZE: usize = 4;
const LEAF_SIZE: usize = 4;
const SMALL_BITSET_SIZE: usize = 4;

/**
A finished tree packed into bytes for scoring.

Each decided node is written as a header byte, a little endian `u16` column id, a `u8` NA direction, and the split payload: an `f32` split value, a 4 byte bitset, or a `u16` offset and `u32` bit count followed by the bits of a larger bitset. NA-vs-rest splits have no payload. If the left child is not a leaf, the size of the left subtree follows in one to four bytes, so scoring can jump straight to the right subtree. The left subtree and then the right subtree come next. A leaf is a bare `f32`.

The header byte holds the width of the skip minus one in bits 0-1, the kind of split in bits 2-3, and whether the left and right children are leaves in bits 4-5 and 6-7. A tree that is a single leaf is written as `0x00`, then column id `0xFFFF`, then the `f32` prediction.
*/
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompressedTree {
	bytes: Vec<u8>,
	tree_id: usize,
	class_id: usize,
	n_classes: usize,
	seed: u64,
}

/// A child of a compressed node: either a leaf value or the position of another node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EncodedChild {
	Leaf(f32),
	Node(usize),
}

/// A decided node read out of a compressed tree.
#[derive(Clone, Copy, Debug)]
pub struct EncodedNode<'a> {
	pub position: usize,
	pub column_index: usize,
	pub na_direction: NaSplitDirection,
	pub condition: Condition<'a>,
	pub children: [EncodedChild; 2],
	/// Where each child starts.
	pub child_positions: [usize; 2],
}

impl CompressedTree {
	/// Pack a finished tree. Every decided node must have a split and two children.
	pub fn compress(tree: &Tree, tree_id: usize, class_id: usize, n_classes: usize) -> Result<CompressedTree, Error> {
		let bytes = match tree.node(0)? {
			Node::Leaf(leaf) => {
				let mut bytes = Vec::with_capacity(3 + LEAF_SIZE);
				bytes.push(0);
				bytes.extend_from_slice(&STUMP_COLUMN.to_le_bytes());
				bytes.extend_from_slice(&leaf.prediction.to_le_bytes());
				bytes
			}
			_ => {
				let mut writer = Writer {
					tree,
					sizes: vec![None; tree.len()],
					bytes: Vec::new(),
				};
				let size = writer.size(0)?;
				writer.bytes.reserve_exact(size);
				writer.write(0)?;
				writer.bytes
			}
		};
		Ok(CompressedTree {
			bytes,
			tree_id,
			class_id,
			n_classes,
			seed: tree.seed(),
		})
	}

	pub fn bytes(&self) -> &[u8] {
		&self.bytes
	}

	pub fn tree_id(&self) -> usize {
		self.tree_id
	}

	pub fn class_id(&self) -> usize {
		self.class_id
	}

	pub fn n_classes(&self) -> usize {
		self.n_classes
	}

	pub fn seed(&self) -> u64 {
		self.seed
	}

	/// Serialize the tree. The first byte is the format version and the rest is the tree in MessagePack.
	pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
		let mut bytes = Vec::with_capacity(32 + self.bytes.len());
		bytes.push(FORMAT_VERSION);
		rmp_serde::encode::write_named(&mut bytes, self)?;
		Ok(bytes)
	}

	/// Read a tree written by [`CompressedTree::to_bytes`], checking that every node is well formed. Positions in [`Error::Malformed`] are offsets into [`CompressedTree::bytes`].
	pub fn from_bytes(bytes: &[u8]) -> Result<CompressedTree, Error> {
		let version = *bytes.first().ok_or(Error::Malformed(0))?;
		if version != FORMAT_VERSION {
			return Err(Error::UnsupportedVersion(version));
		}
		let tree: CompressedTree = rmp_serde::from_slice(&bytes[1..])?;
		tree.validate()?;
		Ok(tree)
	}

	/// The root of the tree, which is a leaf for a tree that never split.
	pub fn root(&self) -> Result<EncodedChild, Error> {
		let mut cursor = Cursor::new(&self.bytes, 0);
		cursor.read_u8()?;
		if cursor.read_u16()? == STUMP_COLUMN {
			Ok(EncodedChild::Leaf(cursor.read_f32()?))
		} else {
			Ok(EncodedChild::Node(0))
		}
	}

	/// Read the node at `position`.
	pub fn node(&self, position: usize) -> Result<EncodedNode, Error> {
		read_node(&self.bytes, position)
	}

	/// Make a prediction for a row without allocating. Columns past the end of `row` read as missing.
	pub fn score(&self, row: &[f32]) -> Result<f32, Error> {
		let mut child = self.root()?;
		loop {
			match child {
				EncodedChild::Leaf(value) => return Ok(value),
				EncodedChild::Node(position) => {
					let node = self.node(position)?;
					let direction = node.direction(row);
					child = node.children[direction.index()];
				}
			}
		}
	}

	/// The sequence of `L` and `R` turns a row takes from the root to its leaf.
	pub fn decision_path(&self, row: &[f32]) -> Result<String, Error> {
		let mut path = String::new();
		let mut child = self.root()?;
		while let EncodedChild::Node(position) = child {
			let node = self.node(position)?;
			let direction = node.direction(row);
			path.push(match direction {
				Direction::Left => 'L',
				Direction::Right => 'R',
			});
			child = node.children[direction.index()];
		}
		Ok(path)
	}

	/// Walk the nodes in the order they are written, checking that each one starts where the one before it ended.
	fn validate(&self) -> Result<(), Error> {
		let mut end = 0;
		let mut stack = vec![(self.root()?, 0, 0)];
		while let Some((child, position, depth)) = stack.pop() {
			if position != end || depth > MAX_DEPTH {
				return Err(Error::Malformed(position));
			}
			match child {
				EncodedChild::Leaf(_) if depth == 0 => end = 3 + LEAF_SIZE,
				EncodedChild::Leaf(_) => end = position + LEAF_SIZE,
				EncodedChild::Node(_) => {
					let node = self.node(position)?;
					let [left_position, right_position] = node.child_positions;
					end = left_position;
					stack.push((node.children[1], right_position, depth + 1));
					stack.push((node.children[0], left_position, depth + 1));
				}
			}
		}
		if end != self.bytes.len() {
			return Err(Error::Malformed(end));
		}
		Ok(())
	}
}

impl<'a> EncodedNode<'a> {
	/// The side a row goes to.
	pub fn direction(&self, row: &[f32]) -> Direction {
		let value = row.get(self.column_index).copied().unwrap_or(f32::NAN);
		route(self.condition, self.na_direction, value)
	}
}

/// Parse the decided node at `position`, checking every read against the end of `bytes`.
pub fn read_node(bytes: &[u8], position: usize) -> Result<EncodedNode, Error> {
	let mut cursor = Cursor::new(bytes, position);
	let header = cursor.read_u8()?;
	let column = cursor.read_u16()?;
	if column == STUMP_COLUMN {
		return Err(Error::Malformed(position));
	}
	let na_position = cursor.position;
	let na_direction = NaSplitDirection::from_u8(cursor.read_u8()?).ok_or(Error::Malformed(na_position))?;
	let condition = if na_direction == NaSplitDirection::NaVsRest {
		Condition::NaVsRest
	} else {
		match header & KIND_MASK {
			KIND_LESS_THAN => Condition::LessThan(cursor.read_f32()?),
			KIND_NOT_EQUAL => Condition::NotEqual(cursor.read_f32()?),
			KIND_SMALL_BITSET => Condition::Group(BitsetView {
				offset: 0,
				n_bits: SMALL_BITSET_BITS,
				bytes: cursor.read_bytes(SMALL_BITSET_SIZE)?,
			}),
			_ => {
				let offset = u32::from(cursor.read_u16()?);
				let n_bits = cursor.read_u32()?;
				let bytes = cursor.read_bytes(n_bytes_for_bits(n_bits))?;
				Condition::Group(BitsetView { offset, n_bits, bytes })
			}
		}
	};
	let left_position;
	let (left, right_position) = if header & LEFT_LEAF == LEFT_LEAF {
		left_position = cursor.position;
		(EncodedChild::Leaf(cursor.read_f32()?), cursor.position)
	} else {
		let width = usize::from(header & SKIP_WIDTH_MASK) + 1;
		let skip = cursor.read_uint(width)?;
		left_position = cursor.position;
		(EncodedChild::Node(left_position), left_position + skip)
	};
	let right = if header & RIGHT_LEAF == RIGHT_LEAF {
		EncodedChild::Leaf(Cursor::new(bytes, right_position).read_f32()?)
	} else {
		EncodedChild::Node(right_position)
	};
	Ok(EncodedNode {
		position,
		column_index: usize::from(column),
		na_direction,
		condition,
		children: [left, right],
		child_positions: [left_position, right_position],
	})
}

/// The number of bytes used to store the size of a left subtree.
fn skip_width(size: usize) -> usize {
	if size < 1 << 8 {
		1
	} else if size < 65535 {
		2
	} else if size < 1 << 24 {
		3
	} else {
		4
	}
}

fn payload_size(split: &Split) -> usize {
	if split.na_direction == NaSplitDirection::NaVsRest {
		return 0;
	}
	match &split.kind {
		SplitKind::LessThan | SplitKind::NotEqual => 4,
		SplitKind::Bitset(bitset) if bitset.is_small() => SMALL_BITSET_SIZE,
		SplitKind::Bitset(bitset) => 2 + 4 + bitset.bytes().len(),
	}
}

struct Writer<'a> {
	tree: &'a Tree,
	/// The encoded size of each subtree, computed once.
	sizes: Vec<Option<usize>>,
	bytes: Vec<u8>,
}

impl<'a> Writer<'a> {
	fn decided(&self, node_id: usize) -> Result<(&'a DecidedNode, &'a Split, [usize; 2]), Error> {
		let node = self.tree.decided(node_id)?;
		let split = node.split.as_ref().ok_or(Error::UnfinishedNode(node_id))?;
		match node.children {
			[Some(left), Some(right)] => Ok((node, split, [left, right])),
			_ => Err(Error::UnfinishedNode(node_id)),
		}
	}

	fn is_leaf(&self, node_id: usize) -> Result<bool, Error> {
		Ok(matches!(self.tree.node(node_id)?, Node::Leaf(_)))
	}

	fn size(&mut self, node_id: usize) -> Result<usize, Error> {
		if let Some(size) = self.sizes.get(node_id).copied().flatten() {
			return Ok(size);
		}
		let size = if self.is_leaf(node_id)? {
			LEAF_SIZE
		} else {
			let (_, split, [left, right]) = self.decided(node_id)?;
			let left_size = self.size(left)?;
			let skip_size = if self.is_leaf(left)? { 0 } else { skip_width(left_size) };
			NODE_PREFIX_SIZE + payload_size(split) + skip_size + left_size + self.size(right)?
		};
		self.sizes[node_id] = Some(size);
		Ok(size)
	}

	fn write(&mut self, node_id: usize) -> Result<(), Error> {
		let start = self.bytes.len();
		let expected = self.size(node_id)?;
		if let Node::Leaf(leaf) = self.tree.node(node_id)? {
			self.bytes.extend_from_slice(&leaf.prediction.to_le_bytes());
		} else {
			let (node, split, [left, right]) = self.decided(node_id)?;
			let left_is_leaf = self.is_leaf(left)?;
			let right_is_leaf = self.is_leaf(right)?;
			let left_size = self.size(left)?;
			let width = skip_width(left_size);
			let is_na_vs_rest = split.na_direction == NaSplitDirection::NaVsRest;
			let mut header = match &split.kind {
				_ if is_na_vs_rest => KIND_LESS_THAN,
				SplitKind::LessThan => KIND_LESS_THAN,
				SplitKind::NotEqual => KIND_NOT_EQUAL,
				SplitKind::Bitset(bitset) if bitset.is_small() => KIND_SMALL_BITSET,
				SplitKind::Bitset(_) => KIND_LARGE_BITSET,
			};
			if left_is_leaf {
				header |= LEFT_LEAF;
			} else {
				header |= (width - 1).to_u8().unwrap();
			}
			if right_is_leaf {
				header |= RIGHT_LEAF;
			}
			let column = split
				.column_index
				.to_u16()
				.filter(|column| *column != STUMP_COLUMN)
				.ok_or(Error::ColumnOutOfRange(split.column_index))?;
			self.bytes.push(header);
			self.bytes.extend_from_slice(&column.to_le_bytes());
			self.bytes.push(split.na_direction.to_u8());
			if !is_na_vs_rest {
				match &split.kind {
					SplitKind::LessThan | SplitKind::NotEqual => {
						let split_value = node.split_value.ok_or(Error::UnfinishedNode(node_id))?;
						self.bytes.extend_from_slice(&split_value.to_le_bytes());
					}
					SplitKind::Bitset(bitset) if bitset.is_small() => {
						self.bytes.extend_from_slice(bitset.bytes());
					}
					SplitKind::Bitset(bitset) => {
						let offset = bitset
							.offset()
							.to_u16()
							.ok_or(Error::ColumnOutOfRange(split.column_index))?;
						self.bytes.extend_from_slice(&offset.to_le_bytes());
						self.bytes.extend_from_slice(&bitset.n_bits().to_le_bytes());
						self.bytes.extend_from_slice(bitset.bytes());
					}
				}
			}
			if !left_is_leaf {
				let skip = left_size.to_u32().ok_or(Error::SubtreeTooLarge(left))?;
				self.bytes.extend_from_slice(&skip.to_le_bytes()[..width]);
			}
			self.write(left)?;
			self.write(right)?;
		}
		let actual = self.bytes.len() - start;
		if actual != expected {
			return Err(Error::SizeMismatch {
				node_id,
				expected,
				actual,
			});
		}
		Ok(())
	}
}

/// Bounds checked little endian reads.
struct Cursor<'a> {
	bytes: &'a [u8],
	position: usize,
}

impl<'a> Cursor<'a> {
	fn new(bytes: &'a [u8], position: usize) -> Cursor<'a> {
		Cursor { bytes, position }
	}

	fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
		let end = self
			.position
			.checked_add(n)
			.filter(|end| *end <= self.bytes.len())
			.ok_or(Error::Malformed(self.position))?;
		let bytes = &self.bytes[self.position..end];
		self.position = end;
		Ok(bytes)
	}

	fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
		let mut array = [0; N];
		array.copy_from_slice(self.read_bytes(N)?);
		Ok(array)
	}

	fn read_u8(&mut self) -> Result<u8, Error> {
		Ok(self.read_bytes(1)?[0])
	}

	fn read_u16(&mut self) -> Result<u16, Error> {
		Ok(u16::from_le_bytes(self.read_array()?))
	}

	fn read_u32(&mut self) -> Result<u32, Error> {
		Ok(u32::from_le_bytes(self.read_array()?))
	}

	fn read_f32(&mut self) -> Result<f32, Error> {
		Ok(f32::from_le_bytes(self.read_array()?))
	}

	/// Read an unsigned integer stored in `width` bytes.
	fn read_uint(&mut self, width: usize) -> Result<usize, Error> {
		let mut array = [0; 4];
		array[..width].copy_from_slice(self.read_bytes(width)?);
		Ok(u32::from_le_bytes(array).to_usize().unwrap())
	}
}

#[cfg(test)]
pub fn test_split(column_index: usize, kind: SplitKind, na_direction: NaSplitDirection) -> Split {
	Split {
		column_index,
		bin: 1,
		kind,
		na_direction,
		se_before: 2.0,
		se_left: 0.5,
		se_right: 0.5,
		n_left: 10.0,
		n_right: 10.0,
		pred_left: 0.0,
		pred_right: 1.0,
		tree_pred_left: 0.0,
		tree_pred_right: 1.0,
	}
}

/**
A tree with two levels of splits.

```text
x0 < 1.5 (NA right)
	0
	x1 != 3 (NA left)
		10
		20
```
*/
#[cfg(test)]
pub fn test_tree() -> Tree {
	use crate::tree::LeafNode;
	let mut tree = Tree::new(7);
	tree.push(Node::Decided(DecidedNode {
		parent: None,
		split: Some(test_split(0, SplitKind::LessThan, NaSplitDirection::NaRight)),
		split_value: Some(1.5),
		children: [Some(1), Some(2)],
	}));
	tree.push(Node::Leaf(LeafNode {
		parent: Some(0),
		prediction: 0.0,
	}));
	tree.push(Node::Decided(DecidedNode {
		parent: Some(0),
		split: Some(test_split(1, SplitKind::NotEqual, NaSplitDirection::Left)),
		split_value: Some(3.0),
		children: [Some(3), Some(4)],
	}));
	for prediction in [10.0, 20.0].iter().copied() {
		tree.push(Node::Leaf(LeafNode {
			parent: Some(2),
			prediction,
		}));
	}
	tree
}

#[test]
fn test_compress_layout() {
	let compressed = CompressedTree::compress(&test_tree(), 3, 0, 1).unwrap();
	assert_eq!(
		compressed.bytes(),
		&[
			0x30, 0x00, 0x00, 0x03, 0x00, 0x00, 0xc0, 0x3f, // x0 < 1.5, left leaf
			0x00, 0x00, 0x00, 0x00, // 0
			0xf4, 0x01, 0x00, 0x04, 0x00, 0x00, 0x40, 0x40, // x1 != 3, both leaves
			0x00, 0x00, 0x20, 0x41, // 10
			0x00, 0x00, 0xa0, 0x41, // 20
		][..]
	);
	assert_eq!(compressed.seed(), 7);
}

#[test]
fn test_score_matches_tree() {
	let tree = test_tree();
	let compressed = CompressedTree::compress(&tree, 0, 0, 1).unwrap();
	let rows: &[[f32; 2]] = &[
		[1.0, 3.0],
		[2.0, 3.0],
		[2.0, 5.0],
		[f32::NAN, 5.0],
		[2.0, f32::NAN],
	];
	for row in rows {
		assert_eq!(compressed.score(row).unwrap(), tree.predict(row).unwrap());
	}
	assert_eq!(compressed.score(&[2.0, 3.0]).unwrap(), 20.0);
	assert_eq!(compressed.decision_path(&[1.0, 3.0]).unwrap(), "L");
	assert_eq!(compressed.decision_path(&[2.0, 3.0]).unwrap(), "RR");
	assert_eq!(compressed.decision_path(&[2.0, 5.0]).unwrap(), "RL");
}

#[test]
fn test_left_subtree_skip() {
	use crate::tree::LeafNode;
	let mut tree = Tree::new(0);
	tree.push(Node::Decided(DecidedNode {
		parent: None,
		split: Some(test_split(0, SplitKind::LessThan, NaSplitDirection::NaLeft)),
		split_value: Some(1.5),
		children: [Some(1), Some(4)],
	}));
	tree.push(Node::Decided(DecidedNode {
		parent: Some(0),
		split: Some(test_split(1, SplitKind::LessThan, NaSplitDirection::Right)),
		split_value: Some(0.0),
		children: [Some(2), Some(3)],
	}));
	for (parent, prediction) in [(1, -1.0), (1, 1.0), (0, 5.0)].iter().copied() {
		tree.push(Node::Leaf(LeafNode {
			parent: Some(parent),
			prediction,
		}));
	}
	let compressed = CompressedTree::compress(&tree, 0, 0, 1).unwrap();
	assert_eq!(compressed.bytes().len(), 29);
	assert_eq!(compressed.bytes()[0], RIGHT_LEAF);
	assert_eq!(compressed.bytes()[8], 16);
	assert_eq!(compressed.score(&[0.0, -3.0]).unwrap(), -1.0);
	assert_eq!(compressed.score(&[f32::NAN, 3.0]).unwrap(), 1.0);
	assert_eq!(compressed.score(&[4.0, 3.0]).unwrap(), 5.0);
	assert_eq!(compressed.decision_path(&[1.0, f32::NAN]).unwrap(), "LR");
}

#[test]
fn test_group_splits() {
	use crate::{bitset::Bitset, tree::LeafNode};
	let mut small = Bitset::new(4, 0);
	small.set(2);
	let mut large = Bitset::new(40, 0);
	large.set(35);
	let mut tree = Tree::new(0);
	tree.push(Node::Decided(DecidedNode {
		parent: None,
		split: Some(test_split(0, SplitKind::Bitset(small), NaSplitDirection::NaLeft)),
		split_value: None,
		children: [Some(1), Some(2)],
	}));
	tree.push(Node::Decided(DecidedNode {
		parent: Some(0),
		split: Some(test_split(1, SplitKind::Bitset(large), NaSplitDirection::NaRight)),
		split_value: None,
		children: [Some(3), Some(4)],
	}));
	tree.push(Node::Leaf(LeafNode {
		parent: Some(0),
		prediction: 2.0,
	}));
	for prediction in [0.0, 1.0].iter().copied() {
		tree.push(Node::Leaf(LeafNode {
			parent: Some(1),
			prediction,
		}));
	}
	let compressed = CompressedTree::compress(&tree, 0, 0, 1).unwrap();
	// Root: prefix, 4 byte bitset, skip. Left: prefix, offset, bit count, 5 bytes, two leaves. Right leaf.
	assert_eq!(compressed.bytes().len(), 4 + 4 + 1 + (4 + 2 + 4 + 5 + 8) + 4);
	assert_eq!(compressed.score(&[2.0, 0.0]).unwrap(), 2.0);
	assert_eq!(compressed.score(&[0.0, 35.0]).unwrap(), 1.0);
	assert_eq!(compressed.score(&[0.0, 34.0]).unwrap(), 0.0);
	assert_eq!(compressed.score(&[0.0, 99.0]).unwrap(), 1.0);
	let restored = CompressedTree::from_bytes(&compressed.to_bytes().unwrap()).unwrap();
	assert_eq!(restored, compressed);
}

#[test]
fn test_stump() {
	let mut tree = Tree::new(0);
	tree.insert_leaves(1.0, 2.5);
	let compressed = CompressedTree::compress(&tree, 0, 0, 1).unwrap();
	let mut expected = vec![0x00, 0xff, 0xff];
	expected.extend_from_slice(&2.5f32.to_le_bytes());
	assert_eq!(compressed.bytes(), &expected[..]);
	assert_eq!(compressed.score(&[]).unwrap(), 2.5);
	assert_eq!(compressed.decision_path(&[]).unwrap(), "");
	assert_eq!(CompressedTree::from_bytes(&compressed.to_bytes().unwrap()).unwrap(), compressed);
}

#[test]
fn test_from_bytes() {
	let compressed = CompressedTree::compress(&test_tree(), 3, 1, 2).unwrap();
	let bytes = compressed.to_bytes().unwrap();
	assert_eq!(bytes[0], FORMAT_VERSION);
	let restored = CompressedTree::from_bytes(&bytes).unwrap();
	assert_eq!(restored, compressed);
	assert_eq!((restored.tree_id(), restored.class_id(), restored.n_classes()), (3, 1, 2));
	let mut wrong_version = bytes.clone();
	wrong_version[0] = 9;
	assert!(matches!(
		CompressedTree::from_bytes(&wrong_version),
		Err(Error::UnsupportedVersion(9))
	));
	assert!(matches!(CompressedTree::from_bytes(&[]), Err(Error::Malformed(0))));
	assert!(matches!(
		CompressedTree::from_bytes(&bytes[..bytes.len() - 1]),
		Err(Error::Decode(_))
	));
	// An unknown NA direction in the root.
	let mut bad_na = compressed.clone();
	bad_na.bytes[3] = 17;
	assert!(matches!(
		CompressedTree::from_bytes(&bad_na.to_bytes().unwrap()),
		Err(Error::Malformed(3))
	));
	// A skip that points past the start of the right subtree.
	let mut bad_skip = compressed;
	bad_skip.bytes[0] = RIGHT_LEAF;
	assert!(matches!(
		CompressedTree::from_bytes(&bad_skip.to_bytes().unwrap()),
		Err(Error::Malformed(_))
	));
}

#[test]
fn test_deep_chain_is_rejected() {
	// Each node sends values below 0.5 and NA to a leaf on the left and the rest to the next node on the right.
	let chain = |n_nodes: usize| {
		let mut bytes = Vec::new();
		for node_index in 0..n_nodes {
			let mut header = LEFT_LEAF | KIND_LESS_THAN;
			if node_index == n_nodes - 1 {
				header |= RIGHT_LEAF;
			}
			bytes.extend_from_slice(&[header, 0x00, 0x00, NaSplitDirection::Left.to_u8()]);
			bytes.extend_from_slice(&0.5f32.to_le_bytes());
			bytes.extend_from_slice(&1.0f32.to_le_bytes());
		}
		bytes.extend_from_slice(&2.0f32.to_le_bytes());
		CompressedTree {
			bytes,
			tree_id: 0,
			class_id: 0,
			n_classes: 1,
			seed: 0,
		}
	};
	let deep = chain(MAX_DEPTH + 1);
	assert_eq!(deep.score(&[0.0]).unwrap(), 1.0);
	assert_eq!(deep.score(&[f32::NAN]).unwrap(), 1.0);
	assert_eq!(deep.score(&[1.0]).unwrap(), 2.0);
	assert!(matches!(
		CompressedTree::from_bytes(&deep.to_bytes().unwrap()),
		Err(Error::Malformed(_))
	));
	let shallow = chain(MAX_DEPTH);
	assert_eq!(CompressedTree::from_bytes(&shallow.to_bytes().unwrap()).unwrap(), shallow);
}

#[test]
fn test_unfinished_tree_is_rejected() {
	use crate::tree::LeafNode;
	let mut tree = Tree::new(0);
	tree.push(Node::Decided(DecidedNode {
		parent: None,
		split: Some(test_split(0, SplitKind::LessThan, NaSplitDirection::Left)),
		split_value: Some(1.0),
		children: [Some(1), None],
	}));
	tree.push(Node::Leaf(LeafNode {
		parent: Some(0),
		prediction: 1.0,
	}));
	assert!(matches!(
		CompressedTree::compress(&tree, 0, 0, 1),
		Err(Error::UnfinishedNode(0))
	));
}
