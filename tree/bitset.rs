use num_traits::ToPrimitive;

/**
A set of enum levels used by group splits. Levels in the set go right.

A bitset covering only levels below 32 is stored as 32 bits with no offset, which lets the compressed encoding write it inline in 4 bytes. Larger bitsets keep the offset of their lowest level and one bit per level from there.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct Bitset {
	offset: u32,
	n_bits: u32,
	bytes: Vec<u8>,
}

/// A borrowed bitset, as read directly out of a compressed tree.
#[derive(Clone, Copy, Debug)]
pub struct BitsetView<'a> {
	pub offset: u32,
	pub n_bits: u32,
	pub bytes: &'a [u8],
}

pub const SMALL_BITSET_BITS: u32 = 32;

impl Bitset {
	pub fn new(n_bits: u32, offset: u32) -> Bitset {
		let (n_bits, offset) = if offset + n_bits <= SMALL_BITSET_BITS {
			(SMALL_BITSET_BITS, 0)
		} else {
			(n_bits, offset)
		};
		Bitset {
			offset,
			n_bits,
			bytes: vec![0; n_bytes_for_bits(n_bits)],
		}
	}

	pub fn is_small(&self) -> bool {
		self.offset == 0 && self.n_bits == SMALL_BITSET_BITS
	}

	pub fn offset(&self) -> u32 {
		self.offset
	}

	pub fn n_bits(&self) -> u32 {
		self.n_bits
	}

	pub fn bytes(&self) -> &[u8] {
		&self.bytes
	}

	pub fn view(&self) -> BitsetView {
		BitsetView {
			offset: self.offset,
			n_bits: self.n_bits,
			bytes: &self.bytes,
		}
	}

	pub fn is_in_range(&self, level: i64) -> bool {
		self.view().is_in_range(level)
	}

	pub fn contains(&self, level: i64) -> bool {
		self.view().contains(level)
	}

	pub fn set(&mut self, level: i64) {
		let (byte, mask) = self.position(level);
		self.bytes[byte] |= mask;
	}

	#[cfg(test)]
	pub fn clear(&mut self, level: i64) {
		let (byte, mask) = self.position(level);
		self.bytes[byte] &= !mask;
	}

	/// The levels in the set, in increasing order.
	pub fn levels(&self) -> Vec<i64> {
		let start = i64::from(self.offset);
		(start..start + i64::from(self.n_bits))
			.filter(|level| self.contains(*level))
			.collect()
	}

	fn position(&self, level: i64) -> (usize, u8) {
		assert!(self.is_in_range(level), "level {} out of range", level);
		let bit = (level - i64::from(self.offset)).to_usize().unwrap();
		(bit / 8, 1 << (bit % 8))
	}
}

impl<'a> BitsetView<'a> {
	pub fn is_in_range(&self, level: i64) -> bool {
		let offset = i64::from(self.offset);
		level >= offset && level < offset + i64::from(self.n_bits)
	}

	pub fn contains(&self, level: i64) -> bool {
		if !self.is_in_range(level) {
			return false;
		}
		let bit = (level - i64::from(self.offset)).to_usize().unwrap();
		self.bytes
			.get(bit / 8)
			.map(|byte| byte & (1 << (bit % 8)) != 0)
			.unwrap_or(false)
	}
}

impl std::fmt::Display for Bitset {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let levels: Vec<String> = self.levels().iter().map(|l| l.to_string()).collect();
		write!(f, "{{{}}}", levels.join(", "))
	}
}

pub fn n_bytes_for_bits(n_bits: u32) -> usize {
	((n_bits + 7) / 8).to_usize().unwrap()
}

#[test]
fn test_small_bitset() {
	let mut bitset = Bitset::new(5, 3);
	assert!(bitset.is_small());
	assert_eq!(bitset.bytes().len(), 4);
	bitset.set(3);
	bitset.set(7);
	assert!(bitset.contains(3));
	assert!(!bitset.contains(4));
	assert!(bitset.contains(7));
	bitset.clear(3);
	assert!(!bitset.contains(3));
	assert_eq!(bitset.to_string(), "{7}");
	assert!(!bitset.is_in_range(40));
}

#[test]
fn test_large_bitset() {
	let mut bitset = Bitset::new(40, 10);
	assert!(!bitset.is_small());
	assert_eq!(bitset.offset(), 10);
	assert_eq!(bitset.bytes().len(), 5);
	bitset.set(10);
	bitset.set(49);
	assert!(!bitset.is_in_range(9));
	assert!(!bitset.is_in_range(50));
	assert_eq!(bitset.levels(), vec![10, 49]);
}
