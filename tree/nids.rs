/*!
Every training row carries a signed node id for each tree being grown. Non-negative ids are the node the row currently sits in. Rows that no longer need to be scored are marked decided, and out of bag rows store their node id in a negative encoding so they can keep following the tree without contributing to any histogram.
*/

/// A row that is finished with this tree.
pub const DECIDED_ROW: i32 = -1;

/// The out of bag encoding of the root.
pub const OUT_OF_BAG: i32 = -2;

pub fn is_out_of_bag(nid: i32) -> bool {
	nid <= OUT_OF_BAG
}

pub fn is_decided(nid: i32) -> bool {
	nid == DECIDED_ROW
}

/// Encode a node id as out of bag. This is its own inverse.
pub fn nid_to_oob(nid: i32) -> i32 {
	-nid - 2
}

/// Decode an out of bag node id.
pub fn oob_to_nid(oob: i32) -> i32 {
	-oob - 2
}

#[test]
fn test_nid_encoding() {
	for nid in 0..1000 {
		let oob = nid_to_oob(nid);
		assert!(is_out_of_bag(oob));
		assert_eq!(oob_to_nid(oob), nid);
		assert_eq!(nid_to_oob(oob), nid);
	}
	assert_eq!(nid_to_oob(0), OUT_OF_BAG);
	assert_eq!(nid_to_oob(DECIDED_ROW), DECIDED_ROW);
	assert!(!is_out_of_bag(DECIDED_ROW));
	assert!(is_decided(DECIDED_ROW));
}
