use num_traits::Float;
use std::{
	cmp::Ordering,
	hash::{Hash, Hasher},
};
use thiserror::Error;

/// A float that is known to be neither NaN nor infinite, which makes it totally ordered and usable as a map key.
#[derive(Clone, Copy, Debug)]
pub struct Finite<T>(T)
where
	T: Float;

#[derive(Debug, Error)]
#[error("not finite")]
pub struct NotFiniteError;

impl<T> Finite<T>
where
	T: Float,
{
	pub fn new(value: T) -> Result<Self, NotFiniteError> {
		if value.is_finite() {
			Ok(Self(value))
		} else {
			Err(NotFiniteError)
		}
	}

	pub fn get(self) -> T {
		self.0
	}

	/// Return the midpoint of two finite values. The result is finite because the halves are summed.
	pub fn midpoint(self, other: Self) -> Self {
		let two = T::one() + T::one();
		Self(self.0 / two + other.0 / two)
	}
}

impl<T> std::ops::Deref for Finite<T>
where
	T: Float,
{
	type Target = T;
	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<T> std::fmt::Display for Finite<T>
where
	T: Float + std::fmt::Display,
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl<T> PartialEq for Finite<T>
where
	T: Float,
{
	fn eq(&self, other: &Self) -> bool {
		self.0.eq(&other.0)
	}
}

impl<T> Eq for Finite<T> where T: Float {}

impl<T> PartialOrd for Finite<T>
where
	T: Float,
{
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl<T> Ord for Finite<T>
where
	T: Float,
{
	fn cmp(&self, other: &Self) -> Ordering {
		// Neither side is NaN, so the comparison always succeeds.
		self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
	}
}

impl Hash for Finite<f32> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		// -0.0 and 0.0 compare equal, so they must hash equal.
		let value = if self.0 == 0.0 { 0.0f32 } else { self.0 };
		value.to_bits().hash(state);
	}
}

impl Hash for Finite<f64> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		let value = if self.0 == 0.0 { 0.0f64 } else { self.0 };
		value.to_bits().hash(state);
	}
}

#[test]
fn test_finite_rejects_nan_and_infinity() {
	assert!(Finite::new(f64::NAN).is_err());
	assert!(Finite::new(f32::INFINITY).is_err());
	assert!(Finite::new(f32::NEG_INFINITY).is_err());
	assert_eq!(Finite::new(1.5f32).unwrap().get(), 1.5);
}

#[test]
fn test_finite_ordering() {
	let mut values: Vec<Finite<f64>> = [3.0, -1.0, 0.5, 2.0]
		.iter()
		.map(|v| Finite::new(*v).unwrap())
		.collect();
	values.sort();
	let values: Vec<f64> = values.into_iter().map(|v| v.get()).collect();
	insta::assert_debug_snapshot!(values, @r###"
 [
     -1.0,
     0.5,
     2.0,
     3.0,
 ]
 "###);
}

#[test]
fn test_finite_midpoint() {
	let a = Finite::new(f64::MAX).unwrap();
	let b = Finite::new(f64::MAX).unwrap();
	assert_eq!(a.midpoint(b).get(), f64::MAX);
	let a = Finite::new(1.0f32).unwrap();
	let b = Finite::new(2.0f32).unwrap();
	assert_eq!(a.midpoint(b).get(), 1.5);
}
