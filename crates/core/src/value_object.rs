//! Value object marker: compared by value, never mutated in place.

/// Marker trait for value objects.
///
/// A value object has no identity of its own. Two instances holding the same
/// values are interchangeable, and "changing" one means building a new one.
/// Account names and CPF numbers are modelled this way.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
