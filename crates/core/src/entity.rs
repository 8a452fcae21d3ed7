//! Entity trait: identity that survives state changes.

/// Anything with a stable, strongly-typed identity.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
