//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Document rows are entities: a row keeps its identifier while every other
/// field is recomputed around it.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
