//! Service construction and wiring.

pub mod container;

pub use container::ServiceContainer;
