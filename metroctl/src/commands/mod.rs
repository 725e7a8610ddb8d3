//! Command implementations, one module per noun.

pub mod metric;
pub mod plugin;
pub mod task;
