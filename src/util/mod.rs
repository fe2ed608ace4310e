//! Small shared helpers.

pub mod glob;

pub use glob::Glob;
