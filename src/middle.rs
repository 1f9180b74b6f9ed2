//! The middle-end of the compiler.

pub mod cfg;

pub use cfg::*;
