//! The virtual machine and its heap allocator.

pub mod heap;
pub mod machine;

pub use heap::*;
pub use machine::*;
