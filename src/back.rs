//! The back-end of the compiler.

pub mod asm;
pub mod codegen;
pub mod link;
pub mod scope;

pub use asm::*;
pub use codegen::*;
pub use link::*;
pub use scope::*;

#[cfg(test)]
mod tests;
