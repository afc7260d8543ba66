//! CLI command implementations.

pub mod identity;
pub mod listen;
pub mod replicate;
