//! Core module containing fundamental identifier types and constants

pub mod types;

// Re-export commonly used items
pub use types::*;
