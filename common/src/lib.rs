//! Bridge-Me-Not Common Types
//!
//! This crate contains shared types used across the Bridge-Me-Not resolver,
//! including identifiers, the swap record model and its lifecycle state
//! machine, and the error taxonomy.

pub mod identifiers;
pub mod swap;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use swap::*;
pub use error::*;
pub use time::*;

/// Re-exported so downstream crates agree on the exact on-chain primitive types.
pub use alloy_primitives::{keccak256, Address, B256, U256};
