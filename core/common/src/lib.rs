//! Common utilities and types shared across DocVault crates.
//!
//! This module provides the error taxonomy and identifier types used by the
//! store and sync crates.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{EntityId, OperationId};
