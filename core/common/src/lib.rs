//! Common utilities and types shared across the fieldsync crates.
//!
//! This module provides the error taxonomy used by the queue, the store and
//! the remote client, plus the small identifier types they exchange.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ItemId, SessionInfo};
