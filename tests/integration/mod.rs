//! Integration tests for ociwclayer
//!
//! Export and import are driven against a recording mock driver, and end to end
//! through the directory-backed layer store.

pub mod common;
pub mod export;
