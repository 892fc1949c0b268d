//! Shared result alias.
//!
//! Oblique follows the same convention as its teacher repo: orchestration and codec
//! code returns `anyhow::Result`, annotated with `.context(...)` at fallible boundaries
//! rather than growing a bespoke error-enum hierarchy.

pub use anyhow::{Context, Result};
