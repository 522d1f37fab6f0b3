//! # Taskline Testing Utils
//!
//! Shared testing utilities for the taskline workspace.
//!
//! - **Builders**: `Task` snapshots with sensible defaults for pure evaluator tests
//! - **Mocks**: a failure-injecting `TaskStore` wrapper and an execution tracker for handlers
//! - **Helpers**: polling helpers for asynchronous assertions
//!
//! Add this crate as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! taskline-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
