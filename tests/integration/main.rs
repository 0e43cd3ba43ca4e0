// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Integration tests for arango-operator
//!
//! These tests require a running Kubernetes cluster accessible via kubeconfig.
//! Tests are marked with #[ignore] and must be run explicitly:
//!
//! ```bash
//! cargo test --test integration -- --ignored --test-threads=1
//! ```
//!
//! The tests use your existing kubeconfig (~/.kube/config or KUBECONFIG env var).
//! They check what the operator records and creates; pods are not required
//! to become ready, so no ArangoDB image has to be pulled.

#[path = "../common/mod.rs"]
mod common;

mod namespace;


// Re-export common test utilities
pub use cluster::*;
pub use crd::*;
pub use namespace::*;
pub use operator::*;
pub use wait::*;
