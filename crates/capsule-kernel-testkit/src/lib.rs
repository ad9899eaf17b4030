//! # Capsule Kernel Testkit
//!
//! Testing utilities for the Capsule Kernel.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Reference rule**: a small accrual calculator to drive end-to-end scenarios
//! - **Fixtures**: a kernel on a manual clock, client endpoints, signing keys
//! - **Golden vectors**: fixed proofs whose seals must never change
//! - **Generators**: proptest strategies for proofs, patterns and rights
//!
//! ## Fixtures
//!
//! ```rust
//! use capsule_kernel_testkit::fixtures::{accrual_inputs, KernelFixture, ACCRUAL_OPERATION};
//!
//! # async fn example() {
//! let fx = KernelFixture::new();
//! let inv = fx
//!     .kernel
//!     .invoke_with_proof(ACCRUAL_OPERATION, &accrual_inputs(80.0, "large", 70.0), Some("emp-1"))
//!     .await
//!     .unwrap();
//! assert!(inv.proof.is_capped());
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use capsule_kernel_testkit::generators::{proof_from_params, ProofParams};
//!
//! proptest! {
//!     #[test]
//!     fn proof_id_is_deterministic(params: ProofParams) {
//!         prop_assert_eq!(proof_from_params(&params).proof_id(), proof_from_params(&params).proof_id());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{
    accrual_inputs, accrual_rule, init_tracing, rule_manifest, signing_keypair, Client, KernelFixture,
    ACCRUAL_OPERATION,
};
pub use generators::{proof_from_params, ProofParams};
pub use vectors::{all_vectors, proof_from_vector, verify_all_vectors, GoldenVector};
