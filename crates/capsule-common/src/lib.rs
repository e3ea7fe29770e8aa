//! # capsule-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire Capsule workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the error taxonomy, the raw option map
//! handed to the Config Resolver, and the domain primitives every launch
//! stage speaks.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod options;
pub mod types;
