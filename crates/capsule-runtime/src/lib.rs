//! # capsule-runtime
//!
//! The container launch engine: option resolution into a [`spec::LaunchSpec`],
//! mount planning and staging, process launch, and the [`engine::Engine`]
//! that runs them in order on top of the `capsule-core` primitives.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod host;
pub mod image;
pub mod instance;
pub mod planner;
pub mod process;
pub mod resolver;
pub mod spec;
pub mod stage;
