//! signal-sandbox - validate and run generated numerical scripts in isolated instances
//!
//! This crate provides:
//! - Static validation of untrusted Python scripts against an allow-list policy
//! - Runtime policy checks before any isolated instance is created
//! - Container-backed execution with hard resource ceilings and guaranteed teardown
//! - A tamper-evident cleanup log and an orphan reaper for leaked instances

pub mod alert;
pub mod cleanup;
pub mod cli;
pub mod concurrency;
pub mod config;
pub(crate) mod digest;
pub mod engine;
pub mod paths;
pub mod protocol;
pub mod reaper;
pub mod sandbox;
pub mod validator;

pub use config::Config;
pub use engine::Engine;
