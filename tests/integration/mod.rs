//! Integration test suite for phylofold.
//!
//! These tests run both pipeline modes end to end against an in-process
//! simulation of the external tools, covering batching, checkpoint
//! threading, failure policies and finalization.
//!
//! # Test Categories
//!
//! - `pipeline_e2e`: Full build and incremental update runs
//! - `failure_policies`: Retry, ignore and abort behaviour
//! - `threading`: Ordering and concurrency of checkpoint transitions
//!
//! # CI Compatibility
//!
//! No external binaries or network access are needed.

mod fixtures;

mod failure_policies;
mod threading;
