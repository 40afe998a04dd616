// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the Elasticsearch operator
//!
//! This module contains unit tests for:
//! - Resource generators (StatefulSet, Service, Secret, ServiceMonitor, Job)
//! - Admission defaulting and validation
//! - State machine transitions
//! - Dormant records and resume matching
//! - Scheduled snapshots and snapshot storage

#[path = "../common/mod.rs"]
mod common;

mod cron;
mod dormant;
mod resources;
mod state_machine;
mod storage;
mod validation;
mod webhooks;
