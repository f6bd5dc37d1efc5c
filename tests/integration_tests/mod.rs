//! Integration tests module
//!
//! End-to-end tests for kettle running several coordinators and workers in
//! one process over the in-memory lock and bus:
//! - Mutual exclusion and failover between coordinators
//! - Roster convergence, duplicate delivery and stale responses
//! - Demotion, cancellation and fencing
//! - Status API

pub mod api_test;
pub mod discovery_test;
pub mod election_test;
pub mod failure_test;
