//! Domain layer - pure business logic with no I/O.
//!
//! This layer contains the entities and transition rules of the control plane:
//! - Circuit breaker state machine
//! - Feature flag rollout evaluation
//! - Rate-limit windows and blocklist entries
//! - Audit events and decisions
//!
//! Every function here takes the current time as an argument instead of
//! reading a clock, so all of it is deterministic under test.

pub mod audit;
pub mod blocklist;
pub mod breaker;
pub mod decision;
pub mod flag;
pub mod time;
pub mod window;
