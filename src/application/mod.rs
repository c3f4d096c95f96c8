//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Circuit breaker registry (named breakers in a shared store)
//! - Feature flag engine (rollout decisions)
//! - Rate limiter (blocklist, window counters, auto-blocking)
//! - Audit log (append, mirror into tracing, query)
//! - Window janitor (periodic purge)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod audit;
pub mod circuit_breaker;
pub mod feature_flags;
pub mod janitor;
pub mod metrics;
pub mod ports;
pub mod rate_limiter;
