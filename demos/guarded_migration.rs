//! Guarded migration example.
//!
//! Runs a flaky data migration behind a circuit breaker, rolls a new code
//! path out to a quarter of planners, and rate-limits invitation-code
//! redemption. Audit events are printed through `tracing`.
//!
//! Run with: `cargo run --example guarded_migration`

use opguard::{
    Admission, AuditFilter, BreakerConfig, ControlPlane, FeatureFlag, GuardRequest, LimitConfig,
    ManualClock, AUDIT_TARGET,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(EnvFilter::new(format!("warn,{}=info", AUDIT_TARGET)))
        .init();

    // A manual clock lets the example skip through recovery timeouts
    let clock = ManualClock::default();
    let plane = ControlPlane::builder()
        .with_clock(Arc::new(clock.clone()))
        .build()
        .expect("default configuration is valid");

    println!("=== Circuit Breaker ===\n");
    plane
        .breakers()
        .configure(
            "migration-batch-7",
            BreakerConfig::new(3, Duration::from_secs(60)).expect("threshold is non-zero"),
        )
        .expect("breaker name is non-empty");

    let request = GuardRequest::new(
        "migration-runner",
        LimitConfig::per_seconds(100, 60).expect("limit is valid"),
    )
    .breaker("migration-batch-7");

    // The first four runs fail; afterwards the database is healthy again
    for run in 1..=8 {
        match plane.admit(&request) {
            Admission::Granted { .. } => {
                let succeeded = run > 4;
                let state = plane.complete("migration-batch-7", succeeded);
                println!("run {}: executed, success={}, breaker={}", run, succeeded, state);
            }
            Admission::Denied { reason, retry_after } => {
                println!("run {}: skipped ({}), retry after {:?}", run, reason, retry_after);
                clock.advance(Duration::from_secs(61));
            }
        }
    }

    println!("\n=== Feature Flag Rollout ===\n");
    plane
        .flags()
        .upsert(
            FeatureFlag::new("new-seating-ui")
                .enabled(true)
                .with_rollout(25)
                .with_allowlist(["planner-qa"])
                .with_metadata("owner", "events-team"),
        )
        .expect("flag key is non-empty");

    let planners = ["planner-qa", "user-123", "user-456", "user-789", "user-1011"];
    for planner in planners {
        let on = plane.flags().decide("new-seating-ui", Some(planner));
        println!(
            "{:<10} bucket={:>2} new_ui={}",
            planner,
            plane.flags().bucket("new-seating-ui", planner),
            on
        );
    }

    println!("\n=== Invitation Code Guessing ===\n");
    let limit = LimitConfig::per_seconds(5, 60).expect("limit is valid");
    for attempt in 1..=16 {
        let decision = plane.limiter().check("203.0.113.5", Some("INVITE-42"), limit);
        if attempt <= 6 || attempt >= 15 {
            println!(
                "attempt {:>2}: allowed={} reason={:?}",
                attempt, decision.allowed, decision.reason
            );
        }
    }

    println!("\n=== Audit Trail ===\n");
    let events = plane
        .audit()
        .query(&AuditFilter::new())
        .expect("memory sink is readable");
    for event in &events {
        println!(
            "{} {:<20} {:<8} {}",
            event.timestamp.format("%H:%M:%S"),
            event.event_type,
            event.severity.as_str(),
            event.subject
        );
    }

    let metrics = plane.metrics().snapshot();
    println!(
        "\nchecks: {} allowed, {} denied ({:.0}% denied), breakers opened: {}",
        metrics.checks_allowed,
        metrics.checks_denied,
        metrics.denial_rate() * 100.0,
        metrics.breakers_opened
    );
}
