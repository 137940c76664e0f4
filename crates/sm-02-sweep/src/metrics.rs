//! # Sweep Metrics
//!
//! Prometheus metrics for sweep and role health.
//!
//! ## Usage
//!
//! Enable with the `metrics` feature:
//! ```toml
//! sm-02-sweep = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `sm_sweeps_completed_total` - Sweeps that ran every phase (by kind)
//! - `sm_sweeps_aborted_total` - Sweeps aborted by a phase error
//! - `sm_sweeps_incomplete_total` - Sweeps finished with failed work
//! - `sm_sweep_duration_seconds` - Histogram of sweep wall time
//! - `sm_requests_issued_total` - Requests accepted by the transport
//! - `sm_blocks_queued_total` - Changed table blocks queued (by table)
//! - `sm_transaction_failures_total` - Failed or refused requests
//! - `sm_role` - Current role (0=Discovering, 1=Standby, 2=Master)
//! - `sm_role_transitions_total` - Role changes

use fabric_types::SmRole;

use crate::domain::{SweepKind, SweepOutcome};

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec, Gauge,
    Histogram, IntCounter, IntCounterVec,
};

#[cfg(feature = "metrics")]
lazy_static! {
    /// Sweeps that ran every phase, labeled by kind
    pub static ref SWEEPS_COMPLETED: IntCounterVec = register_int_counter_vec!(
        "sm_sweeps_completed_total",
        "Total number of sweeps that ran every phase",
        &["kind"]
    )
    .expect("Failed to create SWEEPS_COMPLETED metric");

    /// Sweeps aborted by a phase error
    pub static ref SWEEPS_ABORTED: IntCounter = register_int_counter!(
        "sm_sweeps_aborted_total",
        "Total number of sweeps aborted by a phase error"
    )
    .expect("Failed to create SWEEPS_ABORTED metric");

    /// Sweeps finished with failed work
    pub static ref SWEEPS_INCOMPLETE: IntCounter = register_int_counter!(
        "sm_sweeps_incomplete_total",
        "Total number of sweeps finished with failed work"
    )
    .expect("Failed to create SWEEPS_INCOMPLETE metric");

    /// Sweep wall time
    pub static ref SWEEP_DURATION: Histogram = register_histogram!(
        "sm_sweep_duration_seconds",
        "Wall time of one sweep",
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .expect("Failed to create SWEEP_DURATION metric");

    /// Requests accepted by the transport
    pub static ref REQUESTS_ISSUED: IntCounter = register_int_counter!(
        "sm_requests_issued_total",
        "Total number of requests accepted by the transport"
    )
    .expect("Failed to create REQUESTS_ISSUED metric");

    /// Changed table blocks queued, labeled by table
    pub static ref BLOCKS_QUEUED: IntCounterVec = register_int_counter_vec!(
        "sm_blocks_queued_total",
        "Total number of changed forwarding blocks queued",
        &["table"]
    )
    .expect("Failed to create BLOCKS_QUEUED metric");

    /// Failed or refused requests
    pub static ref TRANSACTION_FAILURES: IntCounter = register_int_counter!(
        "sm_transaction_failures_total",
        "Total number of failed or refused requests"
    )
    .expect("Failed to create TRANSACTION_FAILURES metric");

    /// Current role (0=Discovering, 1=Standby, 2=Master)
    pub static ref ROLE: Gauge = register_gauge!(
        "sm_role",
        "Current SM role (0=Discovering, 1=Standby, 2=Master)"
    )
    .expect("Failed to create ROLE metric");

    /// Role changes
    pub static ref ROLE_TRANSITIONS: IntCounter = register_int_counter!(
        "sm_role_transitions_total",
        "Total number of SM role changes"
    )
    .expect("Failed to create ROLE_TRANSITIONS metric");
}

// =============================================================================
// METRIC RECORDING FUNCTIONS
// =============================================================================

#[cfg(feature = "metrics")]
fn kind_label(kind: SweepKind) -> &'static str {
    match kind {
        SweepKind::Light => "light",
        SweepKind::Heavy => "heavy",
    }
}

/// Record how a sweep ended and how long it took
#[cfg(feature = "metrics")]
pub fn record_sweep_finished(outcome: SweepOutcome, seconds: f64) {
    SWEEP_DURATION.observe(seconds);
    match outcome {
        SweepOutcome::Completed(kind) => SWEEPS_COMPLETED.with_label_values(&[kind_label(kind)]).inc(),
        SweepOutcome::Incomplete(_) => SWEEPS_INCOMPLETE.inc(),
        SweepOutcome::Aborted(_) => SWEEPS_ABORTED.inc(),
        SweepOutcome::Cancelled(_) => {}
    }
}

/// Record a request accepted by the transport
#[cfg(feature = "metrics")]
pub fn record_request_issued() {
    REQUESTS_ISSUED.inc();
}

/// Record changed blocks queued for a table
#[cfg(feature = "metrics")]
pub fn record_blocks_queued(table: &str, count: usize) {
    BLOCKS_QUEUED.with_label_values(&[table]).inc_by(count as u64);
}

/// Record a failed or refused request
#[cfg(feature = "metrics")]
pub fn record_transaction_failure() {
    TRANSACTION_FAILURES.inc();
}

/// Record a role change
#[cfg(feature = "metrics")]
pub fn record_role_transition(role: SmRole) {
    ROLE_TRANSITIONS.inc();
    ROLE.set(match role {
        SmRole::Discovering => 0.0,
        SmRole::Standby => 1.0,
        SmRole::Master => 2.0,
    });
}

// =============================================================================
// NO-OP IMPLEMENTATIONS (when metrics feature disabled)
// =============================================================================

#[cfg(not(feature = "metrics"))]
pub fn record_sweep_finished(_outcome: SweepOutcome, _seconds: f64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_request_issued() {}

#[cfg(not(feature = "metrics"))]
pub fn record_blocks_queued(_table: &str, _count: usize) {}

#[cfg(not(feature = "metrics"))]
pub fn record_transaction_failure() {}

#[cfg(not(feature = "metrics"))]
pub fn record_role_transition(_role: SmRole) {}
