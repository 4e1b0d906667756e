//! Observability for the lobby controller.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Metric labels are bounded:
//! - `kind`: create, join
//! - `outcome`: success plus the four enter-failure labels
//! - `reason`: leave reasons (4 values)
//! - `role`: owner, member
//! - `operation`: ledger operations (record, erase, load)
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `lobby_enter_total` | Counter | `kind`, `outcome` | Create/join attempts by result |
//! | `lobby_enter_duration_seconds` | Histogram | `kind` | Backend create/join latency |
//! | `lobby_leave_total` | Counter | `reason` | Sessions ended, by cause |
//! | `lobby_heartbeat_timeouts_total` | Counter | `role` | Members declared unresponsive |
//! | `lobby_stale_sessions_flushed_total` | Counter | none | Orphaned lobbies cleaned at attach |
//! | `lobby_providers_draining` | Gauge | none | Obsolete backends awaiting disposal |
//! | `lobby_observer_faults_total` | Counter | none | Observer callbacks that panicked |
//! | `lobby_ledger_errors_total` | Counter | `operation` | Ledger persistence failures |

pub mod metrics;

pub use metrics::{
    init_metrics_recorder, record_enter, record_enter_duration, record_heartbeat_timeout,
    record_leave, record_ledger_error, record_observer_fault, record_stale_session_flushed,
    set_providers_draining,
};
