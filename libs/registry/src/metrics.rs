//! Registry metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.
//! Registration failures of the metrics themselves are fatal (`.unwrap()`),
//! they indicate a duplicate name, which is a programming error.

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};

lazy_static! {
    /// Count of successful registrations, including those made by self-heal
    pub static ref REGISTRATIONS: IntCounter = register_int_counter!(
        "registry_registrations",
        "count of keys successfully registered under a fresh lease"
    ).unwrap();

    /// Count of failed registrations, labelled by the step that failed
    pub static ref REGISTRATION_FAILURES: IntCounterVec = register_int_counter_vec!(
        "registry_registration_failures",
        "count of failed registrations by failing step",
        &["step"]
    ).unwrap();

    /// Count of updates that fell back to re-registration
    pub static ref SELF_HEALS: IntCounter = register_int_counter!(
        "registry_self_heals",
        "count of updates that re-registered a key after a failed publish"
    ).unwrap();

    /// Count of explicit deregistrations
    pub static ref DEREGISTRATIONS: IntCounter = register_int_counter!(
        "registry_deregistrations",
        "count of keys explicitly deregistered"
    ).unwrap();

    /// Count of store deletes that failed during close
    pub static ref CLOSE_DELETE_FAILURES: IntCounter = register_int_counter!(
        "registry_close_delete_failures",
        "count of store deletes that failed during the close sweep"
    ).unwrap();

    /// Count of renewal tasks that stopped because the lease was lost
    pub static ref RENEWALS_LOST: IntCounter = register_int_counter!(
        "registry_renewals_lost",
        "count of lease renewals that ended because the lease expired or the stream failed"
    ).unwrap();

    /// Count of heartbeat ticks whose update could not be healed
    pub static ref HEARTBEAT_FAILURES: IntCounter = register_int_counter!(
        "registry_heartbeat_failures",
        "count of heartbeat updates that failed even after re-registration"
    ).unwrap();

    /// Gauge: keys currently held in the ledger
    pub static ref LEDGER_ENTRIES: IntGauge = register_int_gauge!(
        "registry_ledger_entries",
        "number of keys currently registered by this process"
    ).unwrap();
}
