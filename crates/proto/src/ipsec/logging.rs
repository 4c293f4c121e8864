//! Structured logging for CHILD_SA negotiation
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! All log messages include relevant context fields for debugging and
//! monitoring.
//!
//! # Log Levels
//!
//! - **TRACE**: Payload composition details
//! - **DEBUG**: Selector narrowing, key exchange progress
//! - **INFO**: CHILD_SA establishment, retries, deletions
//! - **WARN**: Retryable errors, unusual but valid conditions
//! - **ERROR**: Failed negotiations and installs

use tracing::{debug, error, info, warn};

/// Log the start of a CHILD_SA negotiation
pub fn log_child_initiated(name: &str, unique_id: u32, reqid: u32) {
    if reqid != 0 {
        info!(child = name, unique_id, reqid, "establishing CHILD_SA");
    } else {
        info!(child = name, unique_id, "establishing CHILD_SA");
    }
}

/// Log a successfully installed CHILD_SA
///
/// `outbound_installed` is false when only the inbound half is active
/// (rekey handover).
pub fn log_child_established(
    name: &str,
    unique_id: u32,
    my_spi: u32,
    other_spi: u32,
    outbound_installed: bool,
) {
    info!(
        child = name,
        unique_id,
        spi_in = %format_args!("{:08x}", my_spi),
        spi_out = %format_args!("{:08x}", other_spi),
        inbound_only = !outbound_installed,
        "CHILD_SA established"
    );
}

/// Log a CHILD_SA negotiation failure that keeps the IKE_SA
pub fn log_child_failed_keeping_ike(reason: &str) {
    warn!(reason, "failed to establish CHILD_SA, keeping IKE_SA");
}

/// Log selector narrowing results
pub fn log_ts_narrowed(local: bool, count: usize) {
    debug!(
        side = if local { "local" } else { "remote" },
        selectors = count,
        "narrowed traffic selectors"
    );
}

/// Log a scheduled creation retry after a temporary failure
pub fn log_retry_scheduled(name: &str, delay_secs: u64) {
    info!(
        child = name,
        delay_secs, "creating CHILD_SA failed, trying again"
    );
}

/// Log an inline retry with another key exchange method
pub fn log_ke_retry(requested: &str) {
    info!(
        requested,
        "peer didn't accept key exchange method, retrying"
    );
}

/// Log a key exchange round
pub fn log_ke_round(index: usize, total: usize, method: &str) {
    debug!(round = index + 1, total, method, "key exchange round");
}

/// Log a DELETE emitted for a failed or aborted CHILD_SA
pub fn log_child_delete_sent(spi: u32) {
    info!(
        spi = %format_args!("{:08x}", spi),
        "sending DELETE for CHILD_SA"
    );
}

/// Log an SA or policy install failure
pub fn log_install_failed(what: &str, error: &str) {
    error!(what, error, "unable to install IPsec state in kernel");
}

/// Log a received notify the task treats as a child-scoped error
pub fn log_error_notify(notify: &str) {
    warn!(notify, "received error notify, no CHILD_SA built");
}
