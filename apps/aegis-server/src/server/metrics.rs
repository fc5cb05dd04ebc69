use std::{collections::HashMap, fmt::Write as _, sync::atomic::Ordering};

use super::core::{MetricsState, METRICS_STATE};

pub(crate) const NOTIFICATION_KIND_CASE_CREATED: &str = "case_created";
pub(crate) const NOTIFICATION_KIND_CASE_PUBLISHED: &str = "case_published";
pub(crate) const NOTIFICATION_KIND_AUDIT: &str = "audit";

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

pub(crate) fn render_metrics() -> String {
    let auth_failures = metrics_state()
        .auth_failures
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());
    let notifications_dropped = metrics_state()
        .notifications_dropped
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone());

    let mut output = String::new();
    output.push_str("# HELP aegis_auth_failures_total Count of auth-related failures by reason\n");
    output.push_str("# TYPE aegis_auth_failures_total counter\n");
    let mut auth_entries: Vec<_> = auth_failures.into_iter().collect();
    auth_entries.sort_by_key(|(reason, _)| *reason);
    for (reason, value) in auth_entries {
        let _ = writeln!(
            output,
            "aegis_auth_failures_total{{reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP aegis_ip_gate_rejections_total Count of requests rejected by the IP reputation gate\n",
    );
    output.push_str("# TYPE aegis_ip_gate_rejections_total counter\n");
    let _ = writeln!(
        output,
        "aegis_ip_gate_rejections_total {}",
        metrics_state().ip_gate_rejections.load(Ordering::Relaxed)
    );

    output.push_str(
        "# HELP aegis_notifications_dropped_total Count of notifications that could not be delivered by kind\n",
    );
    output.push_str("# TYPE aegis_notifications_dropped_total counter\n");
    let mut dropped_entries: Vec<_> = notifications_dropped.into_iter().collect();
    dropped_entries.sort_by_key(|(kind, _)| *kind);
    for (kind, value) in dropped_entries {
        let _ = writeln!(
            output,
            "aegis_notifications_dropped_total{{kind=\"{kind}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP aegis_log_append_retries_total Count of audit log appends retried after a failure\n",
    );
    output.push_str("# TYPE aegis_log_append_retries_total counter\n");
    let _ = writeln!(
        output,
        "aegis_log_append_retries_total {}",
        metrics_state().log_append_retries.load(Ordering::Relaxed)
    );

    output
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    if let Ok(mut counters) = metrics_state().auth_failures.lock() {
        let entry = counters.entry(reason).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_notification_dropped(kind: &'static str) {
    if let Ok(mut counters) = metrics_state().notifications_dropped.lock() {
        let entry = counters.entry(kind).or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_ip_gate_rejection() {
    metrics_state()
        .ip_gate_rejections
        .fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_log_append_retry() {
    metrics_state()
        .log_append_retries
        .fetch_add(1, Ordering::Relaxed);
}
