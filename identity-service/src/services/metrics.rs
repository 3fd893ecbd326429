use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Metrics
pub static LOGIN_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static TOKEN_REFRESH_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static AUTHZ_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static AUTHZ_CHECK_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

/// Create and register collectors. Calling it again is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let login_attempts = IntCounterVec::new(
        Opts::new("identity_login_attempts_total", "Login attempts by outcome"),
        &["outcome"],
    )?;
    let token_refresh = IntCounterVec::new(
        Opts::new("identity_token_refresh_total", "Refresh token rotations by outcome"),
        &["outcome"],
    )?;
    let authz_decisions = IntCounterVec::new(
        Opts::new("identity_authz_decisions_total", "Permission checks by decision"),
        &["decision", "cached"],
    )?;
    let authz_duration = HistogramVec::new(
        HistogramOpts::new(
            "identity_authz_check_duration_seconds",
            "Permission check duration in seconds",
        ),
        &["cached"],
    )?;

    registry.register(Box::new(login_attempts.clone()))?;
    registry.register(Box::new(token_refresh.clone()))?;
    registry.register(Box::new(authz_decisions.clone()))?;
    registry.register(Box::new(authz_duration.clone()))?;

    // Initialize globals
    let _ = REGISTRY.set(registry);
    let _ = LOGIN_ATTEMPTS_TOTAL.set(login_attempts);
    let _ = TOKEN_REFRESH_TOTAL.set(token_refresh);
    let _ = AUTHZ_DECISIONS_TOTAL.set(authz_decisions);
    let _ = AUTHZ_CHECK_DURATION_SECONDS.set(authz_duration);
    Ok(())
}

pub fn record_login(outcome: &str) {
    if let Some(counter) = LOGIN_ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_refresh(outcome: &str) {
    if let Some(counter) = TOKEN_REFRESH_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_authz(decision: &str, cached: bool, duration_seconds: f64) {
    let cached = if cached { "true" } else { "false" };
    if let Some(counter) = AUTHZ_DECISIONS_TOTAL.get() {
        counter.with_label_values(&[decision, cached]).inc();
    }
    if let Some(histogram) = AUTHZ_CHECK_DURATION_SECONDS.get() {
        histogram.with_label_values(&[cached]).observe(duration_seconds);
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}
