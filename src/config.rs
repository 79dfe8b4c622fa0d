//! Tunables for the service and the analytics monitor.

use serde::Deserialize;

use crate::{DEFAULT_TEST_FRACTION, QBER_THRESHOLD, QBER_WARNING, QkdError};

/// Thresholds and window sizes of the analytics monitor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// QBER above which a session raises a CRITICAL threat.
    pub critical_qber: f64,
    /// QBER above which a session raises a WARNING threat.
    pub warning_qber: f64,
    pub session_history: usize,
    pub threat_log: usize,
    /// Sessions averaged by the dashboard.
    pub average_window: usize,
    /// Points of each history returned by the dashboard.
    pub dashboard_window: usize,
    pub recent_threats: usize,
    /// Sessions required before anomaly detection reports anything.
    pub anomaly_min_sessions: usize,
    pub anomaly_window: usize,
    pub anomaly_sigma: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            critical_qber: QBER_THRESHOLD,
            warning_qber: QBER_WARNING,
            session_history: 50,
            threat_log: 100,
            average_window: 10,
            dashboard_window: 20,
            recent_threats: 5,
            anomaly_min_sessions: 5,
            anomaly_window: 10,
            anomaly_sigma: 2.0,
        }
    }
}

/// Configuration of a [`crate::QkdService`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Qubits sent when the caller does not ask for a length.
    pub default_key_length: usize,
    pub test_fraction: f64,
    /// Acceptance threshold, also used by the decryption gate.
    pub qber_threshold: f64,
    pub key_history: usize,
    pub event_log: usize,
    pub recent_events: usize,
    pub transcript_len: usize,
    pub analytics: AnalyticsConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_key_length: 100,
            test_fraction: DEFAULT_TEST_FRACTION,
            qber_threshold: QBER_THRESHOLD,
            key_history: 10,
            event_log: 100,
            recent_events: 10,
            transcript_len: 20,
            analytics: AnalyticsConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(input: &str) -> Result<Self, QkdError> {
        let config: ServiceConfig = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QkdError> {
        if self.default_key_length == 0 {
            return Err(QkdError::InvalidConfig("default_key_length must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err(QkdError::InvalidConfig(format!(
                "test_fraction {} outside [0, 1)",
                self.test_fraction
            )));
        }
        for (name, value) in [
            ("qber_threshold", self.qber_threshold),
            ("analytics.critical_qber", self.analytics.critical_qber),
            ("analytics.warning_qber", self.analytics.warning_qber),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(QkdError::InvalidConfig(format!("{name} {value} outside [0, 100]")));
            }
        }
        if self.analytics.warning_qber > self.analytics.critical_qber {
            return Err(QkdError::InvalidConfig(
                "analytics.warning_qber exceeds analytics.critical_qber".into(),
            ));
        }
        if self.analytics.anomaly_sigma < 0.0 {
            return Err(QkdError::InvalidConfig("analytics.anomaly_sigma must not be negative".into()));
        }
        for (name, value) in [
            ("key_history", self.key_history),
            ("event_log", self.event_log),
            ("analytics.session_history", self.analytics.session_history),
            ("analytics.threat_log", self.analytics.threat_log),
            ("analytics.anomaly_window", self.analytics.anomaly_window),
        ] {
            if value == 0 {
                return Err(QkdError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
