// src/analytics/mod.rs
//! Rolling statistics over successive key-generation runs.
//!
//! Every run is appended to a bounded session history and classified against
//! the warning and critical QBER levels. A simple z-score detector flags runs
//! whose QBER sits well above the recent mean.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::AnalyticsConfig;
use crate::history::BoundedLog;
use crate::protocol::ProtocolMetrics;

/// Severity attached to security and threat events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    High,
}

/// A timestamped security-relevant event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ThreatEvent {
    /// Builds an event stamped with the current time.
    pub fn new(kind: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: kind.into(),
            severity,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One recorded key-generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub timestamp: DateTime<Utc>,
    pub qber: f64,
    pub fidelity: f64,
    pub sifted_length: usize,
    pub eve_active: bool,
}

/// A single point of a dashboard time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub eve_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatSummary {
    pub total_threats: usize,
    pub critical: usize,
    pub warning: usize,
    pub recent: Vec<ThreatEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_sessions: u64,
    pub average_qber: f64,
    pub average_fidelity: f64,
    pub threat_summary: ThreatSummary,
    pub qber_history: Vec<HistoryPoint>,
    pub fidelity_history: Vec<HistoryPoint>,
}

/// Security analytics monitor.
#[derive(Debug, Clone)]
pub struct SecurityAnalytics {
    config: AnalyticsConfig,
    sessions: BoundedLog<SessionRecord>,
    threats: BoundedLog<ThreatEvent>,
    session_count: u64,
}

impl Default for SecurityAnalytics {
    fn default() -> Self {
        Self::new(AnalyticsConfig::default())
    }
}

impl SecurityAnalytics {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            sessions: BoundedLog::new(config.session_history),
            threats: BoundedLog::new(config.threat_log),
            session_count: 0,
            config,
        }
    }

    /// Total sessions recorded, including those evicted from the history.
    pub fn session_count(&self) -> u64 {
        self.session_count
    }

    pub fn sessions(&self) -> &BoundedLog<SessionRecord> {
        &self.sessions
    }

    pub fn threats(&self) -> &BoundedLog<ThreatEvent> {
        &self.threats
    }

    /// Records a run and raises a threat if its QBER warrants one.
    ///
    /// # Arguments
    /// * `metrics`: Metrics of the finished run.
    /// * `eve_active`: Whether the attack simulation was on for the run.
    ///
    /// # Returns
    /// * The appended `SessionRecord`.
    pub fn record_session(&mut self, metrics: &ProtocolMetrics, eve_active: bool) -> SessionRecord {
        let record = SessionRecord {
            timestamp: Utc::now(),
            qber: metrics.qber,
            fidelity: metrics.fidelity,
            sifted_length: metrics.sifted_key_length,
            eve_active,
        };
        self.sessions.push(record.clone());
        self.session_count += 1;

        let qber = metrics.qber;
        if qber > self.config.critical_qber {
            warn!(qber, "session QBER above critical threshold");
            self.record_threat(
                ThreatEvent::new(
                    "HIGH_QBER",
                    Severity::Critical,
                    format!("QBER exceeded threshold: {qber:.2}%"),
                )
                .with_details(json!({ "qber": qber })),
            );
        } else if qber > self.config.warning_qber {
            info!(qber, "session QBER elevated");
            self.record_threat(
                ThreatEvent::new(
                    "ELEVATED_QBER",
                    Severity::Warning,
                    format!("Elevated QBER detected: {qber:.2}%"),
                )
                .with_details(json!({ "qber": qber })),
            );
        }
        record
    }

    /// Appends `event` to the threat log, restamping it with the current time.
    pub fn record_threat(&mut self, mut event: ThreatEvent) {
        event.timestamp = Utc::now();
        self.threats.push(event);
    }

    pub fn average_qber(&self, last_n: usize) -> f64 {
        mean(self.sessions.tail(last_n).map(|s| s.qber))
    }

    pub fn average_fidelity(&self, last_n: usize) -> f64 {
        mean(self.sessions.tail(last_n).map(|s| s.fidelity))
    }

    /// Whether `current_qber` lies more than `anomaly_sigma` population
    /// standard deviations above the mean of the recent window.
    ///
    /// Always `false` until `anomaly_min_sessions` sessions are recorded.
    pub fn detect_anomaly(&self, current_qber: f64) -> bool {
        if self.sessions.len() < self.config.anomaly_min_sessions {
            return false;
        }
        let recent: Vec<f64> = self
            .sessions
            .tail(self.config.anomaly_window)
            .map(|s| s.qber)
            .collect();
        if recent.is_empty() {
            return false;
        }
        let mean = mean(recent.iter().copied());
        let variance = recent.iter().map(|q| (q - mean).powi(2)).sum::<f64>() / recent.len() as f64;
        current_qber > mean + self.config.anomaly_sigma * variance.sqrt()
    }

    pub fn threat_summary(&self) -> ThreatSummary {
        let count = |severity: Severity| self.threats.iter().filter(|t| t.severity == severity).count();
        ThreatSummary {
            total_threats: self.threats.len(),
            critical: count(Severity::Critical),
            warning: count(Severity::Warning),
            recent: self.threats.snapshot_tail(self.config.recent_threats),
        }
    }

    fn series(&self, value: fn(&SessionRecord) -> f64) -> Vec<HistoryPoint> {
        self.sessions
            .tail(self.config.dashboard_window)
            .map(|s| HistoryPoint {
                timestamp: s.timestamp,
                value: value(s),
                eve_active: s.eve_active,
            })
            .collect()
    }

    pub fn dashboard(&self) -> DashboardStats {
        DashboardStats {
            total_sessions: self.session_count,
            average_qber: round2(self.average_qber(self.config.average_window)),
            average_fidelity: round2(self.average_fidelity(self.config.average_window)),
            threat_summary: self.threat_summary(),
            qber_history: self.series(|s| s.qber),
            fidelity_history: self.series(|s| s.fidelity),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn metrics(qber: f64) -> ProtocolMetrics {
        ProtocolMetrics {
            raw_key_length: 100,
            sifted_key_length: 50,
            basis_matches: 50,
            basis_efficiency: 50.0,
            qber,
            fidelity: 100.0 - qber,
            execution_time: Duration::from_millis(1),
        }
    }

    #[test]
    fn sessions_are_classified_by_qber() {
        let mut analytics = SecurityAnalytics::default();
        analytics.record_session(&metrics(0.0), false);
        analytics.record_session(&metrics(5.0), false);
        assert!(analytics.threats().is_empty());

        analytics.record_session(&metrics(8.0), false);
        analytics.record_session(&metrics(11.0), false);
        analytics.record_session(&metrics(24.5), true);

        let summary = analytics.threat_summary();
        assert_eq!(summary.total_threats, 3);
        assert_eq!(summary.warning, 2);
        assert_eq!(summary.critical, 1);
        let last = summary.recent.last().unwrap();
        assert_eq!(last.kind, "HIGH_QBER");
        assert_eq!(last.severity, Severity::Critical);
        assert_eq!(last.details.as_ref().unwrap()["qber"], 24.5);
    }

    #[test]
    fn averages_cover_last_n_sessions() {
        let mut analytics = SecurityAnalytics::default();
        assert_eq!(analytics.average_qber(10), 0.0);
        assert_eq!(analytics.average_fidelity(10), 0.0);

        for qber in [40.0, 2.0, 4.0] {
            analytics.record_session(&metrics(qber), false);
        }
        assert!((analytics.average_qber(2) - 3.0).abs() < 1e-9);
        assert!((analytics.average_fidelity(2) - 97.0).abs() < 1e-9);
        assert!((analytics.average_qber(10) - 46.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn anomaly_needs_five_sessions() {
        let mut analytics = SecurityAnalytics::default();
        for _ in 0..4 {
            analytics.record_session(&metrics(0.0), false);
            assert!(!analytics.detect_anomaly(100.0));
        }
        analytics.record_session(&metrics(0.0), false);
        assert!(analytics.detect_anomaly(100.0));
        assert!(!analytics.detect_anomaly(0.0));
    }

    #[test]
    fn anomaly_uses_population_deviation() {
        let mut analytics = SecurityAnalytics::default();
        // mean 2, population std 1 -> cutoff 4
        for qber in [1.0, 3.0, 1.0, 3.0, 1.0, 3.0] {
            analytics.record_session(&metrics(qber), false);
        }
        assert!(!analytics.detect_anomaly(4.0));
        assert!(analytics.detect_anomaly(4.01));
    }

    #[test]
    fn anomaly_window_ignores_older_sessions() {
        let mut analytics = SecurityAnalytics::default();
        for _ in 0..5 {
            analytics.record_session(&metrics(90.0), true);
        }
        for _ in 0..10 {
            analytics.record_session(&metrics(1.0), false);
        }
        assert!(analytics.detect_anomaly(1.5));
    }

    #[test]
    fn histories_stay_bounded() {
        let mut analytics = SecurityAnalytics::default();
        for i in 0..130 {
            analytics.record_session(&metrics(20.0 + (i % 3) as f64), true);
        }
        assert_eq!(analytics.session_count(), 130);
        assert_eq!(analytics.sessions().len(), 50);
        assert_eq!(analytics.threats().len(), 100);

        let dashboard = analytics.dashboard();
        assert_eq!(dashboard.total_sessions, 130);
        assert_eq!(dashboard.qber_history.len(), 20);
        assert_eq!(dashboard.fidelity_history.len(), 20);
        assert_eq!(dashboard.threat_summary.recent.len(), 5);
        // Last 20 of i in 110..130: qber 20 + (i % 3)
        assert_eq!(dashboard.qber_history.last().unwrap().value, 20.0 + (129 % 3) as f64);
    }

    #[test]
    fn empty_dashboard_is_well_formed() {
        let analytics = SecurityAnalytics::default();
        let dashboard = analytics.dashboard();
        assert_eq!(dashboard.total_sessions, 0);
        assert_eq!(dashboard.average_qber, 0.0);
        assert!(dashboard.threat_summary.recent.is_empty());
        assert!(dashboard.qber_history.is_empty());
    }

    #[test]
    fn dashboard_rounds_averages() {
        let mut analytics = SecurityAnalytics::default();
        analytics.record_session(&metrics(1.0 / 3.0), false);
        let dashboard = analytics.dashboard();
        assert_eq!(dashboard.average_qber, 0.33);
        assert_eq!(dashboard.average_fidelity, 99.67);
    }

    #[test]
    fn threat_event_serializes_type_field() {
        let event = ThreatEvent::new("KEY_REJECTED", Severity::Critical, "rejected");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "KEY_REJECTED");
        assert_eq!(json["severity"], "CRITICAL");
        assert!(json.get("details").is_none());
    }
}
