//! Process-wide QKD context: key generation, the QBER-gated cipher, attack
//! simulation, and status snapshots.
//!
//! Locking: the simulation RNG mutex is held for a whole generation run, so
//! at most one run mutates engine-derived and analytics state at a time. The
//! cipher mutex covers each complete `set_key`, `encrypt` and `decrypt`, and
//! is also held while a run publishes its QBER, so the compromise gate and
//! the decrypt it guards see one QBER. Queries take short read locks and
//! return owned copies.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::analytics::{DashboardStats, SecurityAnalytics, Severity, ThreatEvent, round2};
use crate::cipher::{EncryptionEnvelope, KeyStats, QuantumCipher};
use crate::config::{AnalyticsConfig, ServiceConfig};
use crate::eve::{AttackStats, AttackStrategy};
use crate::history::BoundedLog;
use crate::protocol::{Bb84Session, KeyOutcome, ProtocolMetrics, ProtocolTranscript, RejectReason};
use crate::QkdError;

/// Simulated attack settings consumed by the next generation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackConfig {
    pub eve_active: bool,
    pub strategy: AttackStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Success,
    Rejected,
}

/// Outcome of [`QkdService::generate_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyGenerationReport {
    pub status: KeyStatus,
    pub metrics: ProtocolMetrics,
    pub final_key_length: usize,
    pub eve_detected: bool,
    pub anomaly_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_stats: Option<AttackStats>,
    pub transcript: ProtocolTranscript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Low,
    Elevated,
    Critical,
}

impl ThreatLevel {
    /// Classifies a QBER (percent) against the analytics warning and critical levels.
    pub fn from_qber(qber: f64, config: &AnalyticsConfig) -> Self {
        if qber > config.critical_qber {
            ThreatLevel::Critical
        } else if qber > config.warning_qber {
            ThreatLevel::Elevated
        } else {
            ThreatLevel::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Active,
    #[serde(rename = "none")]
    Inactive,
}

/// Snapshot returned by [`QkdService::security_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub qber: f64,
    pub eve_active: bool,
    pub eve_strategy: Option<AttackStrategy>,
    pub key_status: KeyState,
    pub threat_level: ThreatLevel,
    pub recent_events: Vec<ThreatEvent>,
    pub dashboard: DashboardStats,
    pub key_stats: KeyStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyHistoryReport {
    pub events: Vec<ThreatEvent>,
    pub key_stats: KeyStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub qkd: String,
    pub encryption: String,
    pub analytics: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub services: ServiceHealth,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    /// QBER of the most recent run, in percent.
    qber: f64,
    attack: AttackConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Shared QKD service context. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct QkdService {
    config: ServiceConfig,
    rng: Mutex<StdRng>,
    channel: RwLock<ChannelState>,
    analytics: RwLock<SecurityAnalytics>,
    cipher: Mutex<QuantumCipher>,
    events: RwLock<BoundedLog<ThreatEvent>>,
}

impl Default for QkdService {
    fn default() -> Self {
        Self::from_rng(ServiceConfig::default(), StdRng::from_os_rng())
    }
}

impl QkdService {
    /// Creates a service with an OS-seeded simulation RNG.
    pub fn new(config: ServiceConfig) -> Result<Self, QkdError> {
        config.validate()?;
        Ok(Self::from_rng(config, StdRng::from_os_rng()))
    }

    /// Creates a service whose simulation is reproducible from `seed`.
    pub fn with_seed(config: ServiceConfig, seed: u64) -> Result<Self, QkdError> {
        config.validate()?;
        Ok(Self::from_rng(config, StdRng::seed_from_u64(seed)))
    }

    fn from_rng(config: ServiceConfig, rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
            channel: RwLock::new(ChannelState::default()),
            analytics: RwLock::new(SecurityAnalytics::new(config.analytics.clone())),
            cipher: Mutex::new(QuantumCipher::new(config.key_history)),
            events: RwLock::new(BoundedLog::new(config.event_log)),
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// QBER of the most recent run (0 before any run).
    pub fn current_qber(&self) -> f64 {
        read(&self.channel).qber
    }

    pub fn attack_config(&self) -> AttackConfig {
        read(&self.channel).attack
    }

    fn log_event(&self, event: ThreatEvent) {
        write(&self.events).push(event);
    }

    /// Runs BB84 with the current attack configuration and the configured
    /// default key length.
    pub fn generate_default_key(&self) -> Result<KeyGenerationReport, QkdError> {
        self.generate_key(self.config.default_key_length)
    }

    /// Runs BB84 with the current attack configuration.
    pub fn generate_key(&self, key_length: usize) -> Result<KeyGenerationReport, QkdError> {
        let attack = self.attack_config();
        self.generate_key_with(key_length, attack)
    }

    /// Runs BB84 with an explicit attack configuration.
    ///
    /// # Arguments
    /// * `key_length`: Qubits to send; must be greater than zero.
    /// * `attack`: Whether an interceptor is active, and its strategy.
    ///
    /// # Returns
    /// * `Ok(KeyGenerationReport)` for both accepted and rejected runs. An
    ///   accepted key replaces the cipher key; a rejected run leaves it alone.
    /// * `Err(QkdError::InvalidKeyLength)` if `key_length` is zero.
    pub fn generate_key_with(
        &self,
        key_length: usize,
        attack: AttackConfig,
    ) -> Result<KeyGenerationReport, QkdError> {
        let mut rng = lock(&self.rng);

        let strategy = attack.eve_active.then_some(attack.strategy);
        let mut session = Bb84Session::execute(key_length, strategy, &mut *rng)?;

        let attack_stats = session.attack_stats();
        if let Some(stats) = &attack_stats {
            warn!(strategy = %stats.strategy, intercepted = stats.qubits_intercepted, "eavesdropper intercepted transmission");
            self.log_event(
                ThreatEvent::new(
                    "EAVESDROP_ATTEMPT",
                    Severity::High,
                    format!("Eve intercepted transmission using {} strategy", stats.strategy),
                )
                .with_details(serde_json::to_value(stats)?),
            );
        }

        let metrics = session.metrics();
        let qber = metrics.qber;
        {
            // Decrypt checks the gate under the same lock.
            let _cipher = lock(&self.cipher);
            write(&self.channel).qber = qber;
        }

        let anomaly_detected = {
            let mut analytics = write(&self.analytics);
            let anomaly = analytics.detect_anomaly(qber);
            analytics.record_session(&metrics, attack.eve_active);
            anomaly
        };
        if anomaly_detected {
            warn!(qber, "QBER anomaly against recent sessions");
            let event = ThreatEvent::new(
                "QBER_ANOMALY",
                Severity::Warning,
                format!("QBER {qber:.2}% deviates from recent sessions"),
            )
            .with_details(json!({ "qber": qber }));
            write(&self.analytics).record_threat(event.clone());
            self.log_event(event);
        }

        let outcome = session.final_key(self.config.test_fraction, self.config.qber_threshold);
        let status = match &outcome {
            KeyOutcome::Accepted(bits) => {
                lock(&self.cipher).set_key(bits);
                info!(qber, final_key_length = bits.len(), "quantum key accepted");
                self.log_event(ThreatEvent::new(
                    "KEY_GENERATED",
                    Severity::Info,
                    format!("Quantum key generated successfully (length: {})", bits.len()),
                ));
                KeyStatus::Success
            }
            KeyOutcome::Rejected(reason) => {
                warn!(qber, ?reason, "quantum key rejected");
                let message = match reason {
                    RejectReason::QberAboveThreshold { .. } => format!("Key rejected due to high QBER: {qber:.2}%"),
                    RejectReason::NoSiftedBits | RejectReason::EmptyKey => {
                        "Key rejected, no key bits remained after sifting".to_string()
                    }
                };
                self.log_event(
                    ThreatEvent::new("KEY_REJECTED", Severity::Critical, message)
                        .with_details(serde_json::to_value(reason)?),
                );
                KeyStatus::Rejected
            }
        };

        Ok(KeyGenerationReport {
            status,
            final_key_length: outcome.key().len(),
            eve_detected: attack.eve_active && qber > self.config.qber_threshold,
            anomaly_detected,
            attack_stats,
            transcript: session.transcript(self.config.transcript_len),
            metrics,
        })
    }

    /// Encrypts raw bytes with the current key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptionEnvelope, QkdError> {
        let envelope = lock(&self.cipher).encrypt(plaintext)?;
        self.log_event(ThreatEvent::new("RECORD_ENCRYPTED", Severity::Info, "Record encrypted"));
        Ok(envelope)
    }

    /// Encrypts a serializable record as canonical JSON.
    pub fn encrypt_record<T: Serialize + ?Sized>(&self, record: &T) -> Result<EncryptionEnvelope, QkdError> {
        let envelope = lock(&self.cipher).encrypt_record(record)?;
        self.log_event(ThreatEvent::new("RECORD_ENCRYPTED", Severity::Info, "Record encrypted"));
        Ok(envelope)
    }

    /// Refuses to proceed while the latest QBER is above threshold.
    ///
    /// Callers hold the cipher lock, which is also held whenever a run
    /// publishes its QBER.
    fn check_channel(&self) -> Result<(), QkdError> {
        let qber = self.current_qber();
        let threshold = self.config.qber_threshold;
        if qber > threshold {
            warn!(qber, "decryption blocked, channel compromised");
            self.log_event(
                ThreatEvent::new(
                    "DECRYPTION_BLOCKED",
                    Severity::Critical,
                    format!("Decryption blocked due to compromised key (QBER: {qber:.2}%)"),
                )
                .with_details(json!({ "qber": qber, "security_status": "COMPROMISED" })),
            );
            return Err(QkdError::CompromisedChannel { qber, threshold });
        }
        Ok(())
    }

    /// Decrypts an envelope, subject to the compromise gate.
    ///
    /// # Returns
    /// * `Ok(Vec<u8>)` with the plaintext.
    /// * `Err(QkdError::CompromisedChannel)` when the latest QBER exceeds the
    ///   threshold, even if a previously accepted key is still installed.
    /// * `Err(QkdError::NoKey)` or `Err(QkdError::AuthenticationFailure)` from the cipher.
    pub fn decrypt(&self, envelope: &EncryptionEnvelope) -> Result<Vec<u8>, QkdError> {
        let result = {
            let cipher = lock(&self.cipher);
            self.check_channel()?;
            cipher.decrypt(envelope)
        };
        match &result {
            Ok(_) => self.log_event(ThreatEvent::new("RECORD_DECRYPTED", Severity::Info, "Record decrypted")),
            Err(e) => self.log_event(ThreatEvent::new(
                "DECRYPTION_FAILED",
                Severity::Warning,
                format!("Decryption failed: {e}"),
            )),
        }
        result
    }

    /// Decrypts and deserializes a record, subject to the compromise gate.
    pub fn decrypt_record<T: DeserializeOwned>(&self, envelope: &EncryptionEnvelope) -> Result<T, QkdError> {
        let plaintext = self.decrypt(envelope)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Turns the simulated interceptor on or off for subsequent runs.
    ///
    /// Unknown strategy names are corrected to `random`.
    pub fn simulate_attack(&self, active: bool, strategy: &str) -> AttackConfig {
        let attack = AttackConfig {
            eve_active: active,
            strategy: AttackStrategy::from_name(strategy),
        };
        write(&self.channel).attack = attack;

        let (message, severity) = if active {
            (
                format!("Eavesdropping attack activated with {} strategy", attack.strategy),
                Severity::Warning,
            )
        } else {
            ("Eavesdropping attack deactivated".to_string(), Severity::Info)
        };
        info!(active, strategy = %attack.strategy, "attack simulation updated");
        self.log_event(ThreatEvent::new("ATTACK_SIMULATION", severity, message));
        attack
    }

    pub fn threat_level(&self) -> ThreatLevel {
        ThreatLevel::from_qber(self.current_qber(), &self.config.analytics)
    }

    pub fn dashboard(&self) -> DashboardStats {
        read(&self.analytics).dashboard()
    }

    pub fn key_stats(&self) -> KeyStats {
        lock(&self.cipher).key_stats()
    }

    pub fn security_status(&self) -> SecurityStatus {
        let channel = *read(&self.channel);
        let key_stats = self.key_stats();
        SecurityStatus {
            qber: round2(channel.qber),
            eve_active: channel.attack.eve_active,
            eve_strategy: channel.attack.eve_active.then_some(channel.attack.strategy),
            key_status: if key_stats.key_active { KeyState::Active } else { KeyState::Inactive },
            threat_level: ThreatLevel::from_qber(channel.qber, &self.config.analytics),
            recent_events: read(&self.events).snapshot_tail(self.config.recent_events),
            dashboard: self.dashboard(),
            key_stats,
        }
    }

    /// Full security event log and key statistics.
    pub fn key_history(&self) -> KeyHistoryReport {
        KeyHistoryReport {
            events: read(&self.events).snapshot(),
            key_stats: self.key_stats(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let encryption = if lock(&self.cipher).is_active() { "active" } else { "idle" };
        HealthReport {
            status: "healthy".into(),
            timestamp: Utc::now(),
            services: ServiceHealth {
                qkd: "operational".into(),
                encryption: encryption.into(),
                analytics: "operational".into(),
            },
        }
    }
}
