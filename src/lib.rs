//! Simulation of a BB84 quantum key distribution exchange with an optional
//! intercept-resend attacker, a QBER-gated symmetric cipher keyed from the
//! resulting bits, and rolling security analytics over successive runs.
//!
//! The [`QkdService`] context ties the pieces together the way a transport
//! layer consumes them: generate a key, encrypt and decrypt records with it,
//! toggle the simulated attack, and query a consistent status snapshot.

use thiserror::Error;

pub mod analytics;
pub mod cipher;
pub mod config;
pub mod eve;
pub mod history;
pub mod protocol;
pub mod qubit;
pub mod service;

pub use analytics::{DashboardStats, SecurityAnalytics, SessionRecord, Severity, ThreatEvent, ThreatSummary};
pub use cipher::{EncryptionEnvelope, KeyHistoryEntry, KeyStats, QuantumCipher};
pub use config::{AnalyticsConfig, ServiceConfig};
pub use eve::{AttackStats, AttackStrategy, Interceptor};
pub use history::BoundedLog;
pub use protocol::{Bb84Session, KeyOutcome, ProtocolMetrics, ProtocolPhase, RejectReason, SiftedKey};
pub use qubit::{Basis, QubitDescriptor, Receiver, Sender, measure};
pub use service::{
    AttackConfig, HealthReport, KeyGenerationReport, KeyHistoryReport, KeyState, KeyStatus, QkdService, SecurityStatus,
    ThreatLevel,
};

/// Highest QBER (percent) at which a sifted key is still accepted.
pub const QBER_THRESHOLD: f64 = 11.0;
/// QBER (percent) above which a run is reported as elevated.
pub const QBER_WARNING: f64 = 5.0;
/// Leading share of the sifted key discarded before use.
pub const DEFAULT_TEST_FRACTION: f64 = 0.5;
/// Number of key bits hashed into the symmetric key.
pub const KEY_BITS: usize = 32;

/// Error type for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum QkdError {
    /// A cryptographic operation was attempted before any key was accepted.
    #[error("no quantum key has been established")]
    NoKey,
    /// Envelope failed tag verification or could not be decoded.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),
    /// The AEAD refused to seal a plaintext.
    #[error("encryption failed: {0}")]
    Encryption(String),
    /// Decryption refused because the current channel is above threshold.
    #[error("decryption blocked, channel compromised (QBER {qber:.2}% > {threshold:.2}%)")]
    CompromisedChannel { qber: f64, threshold: f64 },
    #[error("key length must be greater than zero")]
    InvalidKeyLength,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
