// src/protocol/mod.rs
//! BB84 protocol engine: prepare, optionally intercept, measure, sift, and
//! decide whether the sifted key is usable.
//!
//! Acceptance is judged on the QBER of the *whole* sifted key, and the final
//! key is the tail of that same sifted key after discarding the leading
//! `test_fraction`. Estimation and key populations therefore overlap; this is
//! the simplified protocol the service exposes, not a hardened BB84.

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::eve::{AttackStats, AttackStrategy, Interceptor};
use crate::qubit::{Basis, Receiver, Sender};
use crate::{DEFAULT_TEST_FRACTION, QBER_THRESHOLD, QkdError};

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolPhase {
    Prepared,
    Intercepted,
    Measured,
    Sifted,
    Accepted,
    Rejected,
}

/// Borrowed view of the four parallel sequences of one run.
#[derive(Debug, Clone, Copy)]
pub struct KeyMaterial<'a> {
    pub sender_bits: &'a [u8],
    pub sender_bases: &'a [Basis],
    pub receiver_bases: &'a [Basis],
    pub receiver_bits: &'a [u8],
}

impl KeyMaterial<'_> {
    pub fn len(&self) -> usize {
        self.sender_bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender_bits.is_empty()
    }
}

/// Basis-matched bits of both parties, in position order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiftedKey {
    pub sender: Vec<u8>,
    pub receiver: Vec<u8>,
}

impl SiftedKey {
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    /// Positions where the two sides disagree.
    pub fn mismatches(&self) -> usize {
        self.sender
            .iter()
            .zip(&self.receiver)
            .filter(|(a, b)| a != b)
            .count()
    }
}

/// Summary statistics for a run. Percentages are in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMetrics {
    pub raw_key_length: usize,
    pub sifted_key_length: usize,
    pub basis_matches: usize,
    pub basis_efficiency: f64,
    pub qber: f64,
    pub fidelity: f64,
    #[serde(with = "duration_secs")]
    pub execution_time: Duration,
}

/// Why a run produced no usable key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// No position survived sifting.
    NoSiftedBits,
    /// Channel error rate above the acceptance threshold.
    QberAboveThreshold { qber: f64, threshold: f64 },
    /// The test fraction consumed every sifted bit.
    EmptyKey,
}

/// Result of the acceptance decision.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    Accepted(Vec<u8>),
    Rejected(RejectReason),
}

impl KeyOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, KeyOutcome::Accepted(_))
    }

    /// Final key bits; empty when rejected.
    pub fn key(&self) -> &[u8] {
        match self {
            KeyOutcome::Accepted(bits) => bits,
            KeyOutcome::Rejected(_) => &[],
        }
    }
}

/// Leading slice of a run for display: raw sequences, which of those
/// positions matched, and the first sifted bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTranscript {
    pub sender_bits: Vec<u8>,
    pub sender_bases: Vec<Basis>,
    pub receiver_bases: Vec<Basis>,
    pub receiver_measurements: Vec<u8>,
    pub basis_matches: Vec<usize>,
    pub sifted_sender: Vec<u8>,
    pub sifted_receiver: Vec<u8>,
}

/// One complete BB84 run.
#[derive(Debug, Clone)]
pub struct Bb84Session {
    sender: Sender,
    receiver: Receiver,
    interceptor: Option<Interceptor>,
    sifted: SiftedKey,
    basis_matches: usize,
    phase: ProtocolPhase,
    execution_time: Duration,
}

impl Bb84Session {
    /// Runs sender → [interceptor] → receiver and sifts the result.
    ///
    /// # Arguments
    /// * `key_length`: Number of qubits to send. Must be greater than zero.
    /// * `attack`: Strategy of an active interceptor, or `None` for a clean channel.
    /// * `rng`: Every random draw of the run comes from here.
    ///
    /// # Returns
    /// * `Ok(Bb84Session)` in the `Sifted` phase.
    /// * `Err(QkdError::InvalidKeyLength)` if `key_length` is zero.
    pub fn execute<R: Rng + ?Sized>(
        key_length: usize,
        attack: Option<AttackStrategy>,
        rng: &mut R,
    ) -> Result<Self, QkdError> {
        if key_length == 0 {
            return Err(QkdError::InvalidKeyLength);
        }
        let started = Instant::now();

        // 1. Both parties commit to their random choices.
        let sender = Sender::generate(key_length, rng);
        let receiver = Receiver::generate(key_length, rng);
        let mut session = Self {
            sender,
            receiver,
            interceptor: None,
            sifted: SiftedKey::default(),
            basis_matches: 0,
            phase: ProtocolPhase::Prepared,
            execution_time: Duration::ZERO,
        };
        let mut qubits = session.sender.prepare();

        // 2. Optional intercept-resend.
        if let Some(strategy) = attack {
            let mut eve = Interceptor::new(strategy);
            qubits = eve.intercept(&qubits, rng);
            session.interceptor = Some(eve);
            session.phase = ProtocolPhase::Intercepted;
        }

        // 3. Receiver measures whatever arrived.
        session.receiver.measure(&qubits, rng);
        session.phase = ProtocolPhase::Measured;

        // 4. Public basis reconciliation.
        session.sift();
        session.execution_time = started.elapsed();

        debug!(
            key_length,
            sifted = session.sifted.len(),
            qber = session.qber(),
            intercepted = session.interceptor.is_some(),
            "bb84 run sifted"
        );
        Ok(session)
    }

    fn sift(&mut self) {
        let mut sifted = SiftedKey::default();
        let positions = self
            .sender
            .bases()
            .iter()
            .zip(self.receiver.bases())
            .enumerate()
            .filter(|(_, (a, b))| a == b)
            .map(|(i, _)| i);
        for i in positions {
            sifted.sender.push(self.sender.bits()[i]);
            sifted.receiver.push(self.receiver.measurements()[i]);
        }
        self.basis_matches = sifted.len();
        self.sifted = sifted;
        self.phase = ProtocolPhase::Sifted;
    }

    pub fn phase(&self) -> ProtocolPhase {
        self.phase
    }

    pub fn key_length(&self) -> usize {
        self.sender.len()
    }

    pub fn material(&self) -> KeyMaterial<'_> {
        KeyMaterial {
            sender_bits: self.sender.bits(),
            sender_bases: self.sender.bases(),
            receiver_bases: self.receiver.bases(),
            receiver_bits: self.receiver.measurements(),
        }
    }

    pub fn sifted(&self) -> &SiftedKey {
        &self.sifted
    }

    pub fn basis_matches(&self) -> usize {
        self.basis_matches
    }

    pub fn interceptor(&self) -> Option<&Interceptor> {
        self.interceptor.as_ref()
    }

    pub fn attack_stats(&self) -> Option<AttackStats> {
        self.interceptor.as_ref().map(Interceptor::attack_stats)
    }

    /// Percentage of sifted positions where the parties disagree; 0 if none sifted.
    pub fn qber(&self) -> f64 {
        if self.sifted.is_empty() {
            return 0.0;
        }
        100.0 * self.sifted.mismatches() as f64 / self.sifted.len() as f64
    }

    pub fn fidelity(&self) -> f64 {
        100.0 - self.qber()
    }

    /// Percentage of raw positions that survived sifting.
    pub fn basis_efficiency(&self) -> f64 {
        100.0 * self.basis_matches as f64 / self.key_length() as f64
    }

    /// Applies the acceptance threshold and extracts the final key.
    ///
    /// # Arguments
    /// * `test_fraction`: Leading share of the sifted key to discard.
    /// * `threshold`: Highest QBER (percent) that still yields a key.
    ///
    /// # Returns
    /// * `KeyOutcome::Accepted` with `sifted_sender[floor(len * test_fraction)..]`
    ///   when `qber() <= threshold` and that tail is non-empty.
    /// * `KeyOutcome::Rejected` otherwise. The session phase follows the outcome.
    pub fn final_key(&mut self, test_fraction: f64, threshold: f64) -> KeyOutcome {
        if self.sifted.is_empty() {
            self.phase = ProtocolPhase::Rejected;
            return KeyOutcome::Rejected(RejectReason::NoSiftedBits);
        }
        let test_length = (self.sifted.len() as f64 * test_fraction).floor() as usize;
        let qber = self.qber();
        if qber > threshold {
            self.phase = ProtocolPhase::Rejected;
            return KeyOutcome::Rejected(RejectReason::QberAboveThreshold { qber, threshold });
        }
        let start = test_length.min(self.sifted.len());
        if start == self.sifted.len() {
            self.phase = ProtocolPhase::Rejected;
            return KeyOutcome::Rejected(RejectReason::EmptyKey);
        }
        self.phase = ProtocolPhase::Accepted;
        KeyOutcome::Accepted(self.sifted.sender[start..].to_vec())
    }

    /// [`Bb84Session::final_key`] with the standard 0.5 fraction and 11 % threshold.
    pub fn default_final_key(&mut self) -> KeyOutcome {
        self.final_key(DEFAULT_TEST_FRACTION, QBER_THRESHOLD)
    }

    pub fn metrics(&self) -> ProtocolMetrics {
        ProtocolMetrics {
            raw_key_length: self.key_length(),
            sifted_key_length: self.sifted.len(),
            basis_matches: self.basis_matches,
            basis_efficiency: self.basis_efficiency(),
            qber: self.qber(),
            fidelity: self.fidelity(),
            execution_time: self.execution_time,
        }
    }

    /// The first `limit` positions of the run, and the first `limit / 2`
    /// sifted bits of each side.
    pub fn transcript(&self, limit: usize) -> ProtocolTranscript {
        let n = limit.min(self.key_length());
        let material = self.material();
        let sifted_n = (limit / 2).min(self.sifted.len());
        ProtocolTranscript {
            sender_bits: material.sender_bits[..n].to_vec(),
            sender_bases: material.sender_bases[..n].to_vec(),
            receiver_bases: material.receiver_bases[..n].to_vec(),
            receiver_measurements: material.receiver_bits[..n].to_vec(),
            basis_matches: (0..n)
                .filter(|&i| material.sender_bases[i] == material.receiver_bases[i])
                .collect(),
            sifted_sender: self.sifted.sender[..sifted_n].to_vec(),
            sifted_receiver: self.sifted.receiver[..sifted_n].to_vec(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn run(seed: u64, key_length: usize, attack: Option<AttackStrategy>) -> Bb84Session {
        let mut rng = StdRng::seed_from_u64(seed);
        Bb84Session::execute(key_length, attack, &mut rng).expect("run should succeed")
    }

    #[test]
    fn zero_length_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let result = Bb84Session::execute(0, None, &mut rng);
        assert!(matches!(result, Err(QkdError::InvalidKeyLength)));
    }

    #[test]
    fn runs_are_reproducible_from_seed() {
        let a = run(42, 256, Some(AttackStrategy::Random));
        let b = run(42, 256, Some(AttackStrategy::Random));
        assert_eq!(a.sifted(), b.sifted());
        assert_eq!(a.material().receiver_bits, b.material().receiver_bits);
    }

    #[test]
    fn sifting_keeps_only_matched_positions_in_order() {
        let session = run(3, 300, None);
        let material = session.material();
        let expected: Vec<u8> = (0..material.len())
            .filter(|&i| material.sender_bases[i] == material.receiver_bases[i])
            .map(|i| material.sender_bits[i])
            .collect();
        assert_eq!(session.sifted().sender, expected);
        assert_eq!(session.sifted().len(), session.sifted().receiver.len());
        assert_eq!(session.basis_matches(), expected.len());
        assert_eq!(session.phase(), ProtocolPhase::Sifted);
    }

    #[test]
    fn clean_channel_has_zero_qber() {
        for seed in 0..10 {
            let session = run(seed, 500, None);
            assert_eq!(session.qber(), 0.0);
            assert_eq!(session.fidelity(), 100.0);
        }
    }

    #[test]
    fn intercept_resend_induces_quarter_error_rate() {
        for strategy in [AttackStrategy::Random, AttackStrategy::ZOnly, AttackStrategy::XOnly] {
            let mut total = 0.0;
            for seed in 0..20 {
                let session = run(seed, 2000, Some(strategy));
                let qber = session.qber();
                // ~1000 sifted bits: a standard deviation of about 1.4 points.
                assert!((19.0..=31.0).contains(&qber), "{strategy} seed {seed}: qber {qber}");
                assert_eq!(session.attack_stats().map(|s| s.qubits_intercepted), Some(2000));
                total += qber;
            }
            let mean = total / 20.0;
            assert!((23.0..=27.0).contains(&mean), "{strategy}: mean qber {mean}");
        }
    }

    #[test]
    fn sifted_length_is_about_half() {
        let session = run(8, 2000, None);
        let efficiency = session.basis_efficiency();
        assert!((45.0..=55.0).contains(&efficiency), "efficiency {efficiency}");
    }

    #[test]
    fn final_key_is_tail_of_sifted_sender() {
        let mut session = run(21, 200, None);
        let sifted = session.sifted().sender.clone();
        let outcome = session.final_key(0.5, 11.0);
        let test_length = sifted.len() / 2;
        assert_eq!(outcome.key(), &sifted[test_length..]);
        assert_eq!(session.phase(), ProtocolPhase::Accepted);
    }

    #[test]
    fn final_key_rejected_above_threshold() {
        let mut session = run(5, 2000, Some(AttackStrategy::Random));
        let outcome = session.default_final_key();
        assert!(!outcome.is_accepted());
        assert!(outcome.key().is_empty());
        assert!(matches!(
            outcome,
            KeyOutcome::Rejected(RejectReason::QberAboveThreshold { .. })
        ));
        assert_eq!(session.phase(), ProtocolPhase::Rejected);
    }

    #[test]
    fn fraction_consuming_every_bit_is_rejected() {
        let mut session = run(21, 200, None);
        assert!(!session.sifted().is_empty());
        assert_eq!(session.qber(), 0.0);
        for fraction in [1.0, 1.5] {
            let outcome = session.final_key(fraction, 11.0);
            assert_eq!(outcome, KeyOutcome::Rejected(RejectReason::EmptyKey));
            assert!(outcome.key().is_empty());
            assert_eq!(session.phase(), ProtocolPhase::Rejected);
        }
        // Any fraction below one leaves at least one bit.
        let outcome = session.final_key(0.999, 11.0);
        assert!(outcome.is_accepted());
        assert!(!outcome.key().is_empty());
    }

    #[test]
    fn final_key_respects_custom_threshold() {
        let mut session = run(5, 2000, Some(AttackStrategy::Random));
        assert!(session.final_key(0.5, 100.0).is_accepted());
    }

    #[test]
    fn single_qubit_run_can_sift_nothing() {
        // Find a seed whose only position is unmatched.
        let mut session = (0..64)
            .map(|seed| run(seed, 1, None))
            .find(|session| session.sifted().is_empty())
            .expect("some seed mismatches the single basis");
        assert_eq!(session.qber(), 0.0);
        assert_eq!(session.default_final_key(), KeyOutcome::Rejected(RejectReason::NoSiftedBits));
    }

    #[test]
    fn metrics_are_consistent() {
        let session = run(9, 100, None);
        let metrics = session.metrics();
        assert_eq!(metrics.raw_key_length, 100);
        assert_eq!(metrics.sifted_key_length, session.sifted().len());
        assert_eq!(metrics.basis_matches, metrics.sifted_key_length);
        assert!((metrics.qber + metrics.fidelity - 100.0).abs() < f64::EPSILON);
        assert!((0.0..=100.0).contains(&metrics.qber));
    }

    #[test]
    fn transcript_is_truncated() {
        let session = run(10, 100, None);
        let transcript = session.transcript(20);
        assert_eq!(transcript.sender_bits.len(), 20);
        assert_eq!(transcript.receiver_bases.len(), 20);
        assert!(transcript.sifted_sender.len() <= 10);
        assert!(transcript.basis_matches.iter().all(|&i| i < 20));

        let short = run(10, 4, None).transcript(20);
        assert_eq!(short.sender_bits.len(), 4);
    }
}
