// src/eve/mod.rs
//! Intercept-resend eavesdropper.
//!
//! The interceptor sits between sender and receiver, measures every qubit in a
//! basis picked by its strategy, and forwards a freshly prepared qubit that
//! encodes its own outcome in its own basis. Whenever that basis differs from
//! the sender's, the receiver sees a coin flip on a position that later
//! survives sifting, which is what raises the QBER to about 25 %.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::qubit::{Basis, QubitDescriptor};

/// How the interceptor picks its measurement basis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackStrategy {
    /// Uniform basis choice per qubit.
    #[default]
    Random,
    /// Always the rectilinear (Z) basis.
    ZOnly,
    /// Always the diagonal (X) basis.
    XOnly,
}

impl AttackStrategy {
    /// Parses a strategy name. Unknown names fall back to [`AttackStrategy::Random`].
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "random" => AttackStrategy::Random,
            "z_only" => AttackStrategy::ZOnly,
            "x_only" => AttackStrategy::XOnly,
            other => {
                warn!(strategy = other, "unknown attack strategy, using random");
                AttackStrategy::Random
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttackStrategy::Random => "random",
            AttackStrategy::ZOnly => "z_only",
            AttackStrategy::XOnly => "x_only",
        }
    }

    /// Picks the basis for the next intercepted qubit.
    pub fn choose_basis<R: Rng + ?Sized>(self, rng: &mut R) -> Basis {
        match self {
            AttackStrategy::Random => rng.random::<Basis>(),
            AttackStrategy::ZOnly => Basis::Rectilinear,
            AttackStrategy::XOnly => Basis::Diagonal,
        }
    }
}

impl fmt::Display for AttackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one interception pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackStats {
    pub strategy: AttackStrategy,
    pub qubits_intercepted: usize,
    pub z_basis_used: usize,
    pub x_basis_used: usize,
}

/// An active eavesdropper performing intercept-resend.
#[derive(Debug, Clone)]
pub struct Interceptor {
    strategy: AttackStrategy,
    intercepted_bits: Vec<u8>,
    bases_used: Vec<Basis>,
}

impl Interceptor {
    pub fn new(strategy: AttackStrategy) -> Self {
        Self {
            strategy,
            intercepted_bits: Vec::new(),
            bases_used: Vec::new(),
        }
    }

    pub fn strategy(&self) -> AttackStrategy {
        self.strategy
    }

    /// Outcomes recorded during the last [`Interceptor::intercept`] call.
    pub fn intercepted_bits(&self) -> &[u8] {
        &self.intercepted_bits
    }

    pub fn bases_used(&self) -> &[Basis] {
        &self.bases_used
    }

    /// Measures and re-prepares every qubit.
    ///
    /// # Arguments
    /// * `qubits`: Qubits as sent by the sender, in position order.
    /// * `rng`: Drives basis choice (for `Random`) and mismatched outcomes.
    ///
    /// # Returns
    /// * The forwarded qubits, one per input, each encoding the intercepted
    ///   bit in the interceptor's basis. Earlier records are discarded.
    pub fn intercept<R: Rng + ?Sized>(
        &mut self,
        qubits: &[QubitDescriptor],
        rng: &mut R,
    ) -> Vec<QubitDescriptor> {
        self.intercepted_bits = Vec::with_capacity(qubits.len());
        self.bases_used = Vec::with_capacity(qubits.len());

        qubits
            .iter()
            .map(|qubit| {
                let basis = self.strategy.choose_basis(rng);
                let bit = qubit.measure(basis, rng);
                self.bases_used.push(basis);
                self.intercepted_bits.push(bit);
                // Re-encoded in Eve's basis, not the sender's.
                QubitDescriptor::new(bit, basis)
            })
            .collect()
    }

    pub fn attack_stats(&self) -> AttackStats {
        let z_basis_used = self
            .bases_used
            .iter()
            .filter(|&&basis| basis == Basis::Rectilinear)
            .count();
        AttackStats {
            strategy: self.strategy,
            qubits_intercepted: self.intercepted_bits.len(),
            z_basis_used,
            x_basis_used: self.bases_used.len() - z_basis_used,
        }
    }
}
