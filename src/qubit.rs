//! Single-qubit preparation and measurement for the two conjugate BB84 bases.
//!
//! Only the measurement law matters for the protocol: measuring in the
//! preparation basis reproduces the prepared bit, measuring in the conjugate
//! basis yields a fair coin flip.

use std::fmt;

use rand::Rng;
use rand::distr::{Distribution, StandardUniform};
use serde::{Deserialize, Serialize};

/// Preparation or measurement basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Basis {
    /// Computational (Z) basis.
    #[serde(rename = "Z")]
    Rectilinear,
    /// Hadamard (X) basis.
    #[serde(rename = "X")]
    Diagonal,
}

impl Basis {
    /// Short label as used in transcripts (`Z` / `X`).
    pub fn label(self) -> char {
        match self {
            Basis::Rectilinear => 'Z',
            Basis::Diagonal => 'X',
        }
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Distribution<Basis> for StandardUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Basis {
        if rng.random::<bool>() {
            Basis::Diagonal
        } else {
            Basis::Rectilinear
        }
    }
}

/// Draws a uniform bit as `0` or `1`.
pub(crate) fn random_bit<R: Rng + ?Sized>(rng: &mut R) -> u8 {
    u8::from(rng.random::<bool>())
}

/// Measures a bit prepared in `prepared` using `measured_in`.
///
/// # Arguments
/// * `bit`: The prepared bit (`0` or `1`).
/// * `prepared`: Basis the bit was encoded in.
/// * `measured_in`: Basis used by the measuring party.
/// * `rng`: Source of the outcome when the bases disagree.
///
/// # Returns
/// * `bit` (any non-zero value read as `1`) when the bases agree, otherwise
///   an independent uniform bit.
pub fn measure<R: Rng + ?Sized>(bit: u8, prepared: Basis, measured_in: Basis, rng: &mut R) -> u8 {
    if prepared == measured_in {
        u8::from(bit != 0)
    } else {
        random_bit(rng)
    }
}

/// A prepared qubit travelling over the quantum channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QubitDescriptor {
    prepared_bit: u8,
    prepared_basis: Basis,
}

impl QubitDescriptor {
    /// Encodes `bit` in `basis`. Any non-zero `bit` is treated as `1`.
    pub fn new(bit: u8, basis: Basis) -> Self {
        Self {
            prepared_bit: u8::from(bit != 0),
            prepared_basis: basis,
        }
    }

    pub fn prepared_bit(&self) -> u8 {
        self.prepared_bit
    }

    pub fn prepared_basis(&self) -> Basis {
        self.prepared_basis
    }

    /// Measures this qubit in `basis`. See [`measure`].
    pub fn measure<R: Rng + ?Sized>(&self, basis: Basis, rng: &mut R) -> u8 {
        measure(self.prepared_bit, self.prepared_basis, basis, rng)
    }
}

/// The sending party: random bits, each encoded in a random basis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    bits: Vec<u8>,
    bases: Vec<Basis>,
}

impl Sender {
    /// Draws `n` independent uniform bits and bases.
    pub fn generate<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Self {
        let mut bits = Vec::with_capacity(n);
        let mut bases = Vec::with_capacity(n);
        for _ in 0..n {
            bits.push(random_bit(rng));
            bases.push(rng.random::<Basis>());
        }
        Self { bits, bases }
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    pub fn bases(&self) -> &[Basis] {
        &self.bases
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Pairs every bit with its basis, in position order.
    pub fn prepare(&self) -> Vec<QubitDescriptor> {
        self.bits
            .iter()
            .zip(&self.bases)
            .map(|(&bit, &basis)| QubitDescriptor::new(bit, basis))
            .collect()
    }
}

/// The receiving party: random measurement bases chosen up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receiver {
    bases: Vec<Basis>,
    measurements: Vec<u8>,
}

impl Receiver {
    /// Draws `n` uniform bases, independent of the sender's.
    pub fn generate<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Self {
        let bases = (0..n).map(|_| rng.random::<Basis>()).collect();
        Self {
            bases,
            measurements: Vec::new(),
        }
    }

    pub fn bases(&self) -> &[Basis] {
        &self.bases
    }

    /// Outcomes of the last [`Receiver::measure`] call; empty before it.
    pub fn measurements(&self) -> &[u8] {
        &self.measurements
    }

    /// Measures each incoming qubit in the receiver's basis for that position.
    ///
    /// Positions beyond the shorter of `qubits` and the chosen bases are
    /// ignored; the engine always passes equal lengths.
    pub fn measure<R: Rng + ?Sized>(&mut self, qubits: &[QubitDescriptor], rng: &mut R) -> &[u8] {
        self.measurements = qubits
            .iter()
            .zip(&self.bases)
            .map(|(qubit, &basis)| qubit.measure(basis, rng))
            .collect();
        &self.measurements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn matching_basis_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(7);
        for basis in [Basis::Rectilinear, Basis::Diagonal] {
            for bit in [0u8, 1] {
                for _ in 0..200 {
                    assert_eq!(measure(bit, basis, basis, &mut rng), bit);
                }
            }
        }
    }

    #[test]
    fn mismatched_basis_is_a_fair_coin() {
        let mut rng = StdRng::seed_from_u64(2024);
        let trials = 10_000;
        let ones: usize = (0..trials)
            .map(|_| measure(0, Basis::Rectilinear, Basis::Diagonal, &mut rng) as usize)
            .sum();
        let ratio = ones as f64 / trials as f64;
        assert!((0.45..=0.55).contains(&ratio), "ratio of ones was {ratio}");
    }

    #[test]
    fn sender_is_reproducible_from_seed() {
        let a = Sender::generate(64, &mut StdRng::seed_from_u64(99));
        let b = Sender::generate(64, &mut StdRng::seed_from_u64(99));
        let c = Sender::generate(64, &mut StdRng::seed_from_u64(100));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.bits().iter().all(|&bit| bit <= 1));
    }

    #[test]
    fn prepare_pairs_bits_with_bases() {
        let sender = Sender::generate(32, &mut StdRng::seed_from_u64(1));
        let qubits = sender.prepare();
        assert_eq!(qubits.len(), 32);
        for (i, qubit) in qubits.iter().enumerate() {
            assert_eq!(qubit.prepared_bit(), sender.bits()[i]);
            assert_eq!(qubit.prepared_basis(), sender.bases()[i]);
        }
    }

    #[test]
    fn receiver_recovers_bits_in_matching_positions() {
        let mut rng = StdRng::seed_from_u64(5);
        let sender = Sender::generate(500, &mut rng);
        let mut receiver = Receiver::generate(500, &mut rng);
        let qubits = sender.prepare();
        let measured = receiver.measure(&qubits, &mut rng).to_vec();
        assert_eq!(measured.len(), 500);
        for i in 0..500 {
            if sender.bases()[i] == receiver.bases()[i] {
                assert_eq!(measured[i], sender.bits()[i]);
            }
        }
    }

    #[test]
    fn measurement_outcomes_are_binary() {
        let mut rng = StdRng::seed_from_u64(3);
        for bit in [0u8, 1, 2, 5, 255] {
            let same = measure(bit, Basis::Rectilinear, Basis::Rectilinear, &mut rng);
            assert_eq!(same, u8::from(bit != 0));
            let other = measure(bit, Basis::Rectilinear, Basis::Diagonal, &mut rng);
            assert!(other <= 1);
        }
    }

    #[test]
    fn descriptor_normalizes_bit() {
        let qubit = QubitDescriptor::new(5, Basis::Diagonal);
        assert_eq!(qubit.prepared_bit(), 1);
        assert_eq!(Basis::Diagonal.to_string(), "X");
    }
}
