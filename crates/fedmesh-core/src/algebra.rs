//! Ciphertext algebra — the homomorphic capability the fabric consumes.
//!
//! The fabric never looks inside a ciphertext. It only asks the algebra to
//! encrypt a plaintext vector, combine ciphertexts linearly, move them to and
//! from text, and finally decrypt. Any additively homomorphic scheme with
//! plaintext scalar multiplication fits behind [`CiphertextAlgebra`].
//!
//! Two reference schemes live here:
//!   - [`PlainAlgebra`]: no encryption at all. Ciphertexts are the plaintext
//!     numbers. Used to check aggregation arithmetic.
//!   - [`SharedMaskAlgebra`]: additive masking with a pad derived from a seed
//!     shared by every participant. Linear, so it aggregates correctly, but it
//!     offers no protection against the coordinator colluding with anyone who
//!     holds the seed. Demonstration only.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Operations over opaque ciphertexts.
pub trait CiphertextAlgebra: Send + Sync + 'static {
    type Ciphertext: Clone + Send + Sync + std::fmt::Debug;

    fn encode_and_encrypt(&self, values: &[f64]) -> Result<Self::Ciphertext, AlgebraError>;

    fn decrypt_and_decode(&self, ciphertext: &Self::Ciphertext) -> Result<Vec<f64>, AlgebraError>;

    fn add(
        &self,
        lhs: &Self::Ciphertext,
        rhs: &Self::Ciphertext,
    ) -> Result<Self::Ciphertext, AlgebraError>;

    fn scalar_multiply(
        &self,
        ciphertext: &Self::Ciphertext,
        scalar: f64,
    ) -> Result<Self::Ciphertext, AlgebraError>;

    fn serialize(&self, ciphertext: &Self::Ciphertext) -> Result<String, AlgebraError>;

    fn deserialize(&self, text: &str) -> Result<Self::Ciphertext, AlgebraError>;

    /// Encrypt and serialize in one step.
    fn seal(&self, values: &[f64]) -> Result<String, AlgebraError> {
        let ciphertext = self.encode_and_encrypt(values)?;
        self.serialize(&ciphertext)
    }

    /// Deserialize and decrypt in one step.
    fn open(&self, text: &str) -> Result<Vec<f64>, AlgebraError> {
        let ciphertext = self.deserialize(text)?;
        self.decrypt_and_decode(&ciphertext)
    }
}

/// Homomorphic mean of serialized ciphertexts: fold with `add`, then scale by
/// `1 / n`. Returns the serialized aggregate.
pub fn mean<A: CiphertextAlgebra>(algebra: &A, serialized: &[&str]) -> Result<String, AlgebraError> {
    let (first, rest) = serialized.split_first().ok_or(AlgebraError::Empty)?;

    let mut acc = algebra.deserialize(first)?;
    for text in rest {
        let next = algebra.deserialize(text)?;
        acc = algebra.add(&acc, &next)?;
    }
    let scaled = algebra.scalar_multiply(&acc, 1.0 / serialized.len() as f64)?;
    algebra.serialize(&scaled)
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlgebraError {
    #[error("ciphertext lengths differ: {0} vs {1}")]
    LengthMismatch(usize, usize),

    #[error("malformed ciphertext encoding: {0}")]
    Malformed(String),

    #[error("no ciphertexts to aggregate")]
    Empty,
}

// ── Encoding helpers ─────────────────────────────────────────────────────────

fn encode_f64s(values: impl IntoIterator<Item = f64>) -> String {
    let bytes: Vec<u8> = values.into_iter().flat_map(f64::to_le_bytes).collect();
    hex::encode(bytes)
}

fn decode_f64s(text: &str) -> Result<Vec<f64>, AlgebraError> {
    let bytes = hex::decode(text).map_err(|e| AlgebraError::Malformed(e.to_string()))?;
    if bytes.len() % 8 != 0 {
        return Err(AlgebraError::Malformed(format!(
            "{} bytes is not a whole number of f64 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(c);
            f64::from_le_bytes(raw)
        })
        .collect())
}

fn zip_add(lhs: &[f64], rhs: &[f64]) -> Result<Vec<f64>, AlgebraError> {
    if lhs.len() != rhs.len() {
        return Err(AlgebraError::LengthMismatch(lhs.len(), rhs.len()));
    }
    Ok(lhs.iter().zip(rhs).map(|(a, b)| a + b).collect())
}

// ── PlainAlgebra ─────────────────────────────────────────────────────────────

/// Identity "encryption". Serialized form is hex of little-endian `f64`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAlgebra;

impl CiphertextAlgebra for PlainAlgebra {
    type Ciphertext = Vec<f64>;

    fn encode_and_encrypt(&self, values: &[f64]) -> Result<Vec<f64>, AlgebraError> {
        Ok(values.to_vec())
    }

    fn decrypt_and_decode(&self, ciphertext: &Vec<f64>) -> Result<Vec<f64>, AlgebraError> {
        Ok(ciphertext.clone())
    }

    fn add(&self, lhs: &Vec<f64>, rhs: &Vec<f64>) -> Result<Vec<f64>, AlgebraError> {
        zip_add(lhs, rhs)
    }

    fn scalar_multiply(&self, ciphertext: &Vec<f64>, scalar: f64) -> Result<Vec<f64>, AlgebraError> {
        Ok(ciphertext.iter().map(|v| v * scalar).collect())
    }

    fn serialize(&self, ciphertext: &Vec<f64>) -> Result<String, AlgebraError> {
        Ok(encode_f64s(ciphertext.iter().copied()))
    }

    fn deserialize(&self, text: &str) -> Result<Vec<f64>, AlgebraError> {
        decode_f64s(text)
    }
}

// ── SharedMaskAlgebra ────────────────────────────────────────────────────────

/// Range of each pad element.
const MASK_RANGE: f64 = 1_000.0;

/// Additive masking keyed by a shared seed.
///
/// `enc(x) = x + pad`, carrying a pad weight of 1. Adding ciphertexts adds
/// their weights, scaling scales the weight, and decryption subtracts
/// `weight * pad`. The pad is regenerated from the seed for each length.
#[derive(Debug, Clone)]
pub struct SharedMaskAlgebra {
    seed: u64,
}

/// Masked values plus the multiple of the pad they currently contain.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedVector {
    pub values: Vec<f64>,
    pub pad_weight: f64,
}

impl SharedMaskAlgebra {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn pad(&self, len: usize) -> Vec<f64> {
        let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
        (0..len)
            .map(|_| rng.gen_range(-MASK_RANGE..MASK_RANGE))
            .collect()
    }
}

impl CiphertextAlgebra for SharedMaskAlgebra {
    type Ciphertext = MaskedVector;

    fn encode_and_encrypt(&self, values: &[f64]) -> Result<MaskedVector, AlgebraError> {
        let pad = self.pad(values.len());
        Ok(MaskedVector {
            values: zip_add(values, &pad)?,
            pad_weight: 1.0,
        })
    }

    fn decrypt_and_decode(&self, ciphertext: &MaskedVector) -> Result<Vec<f64>, AlgebraError> {
        let pad = self.pad(ciphertext.values.len());
        Ok(ciphertext
            .values
            .iter()
            .zip(pad)
            .map(|(v, p)| v - ciphertext.pad_weight * p)
            .collect())
    }

    fn add(&self, lhs: &MaskedVector, rhs: &MaskedVector) -> Result<MaskedVector, AlgebraError> {
        Ok(MaskedVector {
            values: zip_add(&lhs.values, &rhs.values)?,
            pad_weight: lhs.pad_weight + rhs.pad_weight,
        })
    }

    fn scalar_multiply(
        &self,
        ciphertext: &MaskedVector,
        scalar: f64,
    ) -> Result<MaskedVector, AlgebraError> {
        Ok(MaskedVector {
            values: ciphertext.values.iter().map(|v| v * scalar).collect(),
            pad_weight: ciphertext.pad_weight * scalar,
        })
    }

    /// Layout: pad weight first, then the values, all as little-endian `f64`.
    fn serialize(&self, ciphertext: &MaskedVector) -> Result<String, AlgebraError> {
        Ok(encode_f64s(
            std::iter::once(ciphertext.pad_weight).chain(ciphertext.values.iter().copied()),
        ))
    }

    fn deserialize(&self, text: &str) -> Result<MaskedVector, AlgebraError> {
        let mut raw = decode_f64s(text)?;
        if raw.is_empty() {
            return Err(AlgebraError::Malformed("missing pad weight".into()));
        }
        let pad_weight = raw.remove(0);
        Ok(MaskedVector {
            values: raw,
            pad_weight,
        })
    }
}
