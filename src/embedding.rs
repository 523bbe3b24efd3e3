//! Deterministic text embedding for similarity comparison.
//!
//! Uses the hashing trick over word unigrams and bigrams: no model weights,
//! no network, and the same text maps to the same vector on every run and on
//! every host. That stability is what keeps persisted memory records
//! comparable across process restarts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed-length embedding vector.
///
/// Cosine similarity is the only comparison other components may use; the
/// raw layout is an implementation detail of the embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn zeros(dimension: usize) -> Self {
        Self(vec![0.0; dimension])
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.0 to
    /// everything, including themselves.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.0.len() != other.0.len() {
            return 0.0;
        }
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

/// Deterministic embedder over word features.
#[derive(Debug, Clone)]
pub struct CandidateEmbedder {
    dimension: usize,
}

impl CandidateEmbedder {
    pub fn new(dimension: usize) -> Self {
        debug_assert!(dimension > 0, "embedding dimension must be positive");
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed text into a unit-length vector. Empty or non-alphanumeric text
    /// yields the zero vector rather than an error.
    pub fn embed(&self, text: &str) -> Embedding {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Embedding::zeros(self.dimension);
        }

        let mut values = vec![0.0f32; self.dimension];
        for token in &tokens {
            self.accumulate(&mut values, token);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut values, &format!("{} {}", pair[0], pair[1]));
        }

        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        Embedding(values)
    }

    fn accumulate(&self, values: &mut [f32], feature: &str) {
        let digest = Sha256::digest(feature.as_bytes());
        let index = u64::from_le_bytes(digest[0..8].try_into().expect("digest is 32 bytes"));
        // A separate digest byte decides the sign so collisions cancel
        // rather than always reinforcing.
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        values[(index % self.dimension as u64) as usize] += sign;
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
