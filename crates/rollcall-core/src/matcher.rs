//! Gallery matching.
//!
//! The matcher is a pure function over a probe and a gallery snapshot.
//! Fetching the gallery is the caller's job.

use crate::types::{Embedding, GalleryEntry, IdentityId};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("probe embedding is empty")]
    EmptyProbe,
    #[error("probe embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("probe embedding contains a non-finite value at index {0}")]
    NonFinite(usize),
    #[error("similarity threshold {0} is outside [0, 1]")]
    ThresholdOutOfRange(f32),
    #[error("configured embedding dimension must be positive")]
    ZeroDimension,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Cosine similarity of the best gallery entry, even when below threshold.
    pub similarity: f32,
    /// Identity of the matched entry (if any).
    pub identity_id: Option<IdentityId>,
    /// Display name of the matched entry (if any).
    pub display_name: Option<String>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            similarity,
            identity_id: None,
            display_name: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// The linear [`CosineMatcher`] is adequate for tens to low hundreds of
/// identities; an indexed nearest-neighbour structure can replace it behind
/// this trait.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher with a full linear scan of the gallery.
///
/// Ties resolve to the first entry in gallery order. Callers that need a
/// stable winner must supply the gallery in a stable order.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.embedding.dim() != probe.dim() {
                tracing::warn!(
                    identity_id = entry.identity_id,
                    dim = entry.embedding.dim(),
                    expected = probe.dim(),
                    "skipping gallery entry with mismatched dimensionality"
                );
                continue;
            }
            let sim = probe.similarity(&entry.embedding);
            // Strict comparison keeps the first of several equal maxima.
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                similarity: best_sim,
                identity_id: Some(gallery[idx].identity_id),
                display_name: Some(gallery[idx].display_name.clone()),
            },
            Some(_) => MatchResult::no_match(best_sim),
            None => MatchResult::no_match(0.0),
        }
    }
}

/// Check a probe and threshold before any matching happens.
pub fn validate_probe(
    probe: &Embedding,
    expected_dim: usize,
    threshold: f32,
) -> Result<(), MatchError> {
    validate_threshold(threshold)?;
    validate_embedding(probe, expected_dim)
}

pub fn validate_threshold(threshold: f32) -> Result<(), MatchError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(MatchError::ThresholdOutOfRange(threshold));
    }
    Ok(())
}

/// Shape and finiteness check shared by probes and enrollment vectors.
pub fn validate_embedding(embedding: &Embedding, expected_dim: usize) -> Result<(), MatchError> {
    if embedding.values.is_empty() {
        return Err(MatchError::EmptyProbe);
    }
    if embedding.dim() != expected_dim {
        return Err(MatchError::DimensionMismatch {
            expected: expected_dim,
            actual: embedding.dim(),
        });
    }
    if let Some(idx) = embedding.values.iter().position(|v| !v.is_finite()) {
        return Err(MatchError::NonFinite(idx));
    }
    Ok(())
}
