use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub type IdentityId = i64;
pub type EmbeddingId = i64;
pub type AttendanceId = i64;

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero-magnitude
    /// vector on either side yields 0.0.
    ///
    /// Sums run in f64 so large finite components cannot overflow to NaN.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(a), f64::from(b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 && denom.is_finite() {
            (dot / denom).clamp(-1.0, 1.0) as f32
        } else {
            0.0
        }
    }

    /// L2 magnitude of the vector.
    pub fn norm(&self) -> f32 {
        self.values
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt() as f32
    }
}

/// Lifecycle status of an enrolled person. Identities are deactivated,
/// never deleted, so historical attendance keeps its references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Inactive,
}

impl IdentityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// An enrolled person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub department: Option<String>,
    pub status: IdentityStatus,
    pub created_at: NaiveDateTime,
}

/// A stored embedding owned by one identity. Only the primary record takes
/// part in matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: EmbeddingId,
    pub identity_id: IdentityId,
    pub embedding: Embedding,
    pub primary: bool,
    pub created_at: NaiveDateTime,
}

/// One gallery row: an active identity and its primary embedding.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub embedding: Embedding,
}

/// Status derived from check-in time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Late => "late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "late" => Some(Self::Late),
            _ => None,
        }
    }
}

/// How a check-in or check-out was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMethod {
    FaceRecognition,
    Manual,
}

impl CheckMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FaceRecognition => "face_recognition",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "face_recognition" => Some(Self::FaceRecognition),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// One workday span for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: AttendanceId,
    pub identity_id: IdentityId,
    pub date: NaiveDate,
    pub check_in: Option<NaiveDateTime>,
    pub check_out: Option<NaiveDateTime>,
    pub status: AttendanceStatus,
    pub total_hours: Option<f64>,
    pub check_in_method: CheckMethod,
    pub check_out_method: Option<CheckMethod>,
}

impl AttendanceRecord {
    /// A span is open until it has a check-out timestamp.
    pub fn is_open(&self) -> bool {
        self.check_out.is_none()
    }
}

/// Requested attendance transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CheckIn,
    CheckOut,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::CheckOut => "check_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "check_in" | "checkin" | "in" => Some(Self::CheckIn),
            "check_out" | "checkout" | "out" => Some(Self::CheckOut),
            _ => None,
        }
    }
}

/// Classification of a recognition attempt for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Recognized,
    Unknown,
    ValidationFailed,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recognized => "recognized",
            Self::Unknown => "unknown",
            Self::ValidationFailed => "validation_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recognized" => Some(Self::Recognized),
            "unknown" => Some(Self::Unknown),
            "validation_failed" => Some(Self::ValidationFailed),
            _ => None,
        }
    }
}

/// Face bounding box reported by the upstream detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Immutable audit entry written for every matching attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionAttempt {
    pub identity_id: Option<IdentityId>,
    pub similarity: f32,
    pub outcome: AttemptOutcome,
    pub timestamp: NaiveDateTime,
    pub processing_ms: Option<u64>,
    pub face: Option<FaceBox>,
}
