//! Recognition → attendance pipeline.
//!
//! Wires a [`Matcher`] and an [`AttendanceMachine`] to their collaborators.
//! Every matching attempt produces exactly one audit entry; a failing audit
//! sink is logged and otherwise ignored.

use crate::attendance::{
    AttendanceError, AttendanceMachine, AttendancePolicy, CheckedIn, CheckedOut, Transition,
};
use crate::matcher::{
    validate_probe, validate_threshold, CosineMatcher, MatchError, MatchResult, Matcher,
};
use crate::store::{AttendanceStore, AuditSink, GalleryProvider, StoreError};
use crate::types::{
    Action, AttemptOutcome, CheckMethod, Embedding, FaceBox, IdentityId, RecognitionAttempt,
};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;

/// ArcFace w600k_r50 output size.
pub const DEFAULT_EMBEDDING_DIM: usize = 512;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] MatchError),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable kind for callers on the other side of IPC.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "validation_failed",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::UnknownIdentity(_) => "unknown_identity",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<AttendanceError> for ServiceError {
    fn from(err: AttendanceError) -> Self {
        match err {
            AttendanceError::StorageUnavailable(msg) => Self::StorageUnavailable(msg),
            AttendanceError::UnknownIdentity(id) => Self::UnknownIdentity(id),
            AttendanceError::Storage(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::StorageUnavailable(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Tunables shared by every request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceConfig {
    pub similarity_threshold: f32,
    pub embedding_dim: usize,
    pub policy: AttendancePolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            policy: AttendancePolicy::default(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), MatchError> {
        validate_threshold(self.similarity_threshold)?;
        if self.embedding_dim == 0 {
            return Err(MatchError::ZeroDimension);
        }
        Ok(())
    }
}

/// A live embedding with optional detector metadata.
#[derive(Debug, Clone)]
pub struct Probe {
    pub embedding: Embedding,
    pub face: Option<FaceBox>,
}

impl Probe {
    pub fn new(embedding: Embedding) -> Self {
        Self {
            embedding,
            face: None,
        }
    }
}

/// Attendance half of a recognition report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AttendanceReport {
    CheckIn(Transition<CheckedIn>),
    CheckOut(Transition<CheckedOut>),
}

impl AttendanceReport {
    pub fn is_applied(&self) -> bool {
        match self {
            Self::CheckIn(t) => t.is_applied(),
            Self::CheckOut(t) => t.is_applied(),
        }
    }
}

/// Structured outcome of [`AttendanceService::recognize_and_record`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionReport {
    pub recognized: bool,
    pub identity_id: Option<IdentityId>,
    pub display_name: Option<String>,
    pub similarity: f32,
    pub timestamp: NaiveDateTime,
    /// `None` when the face was not recognized.
    pub attendance: Option<AttendanceReport>,
    pub message: String,
}

/// Matching and attendance with injected collaborators.
pub struct AttendanceService<G, S, A, M = CosineMatcher> {
    gallery: G,
    machine: AttendanceMachine<S>,
    audit: A,
    matcher: M,
    config: ServiceConfig,
}

impl<G, S, A> AttendanceService<G, S, A, CosineMatcher>
where
    G: GalleryProvider,
    S: AttendanceStore,
    A: AuditSink,
{
    pub fn new(gallery: G, store: S, audit: A, config: ServiceConfig) -> Self {
        Self::with_matcher(gallery, store, audit, CosineMatcher, config)
    }
}

impl<G, S, A, M> AttendanceService<G, S, A, M>
where
    G: GalleryProvider,
    S: AttendanceStore,
    A: AuditSink,
    M: Matcher,
{
    pub fn with_matcher(gallery: G, store: S, audit: A, matcher: M, config: ServiceConfig) -> Self {
        Self {
            gallery,
            machine: AttendanceMachine::new(store, config.policy),
            audit,
            matcher,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Resolve the probe to an identity without touching attendance.
    ///
    /// Still writes one audit entry.
    pub fn match_only(&self, probe: &Probe, at: NaiveDateTime) -> Result<MatchResult, ServiceError> {
        let started = Instant::now();
        let result = self.resolve(probe, at, started)?;
        let outcome = if result.is_match() {
            AttemptOutcome::Recognized
        } else {
            AttemptOutcome::Unknown
        };
        self.record_attempt(probe, result.identity_id, result.similarity, outcome, at, started);
        Ok(result)
    }

    /// Match the probe, then apply `action` for the matched identity.
    pub fn recognize_and_record(
        &self,
        probe: &Probe,
        action: Action,
        at: NaiveDateTime,
    ) -> Result<RecognitionReport, ServiceError> {
        let started = Instant::now();
        let result = self.resolve(probe, at, started)?;

        let (Some(identity_id), Some(name)) = (result.identity_id, result.display_name.clone())
        else {
            tracing::info!(similarity = result.similarity, "face not recognized");
            self.record_attempt(probe, None, result.similarity, AttemptOutcome::Unknown, at, started);
            return Ok(RecognitionReport {
                recognized: false,
                identity_id: None,
                display_name: None,
                similarity: result.similarity,
                timestamp: at,
                attendance: None,
                message: "Face not recognized. Please register first.".to_string(),
            });
        };

        let applied = self.apply(identity_id, action, at, CheckMethod::FaceRecognition);
        // The face was recognized whatever happened to the transition.
        self.record_attempt(
            probe,
            Some(identity_id),
            result.similarity,
            AttemptOutcome::Recognized,
            at,
            started,
        );
        let attendance = applied?;

        let message = match &attendance {
            AttendanceReport::CheckIn(Transition::Applied(_)) => {
                format!("Welcome {name}! Check-in recorded successfully.")
            }
            AttendanceReport::CheckOut(Transition::Applied(_)) => {
                format!("Goodbye {name}! Check-out recorded successfully.")
            }
            AttendanceReport::CheckIn(Transition::Rejected(r))
            | AttendanceReport::CheckOut(Transition::Rejected(r)) => format!("{name}: {}", r.message),
        };

        Ok(RecognitionReport {
            recognized: true,
            identity_id: Some(identity_id),
            display_name: Some(name),
            similarity: result.similarity,
            timestamp: at,
            attendance: Some(attendance),
            message,
        })
    }

    /// Apply a transition for a known identity without matching.
    pub fn record_manual(
        &self,
        identity_id: IdentityId,
        action: Action,
        at: NaiveDateTime,
    ) -> Result<AttendanceReport, ServiceError> {
        self.apply(identity_id, action, at, CheckMethod::Manual)
    }

    fn apply(
        &self,
        identity_id: IdentityId,
        action: Action,
        at: NaiveDateTime,
        method: CheckMethod,
    ) -> Result<AttendanceReport, ServiceError> {
        let report = match action {
            Action::CheckIn => {
                AttendanceReport::CheckIn(self.machine.request_check_in(identity_id, at, method)?)
            }
            Action::CheckOut => {
                AttendanceReport::CheckOut(self.machine.request_check_out(identity_id, at, method)?)
            }
        };
        Ok(report)
    }

    /// Validate, fetch the gallery and match. Validation failures are audited
    /// here; storage failures are not, since no match was attempted.
    fn resolve(
        &self,
        probe: &Probe,
        at: NaiveDateTime,
        started: Instant,
    ) -> Result<MatchResult, ServiceError> {
        if let Err(e) = validate_probe(
            &probe.embedding,
            self.config.embedding_dim,
            self.config.similarity_threshold,
        ) {
            tracing::info!(error = %e, "probe rejected");
            self.record_attempt(probe, None, 0.0, AttemptOutcome::ValidationFailed, at, started);
            return Err(e.into());
        }

        let gallery = self.gallery.fetch_active_gallery().map_err(|e| {
            tracing::error!(error = %e, "failed to fetch gallery");
            ServiceError::from(e)
        })?;

        let result = self
            .matcher
            .compare(&probe.embedding, &gallery, self.config.similarity_threshold);
        tracing::debug!(
            gallery = gallery.len(),
            similarity = result.similarity,
            identity_id = ?result.identity_id,
            "match complete"
        );
        Ok(result)
    }

    fn record_attempt(
        &self,
        probe: &Probe,
        identity_id: Option<IdentityId>,
        similarity: f32,
        outcome: AttemptOutcome,
        at: NaiveDateTime,
        started: Instant,
    ) {
        let attempt = RecognitionAttempt {
            identity_id,
            similarity,
            outcome,
            timestamp: at,
            processing_ms: Some(started.elapsed().as_millis() as u64),
            face: probe.face,
        };
        if let Err(e) = self.audit.append(&attempt) {
            tracing::warn!(
                error = %e,
                outcome = outcome.as_str(),
                "failed to append recognition attempt; continuing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::RejectionReason;
    use crate::testing::MemoryStore;
    use chrono::NaiveDate;
    use std::sync::Arc;

    type TestService = AttendanceService<Arc<MemoryStore>, Arc<MemoryStore>, Arc<MemoryStore>>;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn service(store: &Arc<MemoryStore>) -> TestService {
        let config = ServiceConfig {
            embedding_dim: 3,
            ..ServiceConfig::default()
        };
        AttendanceService::new(store.clone(), store.clone(), store.clone(), config)
    }

    fn probe(values: Vec<f32>) -> Probe {
        Probe::new(Embedding::new(values))
    }

    #[test]
    fn test_empty_gallery_is_unknown_with_zero_similarity() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(&store);

        let report = svc
            .recognize_and_record(&probe(vec![0.2, 0.4, 0.1]), Action::CheckIn, at(8, 0))
            .unwrap();
        assert!(!report.recognized);
        assert_eq!(report.similarity, 0.0);
        assert!(report.attendance.is_none());

        let attempts = store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Unknown);
        assert_eq!(attempts[0].identity_id, None);
    }

    #[test]
    fn test_recognized_check_in_and_out() {
        let store = Arc::new(MemoryStore::new());
        store.enroll(1, "Ada", vec![1.0, 0.0, 0.0]);
        store.enroll(2, "Grace", vec![0.0, 1.0, 0.0]);
        let svc = service(&store);

        let report = svc
            .recognize_and_record(&probe(vec![0.0, 0.98, 0.05]), Action::CheckIn, at(8, 30))
            .unwrap();
        assert!(report.recognized);
        assert_eq!(report.identity_id, Some(2));
        assert_eq!(report.message, "Welcome Grace! Check-in recorded successfully.");
        assert!(report.attendance.as_ref().is_some_and(|a| a.is_applied()));

        let report = svc
            .recognize_and_record(&probe(vec![0.0, 1.0, 0.0]), Action::CheckOut, at(16, 30))
            .unwrap();
        match report.attendance {
            Some(AttendanceReport::CheckOut(Transition::Applied(out))) => {
                assert_eq!(out.total_hours, 8.0)
            }
            other => panic!("unexpected attendance report: {other:?}"),
        }

        let attempts = store.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::Recognized));
        assert!(attempts.iter().all(|a| a.identity_id == Some(2)));
    }

    #[test]
    fn test_rejection_is_reported_and_audited() {
        let store = Arc::new(MemoryStore::new());
        store.enroll(1, "Ada", vec![1.0, 0.0, 0.0]);
        let svc = service(&store);

        let report = svc
            .recognize_and_record(&probe(vec![1.0, 0.0, 0.0]), Action::CheckOut, at(17, 0))
            .unwrap();
        assert!(report.recognized);
        let Some(AttendanceReport::CheckOut(t)) = &report.attendance else {
            panic!("expected a check-out report");
        };
        assert_eq!(t.rejection().map(|r| r.reason), Some(RejectionReason::NoCheckin));
        assert!(report.message.starts_with("Ada: "));
        assert_eq!(store.attempts().len(), 1);
    }

    #[test]
    fn test_below_threshold_reports_nearest_miss() {
        let store = Arc::new(MemoryStore::new());
        store.enroll(1, "Ada", vec![1.0, 1.0, 0.0]);
        let svc = service(&store);

        let report = svc
            .recognize_and_record(&probe(vec![1.0, 0.0, 0.0]), Action::CheckIn, at(8, 0))
            .unwrap();
        assert!(!report.recognized);
        assert!((report.similarity - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
        assert!(store.records().is_empty());
    }

    #[test]
    fn test_invalid_probe_is_audited_as_validation_failed() {
        let store = Arc::new(MemoryStore::new());
        store.enroll(1, "Ada", vec![1.0, 0.0, 0.0]);
        let svc = service(&store);

        let err = svc
            .recognize_and_record(&probe(vec![1.0, 0.0]), Action::CheckIn, at(8, 0))
            .unwrap_err();
        assert_eq!(err.kind(), "validation_failed");
        assert!(store.records().is_empty());

        let attempts = store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::ValidationFailed);
    }

    #[test]
    fn test_audit_failure_never_blocks_attendance() {
        let store = Arc::new(MemoryStore::new());
        store.enroll(1, "Ada", vec![1.0, 0.0, 0.0]);
        store.set_audit_broken(true);
        let svc = service(&store);

        let report = svc
            .recognize_and_record(&probe(vec![1.0, 0.0, 0.0]), Action::CheckIn, at(8, 0))
            .unwrap();
        assert!(report.attendance.is_some_and(|a| a.is_applied()));
        assert_eq!(store.records().len(), 1);
        assert!(store.attempts().is_empty());
    }

    #[test]
    fn test_storage_unavailable_surfaces_as_distinct_kind() {
        let store = Arc::new(MemoryStore::new());
        store.enroll(1, "Ada", vec![1.0, 0.0, 0.0]);
        store.set_unavailable(true);
        let svc = service(&store);

        let err = svc
            .recognize_and_record(&probe(vec![1.0, 0.0, 0.0]), Action::CheckIn, at(8, 0))
            .unwrap_err();
        assert_eq!(err.kind(), "storage_unavailable");
    }

    #[test]
    fn test_match_only_does_not_touch_attendance() {
        let store = Arc::new(MemoryStore::new());
        store.enroll(1, "Ada", vec![1.0, 0.0, 0.0]);
        let svc = service(&store);

        let result = svc.match_only(&probe(vec![1.0, 0.0, 0.0]), at(8, 0)).unwrap();
        assert_eq!(result.identity_id, Some(1));
        assert!(store.records().is_empty());
        assert_eq!(store.attempts().len(), 1);
    }

    #[test]
    fn test_manual_check_in_uses_manual_method() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(&store);

        let report = svc.record_manual(9, Action::CheckIn, at(9, 30)).unwrap();
        assert!(report.is_applied());
        let records = store.records();
        assert_eq!(records[0].check_in_method, CheckMethod::Manual);
        assert!(store.attempts().is_empty());
    }

    #[test]
    fn test_report_serializes_with_tags() {
        let store = Arc::new(MemoryStore::new());
        store.enroll(1, "Ada", vec![1.0, 0.0, 0.0]);
        let svc = service(&store);

        let report = svc
            .recognize_and_record(&probe(vec![1.0, 0.0, 0.0]), Action::CheckIn, at(9, 15))
            .unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["attendance"]["action"], "check_in");
        assert_eq!(json["attendance"]["result"], "applied");
        assert_eq!(json["attendance"]["status"], "late");
    }

    #[test]
    fn test_config_validation() {
        assert!(ServiceConfig::default().validate().is_ok());
        let bad = ServiceConfig {
            similarity_threshold: -0.1,
            ..ServiceConfig::default()
        };
        assert!(bad.validate().is_err());

        let no_dim = ServiceConfig {
            embedding_dim: 0,
            ..ServiceConfig::default()
        };
        assert_eq!(no_dim.validate(), Err(MatchError::ZeroDimension));
    }
}
