//! rollcall-core — Face matching and attendance tracking.
//!
//! Matches a live face embedding against the gallery of enrolled identities
//! and turns a match into a check-in or check-out, keeping at most one open
//! attendance span per person per day. Storage, audit and the gallery are
//! injected through the traits in [`store`].

pub mod attendance;
pub mod matcher;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use attendance::{
    AttendanceError, AttendanceMachine, AttendancePolicy, CheckedIn, CheckedOut, Rejection,
    RejectionReason, Transition,
};
pub use matcher::{CosineMatcher, MatchError, MatchResult, Matcher};
pub use service::{
    AttendanceReport, AttendanceService, Probe, RecognitionReport, ServiceConfig, ServiceError,
};
pub use store::{AttendanceStore, AttendanceTx, AuditSink, GalleryProvider, StoreError};
pub use types::{
    Action, AttemptOutcome, AttendanceId, AttendanceRecord, AttendanceStatus, CheckMethod,
    Embedding, EmbeddingId, EmbeddingRecord, FaceBox, GalleryEntry, Identity, IdentityId,
    IdentityStatus, RecognitionAttempt,
};
