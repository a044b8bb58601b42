//! Collaborator interfaces consumed by the core.
//!
//! Storage engines implement these traits; the matcher and the attendance
//! state machine only ever see them through generics, so tests can swap in
//! in-memory fakes.

use crate::types::{
    AttendanceId, AttendanceRecord, AttendanceStatus, CheckMethod, GalleryEntry, IdentityId,
    RecognitionAttempt,
};
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Connection loss, lock timeout or I/O failure. Retryable by the caller.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The store refused a second open span for the same identity and date.
    #[error("an open attendance span already exists")]
    OpenSpanConflict,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Source of the active gallery: one primary embedding per active identity.
pub trait GalleryProvider {
    fn fetch_active_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError>;
}

/// Operations available inside one attendance transaction.
pub trait AttendanceTx {
    /// The span for `(identity, date)` that has no check-out yet.
    fn find_open_span(
        &mut self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// The most recent span for `(identity, date)`, open or closed.
    fn find_latest_span(
        &mut self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Insert a new open span. Must fail with [`StoreError::OpenSpanConflict`]
    /// when an open span already exists for the same identity and date.
    fn insert_check_in(
        &mut self,
        identity_id: IdentityId,
        date: NaiveDate,
        at: NaiveDateTime,
        status: AttendanceStatus,
        method: CheckMethod,
    ) -> Result<AttendanceId, StoreError>;

    fn close_span(
        &mut self,
        attendance_id: AttendanceId,
        at: NaiveDateTime,
        total_hours: f64,
        method: CheckMethod,
    ) -> Result<(), StoreError>;
}

/// Attendance storage that can run a read-then-write sequence atomically.
///
/// `transaction` commits when the closure returns `Ok` and leaves no trace
/// when it returns `Err`. Implementations must serialize concurrent
/// transactions touching the same identity.
pub trait AttendanceStore {
    fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn AttendanceTx) -> Result<T, StoreError>;
}

/// Append-only sink for recognition attempts.
pub trait AuditSink {
    fn append(&self, attempt: &RecognitionAttempt) -> Result<(), StoreError>;
}

impl<T: GalleryProvider + ?Sized> GalleryProvider for Arc<T> {
    fn fetch_active_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        (**self).fetch_active_gallery()
    }
}

impl<S: AttendanceStore> AttendanceStore for Arc<S> {
    fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn AttendanceTx) -> Result<T, StoreError>,
    {
        (**self).transaction(f)
    }
}

impl<A: AuditSink + ?Sized> AuditSink for Arc<A> {
    fn append(&self, attempt: &RecognitionAttempt) -> Result<(), StoreError> {
        (**self).append(attempt)
    }
}
