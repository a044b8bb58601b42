//! In-memory collaborator fakes for unit tests.

use crate::store::{AttendanceStore, AttendanceTx, AuditSink, GalleryProvider, StoreError};
use crate::types::{
    AttendanceId, AttendanceRecord, AttendanceStatus, CheckMethod, Embedding, GalleryEntry,
    IdentityId, RecognitionAttempt,
};
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default, Clone)]
struct State {
    gallery: Vec<GalleryEntry>,
    records: Vec<AttendanceRecord>,
    attempts: Vec<RecognitionAttempt>,
}

/// Gallery, attendance store and audit sink behind one mutex. A transaction
/// holds the lock for its whole duration and restores a snapshot on error.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    audit_broken: AtomicBool,
    blind_lookups: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&self, identity_id: IdentityId, name: &str, values: Vec<f32>) {
        self.state.lock().unwrap().gallery.push(GalleryEntry {
            identity_id,
            display_name: name.to_string(),
            embedding: Embedding::new(values),
        });
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn attempts(&self) -> Vec<RecognitionAttempt> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn set_unavailable(&self, on: bool) {
        self.unavailable.store(on, Ordering::SeqCst);
    }

    pub fn set_audit_broken(&self, on: bool) {
        self.audit_broken.store(on, Ordering::SeqCst);
    }

    /// Make span lookups return nothing so only the insert constraint guards
    /// against duplicates.
    pub fn hide_open_spans_from_lookup(&self, on: bool) {
        self.blind_lookups.store(on, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

impl GalleryProvider for MemoryStore {
    fn fetch_active_gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().gallery.clone())
    }
}

impl AuditSink for MemoryStore {
    fn append(&self, attempt: &RecognitionAttempt) -> Result<(), StoreError> {
        if self.audit_broken.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit table locked".into()));
        }
        self.state.lock().unwrap().attempts.push(attempt.clone());
        Ok(())
    }
}

impl AttendanceStore for MemoryStore {
    fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut dyn AttendanceTx) -> Result<T, StoreError>,
    {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        let snapshot = state.clone();
        let mut tx = MemoryTx {
            state: &mut *state,
            blind: self.blind_lookups.load(Ordering::SeqCst),
        };
        match f(&mut tx) {
            Ok(v) => Ok(v),
            Err(e) => {
                *state = snapshot;
                Err(e)
            }
        }
    }
}

struct MemoryTx<'a> {
    state: &'a mut State,
    blind: bool,
}

impl AttendanceTx for MemoryTx<'_> {
    fn find_open_span(
        &mut self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        if self.blind {
            return Ok(None);
        }
        Ok(self
            .state
            .records
            .iter()
            .find(|r| r.identity_id == identity_id && r.date == date && r.is_open())
            .cloned())
    }

    fn find_latest_span(
        &mut self,
        identity_id: IdentityId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        if self.blind {
            return Ok(None);
        }
        Ok(self
            .state
            .records
            .iter()
            .filter(|r| r.identity_id == identity_id && r.date == date)
            .max_by_key(|r| r.check_in)
            .cloned())
    }

    fn insert_check_in(
        &mut self,
        identity_id: IdentityId,
        date: NaiveDate,
        at: NaiveDateTime,
        status: AttendanceStatus,
        method: CheckMethod,
    ) -> Result<AttendanceId, StoreError> {
        let conflict = self
            .state
            .records
            .iter()
            .any(|r| r.identity_id == identity_id && r.date == date && r.is_open());
        if conflict {
            return Err(StoreError::OpenSpanConflict);
        }
        let id = self.state.records.len() as AttendanceId + 1;
        self.state.records.push(AttendanceRecord {
            id,
            identity_id,
            date,
            check_in: Some(at),
            check_out: None,
            status,
            total_hours: None,
            check_in_method: method,
            check_out_method: None,
        });
        Ok(id)
    }

    fn close_span(
        &mut self,
        attendance_id: AttendanceId,
        at: NaiveDateTime,
        total_hours: f64,
        method: CheckMethod,
    ) -> Result<(), StoreError> {
        let record = self
            .state
            .records
            .iter_mut()
            .find(|r| r.id == attendance_id)
            .ok_or_else(|| StoreError::NotFound(format!("attendance {attendance_id}")))?;
        record.check_out = Some(at);
        record.total_hours = Some(total_hours);
        record.check_out_method = Some(method);
        Ok(())
    }
}
