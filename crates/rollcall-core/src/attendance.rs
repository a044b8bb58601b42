//! Per-identity, per-day attendance state machine.
//!
//! States for one `(identity, date)`: no record, one open span (checked in),
//! or a closed span (checked in and out). Every read-then-write runs inside a
//! single store transaction so a duplicate check-in cannot slip between the
//! lookup and the insert.

use crate::store::{AttendanceStore, AttendanceTx, StoreError};
use crate::types::{
    AttendanceId, AttendanceRecord, AttendanceStatus, CheckMethod, IdentityId,
};
use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const TIME_FMT: &str = "%H:%M:%S";

/// Time-of-day rules applied at check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendancePolicy {
    /// Check-ins at or before this local time are `present`, later ones `late`.
    pub late_cutoff: NaiveTime,
    /// Allow a new span on a day whose previous span is already closed.
    pub allow_reentry: bool,
}

impl Default for AttendancePolicy {
    fn default() -> Self {
        Self {
            late_cutoff: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            allow_reentry: false,
        }
    }
}

impl AttendancePolicy {
    pub fn status_for(&self, at: NaiveDateTime) -> AttendanceStatus {
        if at.time() <= self.late_cutoff {
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Late
        }
    }
}

/// Hours between check-in and check-out, rounded to two decimals.
///
/// A check-out earlier than the check-in yields 0.0.
pub fn total_hours(check_in: NaiveDateTime, check_out: NaiveDateTime) -> f64 {
    let millis = (check_out - check_in).num_milliseconds();
    if millis <= 0 {
        return 0.0;
    }
    let hours = millis as f64 / 3_600_000.0;
    (hours * 100.0).round() / 100.0
}

/// Machine-readable reason for a refused transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    AlreadyCheckedIn,
    NoCheckin,
}

impl RejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyCheckedIn => "already_checked_in",
            Self::NoCheckin => "no_checkin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub message: String,
}

impl Rejection {
    fn new(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckedIn {
    pub attendance_id: AttendanceId,
    pub status: AttendanceStatus,
    pub check_in: NaiveDateTime,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckedOut {
    pub attendance_id: AttendanceId,
    pub total_hours: f64,
    pub check_in: NaiveDateTime,
    pub check_out: NaiveDateTime,
    pub message: String,
}

/// Outcome of a requested transition: either applied or refused with a reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Transition<T> {
    Applied(T),
    Rejected(Rejection),
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Applied(_) => None,
            Self::Rejected(r) => Some(r),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttendanceError {
    /// Retryable by the caller; nothing was written.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),
    #[error("attendance storage error: {0}")]
    Storage(StoreError),
}

impl AttendanceError {
    fn from_store(err: StoreError, identity_id: IdentityId) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::StorageUnavailable(msg),
            StoreError::NotFound(_) => Self::UnknownIdentity(identity_id),
            other => Self::Storage(other),
        }
    }
}

/// Applies check-in and check-out requests against an [`AttendanceStore`].
pub struct AttendanceMachine<S> {
    store: S,
    policy: AttendancePolicy,
}

impl<S: AttendanceStore> AttendanceMachine<S> {
    pub fn new(store: S, policy: AttendancePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &AttendancePolicy {
        &self.policy
    }

    /// Open a span for `identity_id` on the calendar date of `at`.
    pub fn request_check_in(
        &self,
        identity_id: IdentityId,
        at: NaiveDateTime,
        method: CheckMethod,
    ) -> Result<Transition<CheckedIn>, AttendanceError> {
        let policy = self.policy;
        let outcome = self
            .store
            .transaction(|tx| check_in_tx(tx, &policy, identity_id, at, method))
            .map_err(|e| AttendanceError::from_store(e, identity_id))?;

        match &outcome {
            Transition::Applied(done) => tracing::info!(
                identity_id,
                attendance_id = done.attendance_id,
                status = done.status.as_str(),
                "check-in recorded"
            ),
            Transition::Rejected(r) => {
                tracing::info!(identity_id, reason = r.reason.as_str(), "check-in rejected")
            }
        }
        Ok(outcome)
    }

    /// Close the open span for `identity_id` on the calendar date of `at`.
    pub fn request_check_out(
        &self,
        identity_id: IdentityId,
        at: NaiveDateTime,
        method: CheckMethod,
    ) -> Result<Transition<CheckedOut>, AttendanceError> {
        let outcome = self
            .store
            .transaction(|tx| check_out_tx(tx, identity_id, at, method))
            .map_err(|e| AttendanceError::from_store(e, identity_id))?;

        match &outcome {
            Transition::Applied(done) => tracing::info!(
                identity_id,
                attendance_id = done.attendance_id,
                total_hours = done.total_hours,
                "check-out recorded"
            ),
            Transition::Rejected(r) => {
                tracing::info!(identity_id, reason = r.reason.as_str(), "check-out rejected")
            }
        }
        Ok(outcome)
    }
}

fn check_in_tx(
    tx: &mut dyn AttendanceTx,
    policy: &AttendancePolicy,
    identity_id: IdentityId,
    at: NaiveDateTime,
    method: CheckMethod,
) -> Result<Transition<CheckedIn>, StoreError> {
    let date = at.date();

    if let Some(open) = tx.find_open_span(identity_id, date)? {
        return Ok(Transition::Rejected(already_checked_in(&open)));
    }

    if !policy.allow_reentry {
        if let Some(closed) = tx.find_latest_span(identity_id, date)? {
            return Ok(Transition::Rejected(already_checked_in(&closed)));
        }
    }

    let status = policy.status_for(at);
    match tx.insert_check_in(identity_id, date, at, status, method) {
        Ok(attendance_id) => Ok(Transition::Applied(CheckedIn {
            attendance_id,
            status,
            check_in: at,
            message: format!(
                "check-in recorded at {} ({})",
                at.format(TIME_FMT),
                status.as_str()
            ),
        })),
        // A concurrent request won the race; the store's open-span constraint
        // turned our insert away.
        Err(StoreError::OpenSpanConflict) => Ok(Transition::Rejected(Rejection::new(
            RejectionReason::AlreadyCheckedIn,
            "already checked in today",
        ))),
        Err(e) => Err(e),
    }
}

fn check_out_tx(
    tx: &mut dyn AttendanceTx,
    identity_id: IdentityId,
    at: NaiveDateTime,
    method: CheckMethod,
) -> Result<Transition<CheckedOut>, StoreError> {
    let date = at.date();

    let Some(open) = tx.find_open_span(identity_id, date)? else {
        let message = match tx.find_latest_span(identity_id, date)? {
            Some(AttendanceRecord {
                check_out: Some(out),
                ..
            }) => format!("already checked out today at {}", out.format(TIME_FMT)),
            _ => "no open check-in found for today".to_string(),
        };
        return Ok(Transition::Rejected(Rejection::new(
            RejectionReason::NoCheckin,
            message,
        )));
    };

    let check_in = open.check_in.ok_or_else(|| {
        StoreError::InvalidData(format!("open span {} has no check-in time", open.id))
    })?;

    if at < check_in {
        tracing::warn!(
            identity_id,
            attendance_id = open.id,
            %check_in,
            check_out = %at,
            "check-out precedes check-in; recording zero hours"
        );
    }
    let hours = total_hours(check_in, at);
    tx.close_span(open.id, at, hours, method)?;

    Ok(Transition::Applied(CheckedOut {
        attendance_id: open.id,
        total_hours: hours,
        check_in,
        check_out: at,
        message: format!("check-out recorded at {}, {hours:.2} hours", at.format(TIME_FMT)),
    }))
}

fn already_checked_in(existing: &AttendanceRecord) -> Rejection {
    let message = match (existing.check_in, existing.check_out) {
        (Some(cin), None) => format!("already checked in today at {}", cin.format(TIME_FMT)),
        (Some(cin), Some(cout)) => format!(
            "already checked in today at {} and out at {}",
            cin.format(TIME_FMT),
            cout.format(TIME_FMT)
        ),
        _ => "already checked in today".to_string(),
    };
    Rejection::new(RejectionReason::AlreadyCheckedIn, message)
}
