use crate::engine::{EngineError, EngineHandle};
use crate::store::AttendanceFilter;
use chrono::NaiveDate;
use rollcall_core::{Action, Embedding, Probe};
use serde::Serialize;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Results are JSON documents. Errors carry a `kind:` prefix such as
/// `storage_unavailable:` or `validation_failed:`.
pub struct RollcallBus {
    engine: EngineHandle,
}

impl RollcallBus {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl RollcallBus {
    /// Match an embedding and check the matched identity in or out.
    ///
    /// `action` is `check_in` or `check_out`.
    async fn recognize(&self, embedding: Vec<f64>, action: &str) -> zbus::fdo::Result<String> {
        let action = Action::parse(action).ok_or_else(|| {
            zbus::fdo::Error::InvalidArgs(format!(
                "validation_failed: unknown action {action:?}"
            ))
        })?;
        tracing::debug!(dim = embedding.len(), action = action.as_str(), "recognize requested");
        let report = self
            .engine
            .recognize(Probe::new(to_embedding(embedding)), action)
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Match an embedding without recording attendance.
    #[zbus(name = "Match")]
    async fn match_only(&self, embedding: Vec<f64>) -> zbus::fdo::Result<String> {
        let result = self
            .engine
            .match_only(Probe::new(to_embedding(embedding)))
            .await
            .map_err(to_fdo)?;
        to_json(&result)
    }

    /// Manual check-in.
    async fn check_in(&self, identity_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "manual check-in requested");
        let report = self
            .engine
            .manual(identity_id, Action::CheckIn)
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Manual check-out.
    async fn check_out(&self, identity_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "manual check-out requested");
        let report = self
            .engine
            .manual(identity_id, Action::CheckOut)
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Enroll a new identity. An empty `department` stores none. Returns the
    /// new identity id.
    async fn enroll(
        &self,
        name: &str,
        department: &str,
        embedding: Vec<f64>,
    ) -> zbus::fdo::Result<i64> {
        tracing::info!(name, department, "enroll requested");
        let department = (!department.is_empty()).then(|| department.to_string());
        self.engine
            .enroll(name.to_string(), department, to_embedding(embedding))
            .await
            .map_err(to_fdo)
    }

    /// Attach another embedding to an identity. Returns the embedding id.
    async fn add_embedding(
        &self,
        identity_id: i64,
        embedding: Vec<f64>,
        primary: bool,
    ) -> zbus::fdo::Result<i64> {
        self.engine
            .add_embedding(identity_id, to_embedding(embedding), primary)
            .await
            .map_err(to_fdo)
    }

    async fn set_primary(&self, identity_id: i64, embedding_id: i64) -> zbus::fdo::Result<bool> {
        self.engine
            .set_primary(identity_id, embedding_id)
            .await
            .map_err(to_fdo)?;
        Ok(true)
    }

    /// Returns `false` if the identity was already inactive.
    async fn deactivate(&self, identity_id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(identity_id, "deactivate requested");
        self.engine.deactivate(identity_id).await.map_err(to_fdo)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.list_identities().await.map_err(to_fdo)?)
    }

    async fn list_embeddings(&self, identity_id: i64) -> zbus::fdo::Result<String> {
        to_json(&self.engine.list_embeddings(identity_id).await.map_err(to_fdo)?)
    }

    /// Attendance records. An empty `date` or a zero `identity_id` disables
    /// that filter.
    async fn attendance(&self, date: &str, identity_id: i64) -> zbus::fdo::Result<String> {
        let filter = AttendanceFilter {
            date: parse_date(date)?,
            identity_id: (identity_id != 0).then_some(identity_id),
        };
        to_json(&self.engine.attendance(filter).await.map_err(to_fdo)?)
    }

    async fn present_today(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.present(None).await.map_err(to_fdo)?)
    }

    /// Most recent recognition attempts; `0` uses the configured default.
    async fn recognition_logs(&self, limit: u32) -> zbus::fdo::Result<String> {
        let limit = (limit != 0).then_some(limit);
        to_json(&self.engine.logs(limit).await.map_err(to_fdo)?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.status().await.map_err(to_fdo)?)
    }
}

fn to_embedding(values: Vec<f64>) -> Embedding {
    Embedding::new(values.into_iter().map(|v| v as f32).collect())
}

fn parse_date(date: &str) -> zbus::fdo::Result<Option<NaiveDate>> {
    if date.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| {
            zbus::fdo::Error::InvalidArgs(format!(
                "validation_failed: date {date:?} is not YYYY-MM-DD"
            ))
        })
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value)
        .map_err(|e| zbus::fdo::Error::Failed(format!("internal: {e}")))
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    let kind = err.kind();
    let msg = format!("{kind}: {err}");
    if err.is_input_error() {
        zbus::fdo::Error::InvalidArgs(msg)
    } else {
        tracing::error!(error = %err, kind, "request failed");
        zbus::fdo::Error::Failed(msg)
    }
}
