use crate::store::{AttemptRow, AttendanceFilter, AttendanceRow, IdentityListing, SqliteStore};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use rollcall_core::matcher::validate_embedding;
use rollcall_core::{
    Action, AttendanceReport, AttendanceService, Embedding, EmbeddingId, EmbeddingRecord,
    IdentityId, MatchError, MatchResult, Probe, RecognitionReport, ServiceConfig, ServiceError, StoreError,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

type Service = AttendanceService<Arc<SqliteStore>, Arc<SqliteStore>, Arc<SqliteStore>>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] MatchError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Machine-readable kind, prefixed onto D-Bus error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Service(e) => e.kind(),
            Self::Store(StoreError::Unavailable(_)) => "storage_unavailable",
            Self::Store(StoreError::NotFound(_)) => "not_found",
            Self::Store(_) => "internal",
            Self::InvalidEmbedding(_) | Self::InvalidArgument(_) => "validation_failed",
            Self::Spawn(_) | Self::ChannelClosed => "internal",
        }
    }

    /// The caller sent something wrong; retrying the same request won't help.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self.kind(),
            "validation_failed" | "unknown_identity" | "not_found"
        )
    }
}

/// Daemon status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub db_path: PathBuf,
    pub active_identities: u64,
    pub similarity_threshold: f32,
    pub embedding_dim: usize,
    pub late_cutoff: NaiveTime,
    pub allow_reentry: bool,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Recognize {
        probe: Probe,
        action: Action,
        reply: Reply<RecognitionReport>,
    },
    Match {
        probe: Probe,
        reply: Reply<MatchResult>,
    },
    Manual {
        identity_id: IdentityId,
        action: Action,
        reply: Reply<AttendanceReport>,
    },
    Enroll {
        name: String,
        department: Option<String>,
        embedding: Embedding,
        reply: Reply<IdentityId>,
    },
    AddEmbedding {
        identity_id: IdentityId,
        embedding: Embedding,
        primary: bool,
        reply: Reply<EmbeddingId>,
    },
    SetPrimary {
        identity_id: IdentityId,
        embedding_id: EmbeddingId,
        reply: Reply<()>,
    },
    Deactivate {
        identity_id: IdentityId,
        reply: Reply<bool>,
    },
    ListIdentities {
        reply: Reply<Vec<IdentityListing>>,
    },
    ListEmbeddings {
        identity_id: IdentityId,
        reply: Reply<Vec<EmbeddingRecord>>,
    },
    Attendance {
        filter: AttendanceFilter,
        reply: Reply<Vec<AttendanceRow>>,
    },
    Present {
        date: Option<NaiveDate>,
        reply: Reply<Vec<AttendanceRow>>,
    },
    Logs {
        limit: Option<u32>,
        reply: Reply<Vec<AttemptRow>>,
    },
    Status {
        reply: Reply<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Match the probe and apply `action` for the matched identity.
    pub async fn recognize(
        &self,
        probe: Probe,
        action: Action,
    ) -> Result<RecognitionReport, EngineError> {
        self.call(|reply| EngineRequest::Recognize {
            probe,
            action,
            reply,
        })
        .await
    }

    pub async fn match_only(&self, probe: Probe) -> Result<MatchResult, EngineError> {
        self.call(|reply| EngineRequest::Match { probe, reply }).await
    }

    /// Check in or out without face matching.
    pub async fn manual(
        &self,
        identity_id: IdentityId,
        action: Action,
    ) -> Result<AttendanceReport, EngineError> {
        self.call(|reply| EngineRequest::Manual {
            identity_id,
            action,
            reply,
        })
        .await
    }

    pub async fn enroll(
        &self,
        name: String,
        department: Option<String>,
        embedding: Embedding,
    ) -> Result<IdentityId, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            name,
            department,
            embedding,
            reply,
        })
        .await
    }

    pub async fn add_embedding(
        &self,
        identity_id: IdentityId,
        embedding: Embedding,
        primary: bool,
    ) -> Result<EmbeddingId, EngineError> {
        self.call(|reply| EngineRequest::AddEmbedding {
            identity_id,
            embedding,
            primary,
            reply,
        })
        .await
    }

    pub async fn set_primary(
        &self,
        identity_id: IdentityId,
        embedding_id: EmbeddingId,
    ) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::SetPrimary {
            identity_id,
            embedding_id,
            reply,
        })
        .await
    }

    pub async fn deactivate(&self, identity_id: IdentityId) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Deactivate { identity_id, reply })
            .await
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentityListing>, EngineError> {
        self.call(|reply| EngineRequest::ListIdentities { reply }).await
    }

    pub async fn list_embeddings(
        &self,
        identity_id: IdentityId,
    ) -> Result<Vec<EmbeddingRecord>, EngineError> {
        self.call(|reply| EngineRequest::ListEmbeddings { identity_id, reply })
            .await
    }

    pub async fn attendance(&self, filter: AttendanceFilter) -> Result<Vec<AttendanceRow>, EngineError> {
        self.call(|reply| EngineRequest::Attendance { filter, reply })
            .await
    }

    /// Present identities on `date` (today when `None`).
    pub async fn present(&self, date: Option<NaiveDate>) -> Result<Vec<AttendanceRow>, EngineError> {
        self.call(|reply| EngineRequest::Present { date, reply }).await
    }

    /// Most recent recognition attempts (configured default when `None`).
    pub async fn logs(&self, limit: Option<u32>) -> Result<Vec<AttemptRow>, EngineError> {
        self.call(|reply| EngineRequest::Logs { limit, reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Owns the service and store on the engine thread.
struct Engine {
    service: Service,
    store: Arc<SqliteStore>,
    audit_log_limit: u32,
}

/// Spawn the engine on a dedicated OS thread.
///
/// SQLite calls block, so they stay off the async runtime. Requests are
/// handled one at a time in arrival order.
pub fn spawn_engine(
    store: Arc<SqliteStore>,
    config: ServiceConfig,
    audit_log_limit: u32,
) -> Result<EngineHandle, EngineError> {
    let service = AttendanceService::new(store.clone(), store.clone(), store.clone(), config);
    let engine = Engine {
        service,
        store,
        audit_log_limit,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

impl Engine {
    fn handle(&self, req: EngineRequest) {
        // A dropped receiver means the caller went away; nothing to do.
        match req {
            EngineRequest::Recognize {
                probe,
                action,
                reply,
            } => {
                let result = self
                    .service
                    .recognize_and_record(&probe, action, now())
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Match { probe, reply } => {
                let result = self
                    .service
                    .match_only(&probe, now())
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Manual {
                identity_id,
                action,
                reply,
            } => {
                let result = self
                    .service
                    .record_manual(identity_id, action, now())
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Enroll {
                name,
                department,
                embedding,
                reply,
            } => {
                let _ = reply.send(self.enroll(&name, department.as_deref(), &embedding));
            }
            EngineRequest::AddEmbedding {
                identity_id,
                embedding,
                primary,
                reply,
            } => {
                let result = self.check_embedding(&embedding).and_then(|()| {
                    Ok(self
                        .store
                        .add_embedding(identity_id, &embedding, primary, now())?)
                });
                let _ = reply.send(result);
            }
            EngineRequest::SetPrimary {
                identity_id,
                embedding_id,
                reply,
            } => {
                let result = self
                    .store
                    .set_primary_embedding(identity_id, embedding_id)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Deactivate { identity_id, reply } => {
                let result = self
                    .store
                    .deactivate_identity(identity_id, now())
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::ListIdentities { reply } => {
                let _ = reply.send(self.store.list_identities().map_err(EngineError::from));
            }
            EngineRequest::ListEmbeddings { identity_id, reply } => {
                let result = self
                    .store
                    .list_embeddings(identity_id)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Attendance { filter, reply } => {
                let _ = reply.send(self.store.list_attendance(&filter).map_err(EngineError::from));
            }
            EngineRequest::Present { date, reply } => {
                let date = date.unwrap_or_else(|| now().date());
                let _ = reply.send(self.store.present_on(date).map_err(EngineError::from));
            }
            EngineRequest::Logs { limit, reply } => {
                let limit = limit.unwrap_or(self.audit_log_limit);
                let _ = reply.send(self.store.recent_attempts(limit).map_err(EngineError::from));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn check_embedding(&self, embedding: &Embedding) -> Result<(), EngineError> {
        validate_embedding(embedding, self.service.config().embedding_dim)?;
        if embedding.norm() == 0.0 {
            return Err(EngineError::InvalidArgument(
                "embedding has zero magnitude".into(),
            ));
        }
        Ok(())
    }

    fn enroll(
        &self,
        name: &str,
        department: Option<&str>,
        embedding: &Embedding,
    ) -> Result<IdentityId, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidArgument("name is required".into()));
        }
        let department = department.map(str::trim).filter(|d| !d.is_empty());
        self.check_embedding(embedding)?;
        Ok(self.store.create_identity(name, department, embedding, now())?)
    }

    fn status(&self) -> Result<EngineStatus, EngineError> {
        let config = self.service.config();
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            db_path: self.store.path().to_path_buf(),
            active_identities: self.store.active_identity_count()?,
            similarity_threshold: config.similarity_threshold,
            embedding_dim: config.embedding_dim,
            late_cutoff: config.policy.late_cutoff,
            allow_reentry: config.policy.allow_reentry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::Transition;

    fn engine() -> EngineHandle {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = ServiceConfig {
            embedding_dim: 3,
            ..ServiceConfig::default()
        };
        spawn_engine(store, config, 50).unwrap()
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[tokio::test]
    async fn test_enroll_then_recognize() {
        let engine = engine();
        let id = engine
            .enroll("Ada".into(), None, emb(&[0.2, 0.9, 0.1]))
            .await
            .unwrap();

        let report = engine
            .recognize(Probe::new(emb(&[0.2, 0.9, 0.1])), Action::CheckIn)
            .await
            .unwrap();
        assert_eq!(report.identity_id, Some(id));
        assert!(report.attendance.is_some_and(|a| a.is_applied()));

        let again = engine.manual(id, Action::CheckIn).await.unwrap();
        assert!(matches!(again, AttendanceReport::CheckIn(Transition::Rejected(_))));

        let status = engine.status().await.unwrap();
        assert_eq!(status.active_identities, 1);
        assert_eq!(engine.logs(None).await.unwrap().len(), 1);
        assert_eq!(engine.present(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enroll_rejects_bad_input() {
        let engine = engine();
        let err = engine.enroll("  ".into(), None, emb(&[1.0, 0.0, 0.0])).await.unwrap_err();
        assert!(err.is_input_error());
        let err = engine.enroll("Ada".into(), None, emb(&[1.0, 0.0])).await.unwrap_err();
        assert!(err.is_input_error());
        let err = engine.enroll("Ada".into(), None, emb(&[0.0, 0.0, 0.0])).await.unwrap_err();
        assert!(err.is_input_error());
        assert!(engine.list_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_normalizes_department() {
        let engine = engine();
        let ops = engine
            .enroll("Ada".into(), Some(" Operations ".into()), emb(&[1.0, 0.0, 0.0]))
            .await
            .unwrap();
        let blank = engine
            .enroll("Bob".into(), Some("   ".into()), emb(&[0.0, 1.0, 0.0]))
            .await
            .unwrap();

        let listing = engine.list_identities().await.unwrap();
        let department = |id| {
            listing
                .iter()
                .find(|l| l.identity.id == id)
                .and_then(|l| l.identity.department.clone())
        };
        assert_eq!(department(ops).as_deref(), Some("Operations"));
        assert_eq!(department(blank), None);
    }

    #[tokio::test]
    async fn test_deactivated_identity_is_not_matched() {
        let engine = engine();
        let id = engine.enroll("Ada".into(), None, emb(&[1.0, 0.0, 0.0])).await.unwrap();
        assert!(engine.deactivate(id).await.unwrap());

        let result = engine.match_only(Probe::new(emb(&[1.0, 0.0, 0.0]))).await.unwrap();
        assert!(!result.is_match());
        assert_eq!(result.similarity, 0.0);

        let err = engine.deactivate(999).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_unknown_identity_manual_check_in() {
        let engine = engine();
        let err = engine.manual(404, Action::CheckIn).await.unwrap_err();
        assert_eq!(err.kind(), "unknown_identity");
    }
}
