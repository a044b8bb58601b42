use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use rollcall_core::service::{DEFAULT_EMBEDDING_DIM, DEFAULT_SIMILARITY_THRESHOLD};
use rollcall_core::{AttendancePolicy, ServiceConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: optional TOML file, overridden by `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Dimensionality every probe and enrolled embedding must have.
    pub embedding_dim: usize,
    /// Check-ins after this local time are marked late.
    pub late_cutoff: NaiveTime,
    /// Permit a second span on a day whose first span is closed.
    pub allow_reentry: bool,
    /// How long a storage call may wait on a locked database.
    pub store_timeout: Duration,
    /// Default row count for recognition log queries.
    pub audit_log_limit: u32,
    pub bus: BusKind,
}

/// On-disk form. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    embedding_dim: Option<usize>,
    late_cutoff: Option<String>,
    allow_reentry: Option<bool>,
    store_timeout_ms: Option<u64>,
    audit_log_limit: Option<u32>,
    bus: Option<BusKind>,
}

impl Config {
    /// Load `$ROLLCALL_CONFIG` (or the XDG default, if present), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| config_dir().join("config.toml"));

        let file = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let parsed = Self::parse_file(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?;
            tracing::info!(path = %path.display(), "config file loaded");
            parsed
        } else if explicit.is_some() {
            bail!("config file {} does not exist", path.display());
        } else {
            FileConfig::default()
        };

        let config = Self::from_file(file)?.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(text: &str) -> Result<FileConfig> {
        Ok(toml::from_str(text)?)
    }

    fn from_file(file: FileConfig) -> Result<Self> {
        let late_cutoff = match file.late_cutoff {
            Some(s) => parse_cutoff(&s)?,
            None => AttendancePolicy::default().late_cutoff,
        };
        Ok(Self {
            db_path: file
                .db_path
                .unwrap_or_else(|| data_dir().join("attendance.db")),
            similarity_threshold: file
                .similarity_threshold
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            embedding_dim: file.embedding_dim.unwrap_or(DEFAULT_EMBEDDING_DIM),
            late_cutoff,
            allow_reentry: file.allow_reentry.unwrap_or(false),
            store_timeout: Duration::from_millis(file.store_timeout_ms.unwrap_or(5000)),
            audit_log_limit: file.audit_log_limit.unwrap_or(100),
            bus: file.bus.unwrap_or(BusKind::Session),
        })
    }

    fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.similarity_threshold =
            env_or("ROLLCALL_SIMILARITY_THRESHOLD", self.similarity_threshold)?;
        self.embedding_dim = env_or("ROLLCALL_EMBEDDING_DIM", self.embedding_dim)?;
        if let Ok(v) = std::env::var("ROLLCALL_LATE_CUTOFF") {
            self.late_cutoff = parse_cutoff(&v)?;
        }
        if let Ok(v) = std::env::var("ROLLCALL_ALLOW_REENTRY") {
            self.allow_reentry = parse_flag("ROLLCALL_ALLOW_REENTRY", &v)?;
        }
        self.store_timeout = Duration::from_millis(env_or(
            "ROLLCALL_STORE_TIMEOUT_MS",
            self.store_timeout.as_millis() as u64,
        )?);
        self.audit_log_limit = env_or("ROLLCALL_AUDIT_LOG_LIMIT", self.audit_log_limit)?;
        if let Ok(v) = std::env::var("ROLLCALL_BUS") {
            self.bus = match v.as_str() {
                "system" => BusKind::System,
                "session" => BusKind::Session,
                other => bail!("ROLLCALL_BUS must be 'session' or 'system', got {other:?}"),
            };
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.service_config()
            .validate()
            .context("invalid matching configuration")?;
        if self.store_timeout.is_zero() {
            bail!("store timeout must be positive");
        }
        Ok(())
    }

    /// Core tunables derived from this configuration.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            similarity_threshold: self.similarity_threshold,
            embedding_dim: self.embedding_dim,
            policy: AttendancePolicy {
                late_cutoff: self.late_cutoff,
                allow_reentry: self.allow_reentry,
            },
        }
    }
}

/// Parse a `HH:MM` or `HH:MM:SS` local time.
fn parse_cutoff(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .with_context(|| format!("late cutoff {s:?} is not HH:MM"))
}

fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join("rollcall")
}

fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share").join("rollcall")
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Path::new(&home).join(fallback)
    })
}

/// Parse `key` from the environment, keeping `default` when it is unset.
/// A value that is set but does not parse is an error.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{key}={v:?} is not a valid value")),
        Err(_) => Ok(default),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => bail!("{key} must be true, false, 1 or 0, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_values_apply() {
        let file = Config::parse_file(
            r#"
            db_path = "/var/lib/rollcall/att.db"
            similarity_threshold = 0.45
            embedding_dim = 128
            late_cutoff = "08:30"
            allow_reentry = true
            store_timeout_ms = 250
            bus = "system"
            "#,
        )
        .unwrap();
        let config = Config::from_file(file).unwrap();

        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/att.db"));
        assert_eq!(config.similarity_threshold, 0.45);
        assert_eq!(config.embedding_dim, 128);
        assert_eq!(config.late_cutoff, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert!(config.allow_reentry);
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.bus, BusKind::System);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_file(FileConfig::default()).unwrap();
        assert_eq!(config.similarity_threshold, DEFAULT_SIMILARITY_THRESHOLD);
        assert_eq!(config.embedding_dim, DEFAULT_EMBEDDING_DIM);
        assert_eq!(config.late_cutoff, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(config.audit_log_limit, 100);
        assert_eq!(config.bus, BusKind::Session);
        assert!(config.db_path.ends_with("rollcall/attendance.db"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(Config::parse_file("threshold = 0.5").is_err());
    }

    #[test]
    fn test_bad_cutoff_rejected() {
        let file = FileConfig {
            late_cutoff: Some("nine".into()),
            ..FileConfig::default()
        };
        assert!(Config::from_file(file).is_err());
        assert_eq!(
            parse_cutoff("09:15:30").unwrap(),
            NaiveTime::from_hms_opt(9, 15, 30).unwrap()
        );
    }

    // Only test in this crate that touches the process environment.
    #[test]
    fn test_env_overrides_file_and_rejects_bad_values() {
        const KEYS: [&str; 5] = [
            "ROLLCALL_SIMILARITY_THRESHOLD",
            "ROLLCALL_EMBEDDING_DIM",
            "ROLLCALL_ALLOW_REENTRY",
            "ROLLCALL_AUDIT_LOG_LIMIT",
            "ROLLCALL_STORE_TIMEOUT_MS",
        ];
        let file = || {
            Config::parse_file(
                r#"
                similarity_threshold = 0.45
                embedding_dim = 128
                allow_reentry = true
                "#,
            )
            .unwrap()
        };
        let reset = || {
            for key in KEYS {
                std::env::remove_var(key);
            }
        };

        std::env::set_var("ROLLCALL_SIMILARITY_THRESHOLD", "0.7");
        std::env::set_var("ROLLCALL_EMBEDDING_DIM", "256");
        std::env::set_var("ROLLCALL_ALLOW_REENTRY", "false");
        std::env::set_var("ROLLCALL_AUDIT_LOG_LIMIT", "20");
        let config = Config::from_file(file()).unwrap().with_env_overrides();
        let bad_flag = {
            std::env::set_var("ROLLCALL_ALLOW_REENTRY", "off");
            Config::from_file(file()).unwrap().with_env_overrides()
        };
        std::env::set_var("ROLLCALL_ALLOW_REENTRY", "1");
        let bad_threshold = {
            std::env::set_var("ROLLCALL_SIMILARITY_THRESHOLD", "abc");
            Config::from_file(file()).unwrap().with_env_overrides()
        };
        std::env::set_var("ROLLCALL_SIMILARITY_THRESHOLD", "0.7");
        let bad_dim = {
            std::env::set_var("ROLLCALL_EMBEDDING_DIM", "-3");
            Config::from_file(file()).unwrap().with_env_overrides()
        };
        std::env::remove_var("ROLLCALL_EMBEDDING_DIM");
        let bad_timeout = {
            std::env::set_var("ROLLCALL_STORE_TIMEOUT_MS", "soon");
            Config::from_file(file()).unwrap().with_env_overrides()
        };
        std::env::remove_var("ROLLCALL_STORE_TIMEOUT_MS");
        let reentry_on = Config::from_file(file()).unwrap().with_env_overrides();
        reset();

        let config = config.unwrap();
        assert_eq!(config.similarity_threshold, 0.7);
        assert_eq!(config.embedding_dim, 256);
        assert!(!config.allow_reentry);
        assert_eq!(config.audit_log_limit, 20);

        assert!(bad_flag.is_err());
        assert!(bad_threshold.is_err());
        assert!(bad_dim.is_err());
        assert!(bad_timeout.is_err());

        let reentry_on = reentry_on.unwrap();
        assert!(reentry_on.allow_reentry);
        assert_eq!(reentry_on.embedding_dim, 128);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("K", "true").unwrap());
        assert!(parse_flag("K", "1").unwrap());
        assert!(!parse_flag("K", "false").unwrap());
        assert!(!parse_flag("K", " 0 ").unwrap());
        assert!(parse_flag("K", "no").is_err());
        assert!(parse_flag("K", "").is_err());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let file = FileConfig {
            similarity_threshold: Some(1.2),
            ..FileConfig::default()
        };
        let config = Config::from_file(file).unwrap();
        assert!(config.validate().is_err());
    }
}
