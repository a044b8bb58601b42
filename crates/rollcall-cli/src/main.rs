use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Rollcall {
    fn recognize(&self, embedding: &[f64], action: &str) -> zbus::Result<String>;
    #[zbus(name = "Match")]
    fn match_only(&self, embedding: &[f64]) -> zbus::Result<String>;
    fn check_in(&self, identity_id: i64) -> zbus::Result<String>;
    fn check_out(&self, identity_id: i64) -> zbus::Result<String>;
    fn enroll(&self, name: &str, department: &str, embedding: &[f64]) -> zbus::Result<i64>;
    fn add_embedding(&self, identity_id: i64, embedding: &[f64], primary: bool)
        -> zbus::Result<i64>;
    fn set_primary(&self, identity_id: i64, embedding_id: i64) -> zbus::Result<bool>;
    fn deactivate(&self, identity_id: i64) -> zbus::Result<bool>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn list_embeddings(&self, identity_id: i64) -> zbus::Result<String>;
    fn attendance(&self, date: &str, identity_id: i64) -> zbus::Result<String>;
    fn present_today(&self) -> zbus::Result<String>;
    fn recognition_logs(&self, limit: u32) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    /// Print raw JSON instead of the summary message
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize a face embedding and check the person in (or out)
    Recognize {
        /// JSON file holding the embedding as an array of numbers
        #[arg(short, long)]
        embedding: PathBuf,
        /// Record a check-out instead of a check-in
        #[arg(long)]
        check_out: bool,
    },
    /// Match an embedding without recording attendance
    Match {
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Enroll a new person
    Enroll {
        #[arg(short, long)]
        name: String,
        /// Department or team, shown in listings
        #[arg(short, long)]
        department: Option<String>,
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Attach another embedding to an enrolled person
    AddEmbedding {
        /// Identity ID
        id: i64,
        #[arg(short, long)]
        embedding: PathBuf,
        /// Use this embedding for matching from now on
        #[arg(long)]
        primary: bool,
    },
    /// Make an existing embedding the one used for matching
    SetPrimary {
        /// Identity ID
        id: i64,
        /// Embedding ID (see `rollcall embeddings`)
        embedding_id: i64,
    },
    /// List a person's stored embeddings
    Embeddings {
        /// Identity ID
        id: i64,
    },
    /// Deactivate a person; their records are kept
    Deactivate {
        /// Identity ID
        id: i64,
    },
    /// Manually check a person in
    CheckIn {
        /// Identity ID
        id: i64,
    },
    /// Manually check a person out
    CheckOut {
        /// Identity ID
        id: i64,
    },
    /// List enrolled people
    List,
    /// Show attendance records
    Attendance {
        /// Only this date (YYYY-MM-DD)
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Only this identity
        #[arg(short, long)]
        identity: Option<i64>,
    },
    /// Show who is present today
    Present,
    /// Show recent recognition attempts
    Logs {
        /// Number of entries (default: daemon setting)
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Recognize {
            embedding,
            check_out,
        } => {
            let values = read_embedding(&embedding)?;
            let action = if check_out { "check_out" } else { "check_in" };
            tracing::debug!(dim = values.len(), action, "sending recognize");
            let json = proxy.recognize(&values, action).await?;
            print_outcome(&json, cli.json)?;
        }
        Commands::Match { embedding } => {
            let values = read_embedding(&embedding)?;
            print_json(&proxy.match_only(&values).await?)?;
        }
        Commands::Enroll {
            name,
            department,
            embedding,
        } => {
            let values = read_embedding(&embedding)?;
            let id = proxy
                .enroll(&name, department.as_deref().unwrap_or(""), &values)
                .await?;
            println!("Enrolled {name} as identity {id}");
        }
        Commands::AddEmbedding {
            id,
            embedding,
            primary,
        } => {
            let values = read_embedding(&embedding)?;
            let embedding_id = proxy.add_embedding(id, &values, primary).await?;
            println!("Added embedding {embedding_id} to identity {id}");
        }
        Commands::SetPrimary { id, embedding_id } => {
            proxy.set_primary(id, embedding_id).await?;
            println!("Embedding {embedding_id} is now primary for identity {id}");
        }
        Commands::Embeddings { id } => {
            print_json(&proxy.list_embeddings(id).await?)?;
        }
        Commands::Deactivate { id } => {
            if proxy.deactivate(id).await? {
                println!("Identity {id} deactivated");
            } else {
                println!("Identity {id} was already inactive");
            }
        }
        Commands::CheckIn { id } => {
            print_outcome(&proxy.check_in(id).await?, cli.json)?;
        }
        Commands::CheckOut { id } => {
            print_outcome(&proxy.check_out(id).await?, cli.json)?;
        }
        Commands::List => {
            print_json(&proxy.list_identities().await?)?;
        }
        Commands::Attendance { date, identity } => {
            let date = date.map(|d| d.to_string()).unwrap_or_default();
            print_json(&proxy.attendance(&date, identity.unwrap_or(0)).await?)?;
        }
        Commands::Present => {
            print_json(&proxy.present_today().await?)?;
        }
        Commands::Logs { limit } => {
            print_json(&proxy.recognition_logs(limit.unwrap_or(0)).await?)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

/// Read an embedding file: a JSON array of numbers.
fn read_embedding(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let values: Vec<f64> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of numbers", path.display()))?;
    if values.is_empty() {
        bail!("{} holds an empty embedding", path.display());
    }
    Ok(values)
}

fn print_json(json: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Print the human message of a recognition or transition result, or the
/// whole document with `--json`.
fn print_outcome(json: &str, raw: bool) -> Result<()> {
    if raw {
        return print_json(json);
    }
    let value: serde_json::Value = serde_json::from_str(json).context("daemon sent invalid JSON")?;
    match summary(&value) {
        Some(msg) => println!("{msg}"),
        None => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}

fn summary(value: &serde_json::Value) -> Option<&str> {
    value.get("message").and_then(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_recognize_check_out() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "recognize",
            "--embedding",
            "probe.json",
            "--check-out",
        ])
        .unwrap();
        assert!(!cli.system);
        match cli.command {
            Commands::Recognize {
                embedding,
                check_out,
            } => {
                assert_eq!(embedding, PathBuf::from("probe.json"));
                assert!(check_out);
            }
            _ => panic!("expected recognize"),
        }
    }

    #[test]
    fn test_parse_attendance_filters() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "--system",
            "attendance",
            "--date",
            "2026-03-02",
            "--identity",
            "7",
        ])
        .unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::Attendance { date, identity } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 2));
                assert_eq!(identity, Some(7));
            }
            _ => panic!("expected attendance"),
        }
        assert!(Cli::try_parse_from(["rollcall", "attendance", "--date", "yesterday"]).is_err());
    }

    #[test]
    fn test_parse_enroll_department_is_optional() {
        let cli = Cli::try_parse_from([
            "rollcall", "enroll", "--name", "Ada", "--department", "Finance", "-e", "ada.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Enroll { department, .. } => assert_eq!(department.as_deref(), Some("Finance")),
            _ => panic!("expected enroll"),
        }
        let cli = Cli::try_parse_from(["rollcall", "enroll", "-n", "Bob", "-e", "bob.json"]).unwrap();
        match cli.command {
            Commands::Enroll { department, .. } => assert_eq!(department, None),
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_read_embedding() {
        let dir = std::env::temp_dir().join(format!("rollcall-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.json");
        std::fs::write(&good, "[0.25, -1, 3e-2]").unwrap();
        assert_eq!(read_embedding(&good).unwrap(), vec![0.25, -1.0, 0.03]);

        let empty = dir.join("empty.json");
        std::fs::write(&empty, "[]").unwrap();
        assert!(read_embedding(&empty).is_err());

        let object = dir.join("object.json");
        std::fs::write(&object, r#"{"embedding": [1.0]}"#).unwrap();
        assert!(read_embedding(&object).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_summary_prefers_message() {
        let value = serde_json::json!({"result": "rejected", "message": "Already checked in today"});
        assert_eq!(summary(&value), Some("Already checked in today"));
        assert_eq!(summary(&serde_json::json!({"similarity": 0.1})), None);
    }
}
