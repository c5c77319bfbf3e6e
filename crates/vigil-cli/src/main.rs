use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vigil_core::{
    EmbeddingMatcher, FullFrameDetector, ImageBuffer, Person, PersonInput, PersonStatus,
    PersonUpdate, ThumbnailEmbedder,
};
use vigil_store::{ResultLog, SqliteBackend, WatchlistStore};
use vigild::{Config, DetectionPipeline, StreamContext};

// `#[zbus::proxy]` generates `WatchlistProxy` for the running daemon.
#[zbus::proxy(
    interface = "org.vigil.Watchlist1",
    default_service = "org.vigil.Watchlist1",
    default_path = "/org/vigil/Watchlist1"
)]
trait Watchlist {
    async fn add_person(
        &self,
        name: &str,
        status: &str,
        reference_image: &[u8],
        notes: &str,
    ) -> zbus::Result<String>;
    async fn update_person(&self, id: &str, changes: &str) -> zbus::Result<()>;
    async fn delete_person(&self, id: &str) -> zbus::Result<()>;
    async fn import_watchlist(&self, document: &str) -> zbus::Result<u32>;
    async fn clear_results(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn active_alerts(&self) -> zbus::Result<String>;
    async fn dismiss(&self, person_id: &str) -> zbus::Result<()>;
    async fn acknowledge(&self, person_id: &str) -> zbus::Result<()>;
    async fn pause_stream(&self, stream_id: &str) -> zbus::Result<()>;
    async fn resume_stream(&self, stream_id: &str) -> zbus::Result<()>;
    async fn capture(&self, stream_id: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil watchlist CLI")]
struct Cli {
    /// Watchlist database (default: $XDG_DATA_HOME/vigil/watchlist.db)
    #[arg(long, global = true, env = "VIGIL_DB_PATH")]
    db: Option<PathBuf>,

    /// Minimum match confidence for `scan`
    #[arg(long, global = true, env = "VIGIL_MATCH_THRESHOLD", default_value_t = vigil_core::DEFAULT_MATCH_THRESHOLD)]
    threshold: f32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a person to the watchlist
    Add {
        #[arg(short, long)]
        name: String,
        /// Reference photo (PNG, JPEG, ...)
        #[arg(short, long)]
        image: PathBuf,
        /// Alert when this person is detected
        #[arg(long)]
        flagged: bool,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Change fields of an existing person
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        image: Option<PathBuf>,
        /// "safe" or "flagged"
        #[arg(long)]
        status: Option<String>,
        #[arg(long, conflicts_with = "clear_notes")]
        notes: Option<String>,
        #[arg(long)]
        clear_notes: bool,
    },
    /// Remove a person
    Remove { id: String },
    /// List the watchlist
    List,
    /// Search names and notes (case-insensitive)
    Search { query: String },
    /// Export the watchlist as JSON
    Export {
        /// Output file (default: watchlist_export_<date>.json)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Import a JSON export, merging by id
    Import { file: PathBuf },
    /// Match a single image against the watchlist
    Scan { image: PathBuf },
    /// Show recent detection results
    Results {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete all detection results
    ClearResults,
    /// Show daemon status
    Status,
    /// Show active alerts
    Alerts,
    /// Dismiss the alert for a person
    Dismiss { person_id: String },
    /// Silence the alarm for a person without dismissing
    Ack { person_id: String },
    /// Pause a daemon stream
    Pause {
        #[arg(default_value = "live")]
        stream: String,
    },
    /// Resume a daemon stream
    Resume {
        #[arg(default_value = "live")]
        stream: String,
    },
    /// Re-process the last frame of a daemon stream
    Capture {
        #[arg(default_value = "live")]
        stream: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db = cli.db.clone().unwrap_or_else(|| Config::from_env().db_path);

    match cli.command {
        Commands::Add {
            name,
            image,
            flagged,
            notes,
        } => {
            let input = PersonInput {
                name,
                status: if flagged { PersonStatus::Flagged } else { PersonStatus::Safe },
                reference_image: read_file(&image)?,
                notes,
            };
            let id = match running_daemon().await? {
                Some(daemon) => {
                    daemon
                        .add_person(
                            &input.name,
                            input.status.as_str(),
                            &input.reference_image,
                            input.notes.as_deref().unwrap_or_default(),
                        )
                        .await?
                }
                None => open_watchlist(&db)?.add(input)?,
            };
            println!("{id}");
        }
        Commands::Update {
            id,
            name,
            image,
            status,
            notes,
            clear_notes,
        } => {
            let update = PersonUpdate {
                name,
                status: status.as_deref().map(parse_status).transpose()?,
                reference_image: image.as_deref().map(read_file).transpose()?,
                notes: if clear_notes { Some(String::new()) } else { notes },
            };
            if update.is_empty() {
                bail!("nothing to update");
            }
            match running_daemon().await? {
                Some(daemon) => daemon.update_person(&id, &serde_json::to_string(&update)?).await?,
                None => open_watchlist(&db)?.update(&id, update)?,
            }
            println!("Updated {id}");
        }
        Commands::Remove { id } => {
            match running_daemon().await? {
                Some(daemon) => daemon.delete_person(&id).await?,
                None => open_watchlist(&db)?.delete(&id)?,
            }
            println!("Removed {id}");
        }
        Commands::List => print_persons(&open_watchlist(&db)?.list()),
        Commands::Search { query } => print_persons(&open_watchlist(&db)?.search(&query)),
        Commands::Export { out } => {
            let store = open_watchlist(&db)?;
            let export = store.export();
            let path = out.unwrap_or_else(|| PathBuf::from(export.file_name()));
            std::fs::write(&path, serde_json::to_string_pretty(&export)?)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Exported {} persons to {}", export.persons.len(), path.display());
        }
        Commands::Import { file } => {
            let document = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let count = match running_daemon().await? {
                Some(daemon) => daemon.import_watchlist(&document).await? as usize,
                None => open_watchlist(&db)?.import_json(&document)?,
            };
            println!("Imported {count} persons");
        }
        Commands::Scan { image } => scan(&db, &image, cli.threshold).await?,
        Commands::Results { limit } => {
            let (store, log) = open_both(&db, limit.max(1))?;
            let results = log.list();
            if results.is_empty() {
                println!("No detection results");
            }
            for result in results.iter().take(limit) {
                println!(
                    "{}  {}  {}{}",
                    result.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    result.id,
                    result.origin.as_str(),
                    result.stream_id.as_deref().map(|s| format!(" ({s})")).unwrap_or_default(),
                );
                print_outcomes(result, &store);
            }
        }
        Commands::ClearResults => {
            match running_daemon().await? {
                Some(daemon) => daemon.clear_results().await?,
                None => {
                    let (_, log) = open_both(&db, 1)?;
                    log.clear()?;
                }
            }
            println!("Detection results cleared");
        }
        Commands::Status => println!("{}", daemon().await?.status().await?),
        Commands::Alerts => println!("{}", daemon().await?.active_alerts().await?),
        Commands::Dismiss { person_id } => {
            daemon().await?.dismiss(&person_id).await?;
            println!("Dismissed alert for {person_id}");
        }
        Commands::Ack { person_id } => {
            daemon().await?.acknowledge(&person_id).await?;
            println!("Acknowledged alert for {person_id}");
        }
        Commands::Pause { stream } => {
            daemon().await?.pause_stream(&stream).await?;
            println!("Paused {stream}");
        }
        Commands::Resume { stream } => {
            daemon().await?.resume_stream(&stream).await?;
            println!("Resumed {stream}");
        }
        Commands::Capture { stream } => println!("{}", daemon().await?.capture(&stream).await?),
    }

    Ok(())
}

async fn daemon() -> Result<WatchlistProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    WatchlistProxy::new(&conn)
        .await
        .context("vigild is not reachable")
}

/// The daemon, if one owns the bus name. Watchlist changes go through it so
/// live matching sees them; with no daemon they are written to the database.
async fn running_daemon() -> Result<Option<WatchlistProxy<'static>>> {
    let conn = match zbus::Connection::session().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!(error = %e, "no session bus; using the database directly");
            return Ok(None);
        }
    };
    let proxy = WatchlistProxy::new(&conn).await?;
    match proxy.status().await {
        Ok(_) => Ok(Some(proxy)),
        Err(e) if daemon_absent(&e) => {
            tracing::debug!(error = %e, "vigild not running; using the database directly");
            Ok(None)
        }
        Err(e) => Err(e).context("vigild is running but did not answer"),
    }
}

fn daemon_absent(e: &zbus::Error) -> bool {
    const ABSENT: [&str; 2] = [
        "org.freedesktop.DBus.Error.ServiceUnknown",
        "org.freedesktop.DBus.Error.NameHasNoOwner",
    ];
    match e {
        zbus::Error::FDO(fdo) => matches!(
            **fdo,
            zbus::fdo::Error::ServiceUnknown(_) | zbus::fdo::Error::NameHasNoOwner(_)
        ),
        zbus::Error::MethodError(name, _, _) => ABSENT.contains(&name.as_str()),
        _ => false,
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn parse_status(value: &str) -> Result<PersonStatus> {
    PersonStatus::parse(value).with_context(|| format!("unknown status '{value}' (safe|flagged)"))
}

fn open_backend(db: &Path) -> Result<Arc<dyn vigil_store::Backend>> {
    if let Some(parent) = db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(SqliteBackend::open(db)
        .with_context(|| format!("failed to open database {}", db.display()))?
        .into_shared())
}

fn open_watchlist(db: &Path) -> Result<WatchlistStore> {
    Ok(WatchlistStore::open(open_backend(db)?)?)
}

fn open_both(db: &Path, capacity: usize) -> Result<(WatchlistStore, ResultLog)> {
    let backend = open_backend(db)?;
    Ok((
        WatchlistStore::open(backend.clone())?,
        ResultLog::open(backend, capacity)?,
    ))
}

async fn scan(db: &Path, image: &Path, threshold: f32) -> Result<()> {
    let frame = ImageBuffer::from_encoded(&read_file(image)?)
        .with_context(|| format!("failed to decode {}", image.display()))?;

    let backend = open_backend(db)?;
    let store = WatchlistStore::open(backend.clone())?;
    let capacity = Config::from_env().result_log_capacity;
    let log = Arc::new(ResultLog::open(backend, capacity)?);
    let pipeline = Arc::new(DetectionPipeline::new(
        Arc::new(FullFrameDetector::default()),
        Arc::new(EmbeddingMatcher::new(ThumbnailEmbedder::default(), threshold)),
        store.clone(),
        log.clone(),
    ));

    match pipeline.process_image(&frame, &StreamContext::default()).await? {
        Some(result) => {
            println!("{}", result.id);
            print_outcomes(&result, &store);
        }
        None => println!("No face detected"),
    }
    log.flush()?;
    Ok(())
}

fn print_persons(persons: &[Person]) {
    if persons.is_empty() {
        println!("No persons");
        return;
    }
    for p in persons {
        println!(
            "{}  {:<7}  {}{}",
            p.id,
            p.status.as_str(),
            p.name,
            p.notes.as_deref().map(|n| format!("  ({n})")).unwrap_or_default(),
        );
    }
}

fn print_outcomes(result: &vigil_core::DetectionResult, store: &WatchlistStore) {
    for outcome in result.resolve(|id| store.get(id).ok()) {
        let b = outcome.region.bounding_box;
        println!(
            "    [{:?}] {} {:.0}%  at {:.0},{:.0} {:.0}x{:.0}",
            outcome.classification,
            outcome.label(),
            outcome.match_confidence * 100.0,
            b.x,
            b.y,
            b.width,
            b.height,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_missing_daemon_falls_back_to_database() {
        let unknown = zbus::Error::FDO(Box::new(zbus::fdo::Error::ServiceUnknown(
            "org.vigil.Watchlist1".into(),
        )));
        assert!(daemon_absent(&unknown));
        let no_owner = zbus::Error::FDO(Box::new(zbus::fdo::Error::NameHasNoOwner(
            "org.vigil.Watchlist1".into(),
        )));
        assert!(daemon_absent(&no_owner));

        let rejected = zbus::Error::FDO(Box::new(zbus::fdo::Error::InvalidArgs("name".into())));
        assert!(!daemon_absent(&rejected));
        assert!(!daemon_absent(&zbus::Error::Failure("boom".into())));
    }

    #[test]
    fn test_update_travels_as_json_the_daemon_accepts() {
        let update = PersonUpdate {
            name: Some("Walter".into()),
            status: Some(PersonStatus::Flagged),
            reference_image: None,
            notes: Some(String::new()),
        };
        let wire = serde_json::to_string(&update).unwrap();
        let back: PersonUpdate = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, update);
    }
}
