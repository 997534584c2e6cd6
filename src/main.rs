use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use watchdog::alerts::AlertEngine;
use watchdog::analytics::Aggregator;
use watchdog::capture::DefaultSourceOpener;
use watchdog::chat::RetrievalChat;
use watchdog::config::{self, AppConfig};
use watchdog::db::{AlertStore, AnalyticsStore, CameraRegistry, ChatStore, Database, ObservationStore};
use watchdog::dispatcher::{CaptionWorker, CompletionHandler};
use watchdog::error::StreamError;
use watchdog::llm::CompletionClient;
use watchdog::stream::StreamController;
use watchdog::types::{NewCamera, ObservationField};
use watchdog::{embedding, logging, notify};

#[derive(Parser)]
#[command(name = "watchdog", version)]
#[command(about = "Live camera monitoring: change detection, VLM captions, alerts and grounded chat")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Monitor the flagged camera until Ctrl-C or end of stream
    Run {
        /// Override the camera's registered source (URL, file or image directory)
        #[arg(long)]
        source: Option<String>,
        /// Camera id to attribute observations to (default: the flagged camera)
        #[arg(long)]
        camera: Option<i64>,
    },

    /// Ask a question about what a camera has seen
    Ask {
        #[arg(short, long)]
        camera: i64,
        question: String,
    },

    /// Show the running analytics summary for a camera
    Analytics {
        #[arg(short, long)]
        camera: i64,
        #[arg(long)]
        json: bool,
    },

    /// Show recent alerts
    Alerts {
        #[arg(short, long)]
        camera: Option<i64>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show recent observations for a camera
    Transcripts {
        #[arg(short, long)]
        camera: i64,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only rows whose column (e.g. animal_activity) contains --contains
        #[arg(long, requires = "contains")]
        field: Option<String>,
        #[arg(long, requires = "field")]
        contains: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Show chat history for a camera
    Chats {
        #[arg(short, long)]
        camera: i64,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Register a camera
    AddCamera {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        email: String,
        /// Flag this camera for monitoring
        #[arg(long)]
        monitor: bool,
        #[arg(long)]
        live: bool,
    },

    /// List registered cameras
    Cameras,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (cfg, config_error) = match config::load_config() {
        Ok(cfg) => (cfg, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    logging::init_logging(&cfg.logging);
    if let Some(e) = config_error {
        warn!("Config load failed ({}), using defaults", e);
    }

    let db = Arc::new(Database::open(&cfg.database.path).context("open database")?);

    match cli.command {
        Command::Run { source, camera } => run(&cfg, db, source, camera).await?,

        Command::Ask { camera, question } => {
            if cfg.chat.api_key.is_none() {
                warn!("No chat API key configured (WATCHDOG__CHAT__API_KEY or AI_ML_API)");
            }
            let chat = RetrievalChat::new(
                db.clone(),
                db.clone(),
                Arc::from(embedding::from_config(&cfg.embedding)?),
                Arc::new(CompletionClient::for_chat(&cfg.chat)?),
                &cfg.chat,
            );
            let answer = chat.ask(camera, &question).await;
            println!("{}", answer.answer);
            if !answer.frames.is_empty() {
                println!("\nframes: {:?}", answer.frames);
            }
        }

        Command::Analytics { camera, json } => match db.summary(camera)? {
            None => println!("No analytics for camera {} yet.", camera),
            Some(s) if json => println!("{}", serde_json::to_string_pretty(&s)?),
            Some(s) => {
                println!("Camera {} (since {})", s.camera_id, s.created_at.format("%Y-%m-%d %H:%M"));
                println!("{}", "─".repeat(48));
                println!("  Footage analyzed:        {}", s.total_footage_analyzed);
                println!("  Individuals detected:    {}", s.total_individuals_detected);
                println!("  Avg individuals/footage: {:.2}", s.average_individuals_per_footage);
                println!("  Unusual incidents:       {}", s.total_unusual_incidents);
                println!("  Animal incidents:        {}", s.total_animal_incidents);
                println!("  Unusual crowd incidents: {}", s.total_unusual_crowd_incidents);
                println!("  Vehicles detected:       {}", s.total_vehicles_detected);
            }
        },

        Command::Alerts { camera, limit } => {
            let alerts = db.list_alerts(camera, limit)?;
            if alerts.is_empty() {
                println!("No alerts.");
            }
            for a in alerts {
                println!(
                    "{:<5} {} cam={:<3} frame={:<7} {:<24} [{}] {}",
                    a.id,
                    a.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    a.camera_id,
                    a.frame_number,
                    a.alert_type.as_str(),
                    a.status,
                    a.description
                );
            }
        }

        Command::Transcripts {
            camera,
            limit,
            field,
            contains,
            json,
        } => {
            let rows = match (field, contains) {
                (Some(field), Some(needle)) => {
                    let column = ObservationField::from_column(&field)
                        .with_context(|| format!("unknown observation column: {}", field))?;
                    let needle = needle.to_lowercase();
                    let mut rows =
                        db.filter(camera, column, &|v| v.to_lowercase().contains(&needle))?;
                    rows.truncate(limit);
                    rows
                }
                _ => db.list(camera, limit)?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("{:<8} {:<20} {:>4}  {}", "Frame", "Time", "Ppl", "Description");
                println!("{}", "─".repeat(90));
                for r in rows {
                    let description = r.observation.description();
                    println!(
                        "{:<8} {:<20} {:>4}  {}",
                        r.observation.frame_number,
                        r.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                        r.observation.individual_count,
                        if description.is_empty() { "-" } else { description.as_str() }
                    );
                }
            }
        }

        Command::Chats { camera, limit } => {
            for turn in db.list_chats(camera, limit)? {
                println!("[{}] Q: {}", turn.asked_at.format("%Y-%m-%d %H:%M:%S"), turn.question);
                println!("    A: {}", turn.answer);
                println!("    frames: {:?}\n", turn.frames);
            }
        }

        Command::AddCamera {
            name,
            url,
            email,
            monitor,
            live,
        } => {
            let cam = db.add_camera(&NewCamera {
                name,
                url,
                email,
                monitoring: monitor,
                live,
            })?;
            println!("Camera {} added (id {})", cam.name, cam.id);
        }

        Command::Cameras => {
            println!("{:<4} {:<16} {:<4} {:<4} {:<28} {}", "ID", "Name", "Mon", "Live", "Email", "URL");
            println!("{}", "─".repeat(90));
            for c in db.list_cameras()? {
                println!(
                    "{:<4} {:<16} {:<4} {:<4} {:<28} {}",
                    c.id,
                    c.name,
                    if c.monitoring { "yes" } else { "no" },
                    if c.live { "yes" } else { "no" },
                    c.email,
                    c.url
                );
            }
        }
    }
    Ok(())
}

async fn run(
    cfg: &AppConfig,
    db: Arc<Database>,
    source: Option<String>,
    camera: Option<i64>,
) -> Result<()> {
    if cfg.captioning.api_key.is_none() {
        warn!("No captioning API key configured (WATCHDOG__CAPTIONING__API_KEY or NVIDIA_API_TOKEN)");
    }

    let notifier: Arc<dyn notify::Notifier> = Arc::from(notify::from_config(&cfg.notify));
    let handler = Arc::new(CompletionHandler::new(
        Arc::new(CompletionClient::for_captioning(&cfg.captioning)?),
        db.clone(),
        Aggregator::new(db.clone()),
        AlertEngine::new(db.clone(), db.clone(), notifier.clone()),
    ));
    let (dispatcher, worker) = CaptionWorker::spawn(handler, &cfg.captioning)?;

    let mut controller = StreamController::new(
        db.clone(),
        db.clone(),
        Arc::new(DefaultSourceOpener::new(&cfg.stream)),
        dispatcher,
        cfg.detector.clone(),
    );

    let started = match (source, camera) {
        (None, None) => controller.start(),
        (source, camera) => {
            let camera = match camera {
                Some(id) => db
                    .camera(id)?
                    .ok_or(StreamError::UnknownCamera(id))?,
                None => db.monitored_camera()?,
            };
            let url = source.unwrap_or_else(|| camera.url.clone());
            controller.start_source(camera.id, &url)
        }
    };
    let status = started?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, stopping");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if !controller.is_running() {
                    info!("Source finished");
                    break;
                }
            }
        }
    }

    match tokio::task::block_in_place(|| controller.stop()) {
        Ok(summary) => println!(
            "Processed {} frames, dispatched {} keyframes",
            summary.frames_read, summary.keyframes_dispatched
        ),
        Err(e) => warn!("{}", e),
    }

    tokio::task::spawn_blocking(move || {
        worker.shutdown();
        notifier.flush();
    })
    .await
    .context("caption worker shutdown")?;
    Ok(())
}
