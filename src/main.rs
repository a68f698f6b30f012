use crate::cluster::ClusterState;
use crate::config::Config;
use crate::meshversion::MeshVersion;
use crate::note::NoteLevel;
use crate::state::{AppState, Report};
use kube::Client;
use std::env;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cluster;
mod config;
mod image_reference;
mod injection;
mod mesh;
mod meshversion;
mod note;
mod state;
mod vetter;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "/etc/mesh-version-vet/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting mesh-version-vet {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config_or_default(&config_path)?;

    let client = cluster::create_client().await?;
    let shutdown = CancellationToken::new();

    match config.schedule.clone() {
        Some(schedule) => run_scheduled(client, config, schedule, shutdown).await,
        None => run_once(client, &config, shutdown).await,
    }
}

async fn run_once(
    client: Client,
    config: &Config,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let cluster = ClusterState::start(client, config, shutdown.clone()).await?;
    let vetter = MeshVersion::new(cluster, config.feature_flags.check_component_versions);

    let report = Report::collect(&vetter);
    shutdown.cancel();
    let report = report?;

    log_report(&report);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_scheduled(
    client: Client,
    config: Config,
    schedule: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app_state = AppState::default();

    let app = webserver::create_app(app_state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
    });

    let cluster = ClusterState::start(client, &config, shutdown.clone()).await?;
    app_state.mark_ready();
    let vetter = Arc::new(MeshVersion::new(
        cluster,
        config.feature_flags.check_component_versions,
    ));

    info!("Executing job scheduler at cron schedule {}", schedule);
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(schedule, move |_uuid, _l| {
        let vetter = vetter.clone();
        let app_state = app_state.clone();
        Box::pin(async move {
            match Report::collect(vetter.as_ref()) {
                Ok(report) => {
                    log_report(&report);
                    app_state.publish(report).await;
                }
                Err(e) => error!("Error running vet pass: {:?}", e),
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.shutdown_on_ctrl_c();
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    shutdown.cancel();
    server.await??;
    Ok(())
}

fn log_report(report: &Report) {
    info!(
        "Vet pass of {} {} produced {} notes",
        report.info.id,
        report.info.version,
        report.notes.len()
    );
    for note in &report.notes {
        let summary = note.rendered_summary();
        let message = note.rendered_message();
        match note.level {
            NoteLevel::Info => {
                info!(id = %note.id, note_type = %note.note_type, "{}: {}", summary, message)
            }
            NoteLevel::Warning => {
                warn!(id = %note.id, note_type = %note.note_type, "{}: {}", summary, message)
            }
            NoteLevel::Error => {
                error!(id = %note.id, note_type = %note.note_type, "{}: {}", summary, message)
            }
        }
    }
}
