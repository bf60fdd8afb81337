mod cli;
mod config;
mod database;
mod error;
mod filter;
mod migrate;
mod processor;
mod rewrite;
mod scan;
mod server;
mod stats;
mod targets;
mod triggers;
mod utils;

use clap::Parser;
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::{error, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::cli::Cli;
use crate::config::Config;
use crate::database::Database;
use crate::error::AutoscanError;
use crate::processor::{Processor, ProcessorConfig};
use crate::targets::autoscan::AutoscanPeerTarget;
use crate::targets::emby::EmbyTarget;
use crate::targets::jellyfin::JellyfinTarget;
use crate::targets::plex::PlexTarget;
use crate::targets::Target;
use crate::triggers::drive::engine::DriveEngine;
use crate::triggers::drive::limiter::limiter_for_account;
use crate::triggers::drive::store::MirrorStore;
use crate::triggers::drive::DriveDaemon;
use crate::triggers::inotify::InotifyTrigger;

/// Back-off applied whenever the pipeline has nothing to do or a collaborator
/// is temporarily gone.
const RETRY_DELAY: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::load(&cli.config_path()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed loading config: {err}");
            std::process::exit(1);
        }
    };

    setup_logging(&cli, &config);

    // datastore
    let db = match open_database(&cli, &config) {
        Ok(db) => Arc::new(db),
        Err(err) => fatal("Failed opening datastore", err),
    };

    // processor
    let processor = match Processor::new(
        ProcessorConfig {
            anchors: config.anchors.clone(),
            minimum_age: config.minimum_age,
        },
        Arc::clone(&db),
    ) {
        Ok(processor) => Arc::new(processor),
        Err(err) => fatal("Failed initialising processor", err),
    };

    info!(
        "Initialised processor: min_age={:?} anchors={:?}",
        config.minimum_age, config.anchors
    );

    match db.server_version() {
        Ok(version) => info!("Initialised database: {version}"),
        Err(err) => fatal("Failed getting database version", err),
    }

    if !config.authentication.is_enabled() {
        warn!("Webhooks running without authentication");
    }

    // daemon triggers
    for drive_config in &config.triggers.bernard {
        let limiter = match limiter_for_account(&drive_config.account) {
            Ok(limiter) => limiter,
            Err(err) => fatal("Failed initialising drive rate limiter", err),
        };

        let store = match MirrorStore::open(&drive_config.database) {
            Ok(store) => Arc::new(store),
            Err(err) => fatal("Failed opening drive mirror", err),
        };

        let engine = match DriveEngine::new(
            &drive_config.account,
            Arc::clone(&store),
            Arc::clone(&limiter),
        ) {
            Ok(engine) => engine,
            Err(err) => fatal("Failed initialising drive engine", err),
        };

        if let Err(err) = DriveDaemon::spawn(
            drive_config.clone(),
            engine,
            store,
            limiter,
            Arc::clone(&processor),
        ) {
            fatal("Failed initialising trigger: bernard", err);
        }
    }

    for inotify_config in &config.triggers.inotify {
        if let Err(err) = InotifyTrigger::spawn(inotify_config.clone(), Arc::clone(&processor)) {
            fatal("Failed initialising trigger: inotify", err);
        }
    }

    // http triggers
    let router = match server::build_router(&config, Arc::clone(&processor)) {
        Ok(router) => router,
        Err(err) => fatal("Failed initialising triggers", err),
    };

    for host in &config.host {
        let addr = if host.contains(':') {
            host.clone()
        } else {
            let host = if host.is_empty() { "0.0.0.0" } else { host };
            format!("{host}:{}", config.port)
        };

        let router = router.clone();
        tokio::spawn(async move {
            info!("Starting server on {addr}");

            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!("Failed starting web server on {addr}: {err}");
                    std::process::exit(1);
                }
            };

            if let Err(err) = axum::serve(listener, router).await {
                error!("Web server on {addr} failed: {err}");
                std::process::exit(1);
            }
        });
    }

    info!(
        "Initialised triggers: manual=1 a-train=1 bernard={} inotify={} lidarr={} radarr={} readarr={} sonarr={}",
        config.triggers.bernard.len(),
        config.triggers.inotify.len(),
        config.triggers.lidarr.len(),
        config.triggers.radarr.len(),
        config.triggers.readarr.len(),
        config.triggers.sonarr.len(),
    );

    // targets
    let targets = match init_targets(&config).await {
        Ok(targets) => targets,
        Err(err) => fatal("Failed initialising targets", err),
    };

    info!(
        "Initialised targets: autoscan={} emby={} jellyfin={} plex={}",
        config.targets.autoscan.len(),
        config.targets.emby.len(),
        config.targets.jellyfin.len(),
        config.targets.plex.len(),
    );

    // scan stats
    if config.scan_stats > Duration::ZERO {
        tokio::spawn(stats::scan_stats(Arc::clone(&processor), config.scan_stats));
    }

    info!("Initialised");

    run_processor(processor, targets, &config).await;
}

fn setup_logging(cli: &Cli, config: &Config) {
    let level = match cli.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let mut spec = format!("autoscan={level}");
    for (module, verbosity) in config.verbosity_overrides() {
        spec.push_str(&format!(", {module}={verbosity}"));
    }

    Logger::try_with_str(&spec)
        .unwrap()
        .log_to_file(FileSpec::try_from(cli.log_path()).unwrap())
        .duplicate_to_stderr(Duplicate::All)
        .start()
        .unwrap();
}

fn open_database(cli: &Cli, config: &Config) -> Result<Database, AutoscanError> {
    match config.database.kind.as_str() {
        "sqlite" => Database::open_sqlite(&cli.database_path()),
        "postgres" => Database::open_postgres(
            &config.database.host,
            config.database.port,
            &config.database.name,
            &config.database.username,
            &config.database.password,
        ),
        other => Err(AutoscanError::Config(format!("unknown database type: {other}"))),
    }
}

async fn init_targets(config: &Config) -> Result<Vec<Arc<dyn Target>>, AutoscanError> {
    let mut targets: Vec<Arc<dyn Target>> = Vec::new();

    for target_config in &config.targets.autoscan {
        targets.push(Arc::new(AutoscanPeerTarget::new(target_config.clone())?));
    }

    for target_config in &config.targets.plex {
        targets.push(Arc::new(PlexTarget::new(target_config.clone()).await?));
    }

    for target_config in &config.targets.emby {
        targets.push(Arc::new(EmbyTarget::new(target_config.clone())?));
    }

    for target_config in &config.targets.jellyfin {
        targets.push(Arc::new(JellyfinTarget::new(target_config.clone()).await?));
    }

    Ok(targets)
}

/// The driving loop: alternates availability probing and dispatch cycles. A
/// fatal error parks the loop forever; triggers keep accepting scans into the
/// durable store so nothing is lost while an operator investigates.
async fn run_processor(processor: Arc<Processor>, targets: Vec<Arc<dyn Target>>, config: &Config) {
    info!("Processor started");

    if targets.is_empty() {
        warn!("No targets initialised, processor stopped, triggers will continue...");
        futures::future::pending::<()>().await;
    }

    let mut targets_available = false;

    loop {
        if !targets_available {
            match processor.check_availability(&targets).await {
                Ok(()) => targets_available = true,
                Err(err @ AutoscanError::TargetUnavailable(_)) => {
                    error!("Not all targets are available, retrying in 15 seconds...: {err}");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
                Err(err) => {
                    error!(
                        "Fatal error occurred while checking target availability, \
                         processor stopped, triggers will continue...: {err}"
                    );
                    futures::future::pending::<()>().await;
                }
            }
        }

        match processor.process(&targets).await {
            Ok(()) => {
                // pace successful requests to reduce the load on targets
                tokio::time::sleep(config.scan_delay).await;
            }
            Err(AutoscanError::NoScans) => {
                trace!("No scans are available, retrying in 15 seconds...");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err @ AutoscanError::AnchorUnavailable(_)) => {
                error!("Not all anchor files are available, retrying in 15 seconds...: {err}");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err @ AutoscanError::TargetUnavailable(_)) => {
                targets_available = false;
                error!("Not all targets are available, retrying in 15 seconds...: {err}");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => {
                error!(
                    "Fatal error occurred while processing targets, \
                     processor stopped, triggers will continue...: {err}"
                );
                futures::future::pending::<()>().await;
            }
        }
    }
}

fn fatal(context: &str, err: AutoscanError) -> ! {
    error!("{context}: {err}");
    eprintln!("{context}: {err}");
    std::process::exit(1);
}
