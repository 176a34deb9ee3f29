use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use sensor_ingest::{
    clock::measure_offset,
    driver::{ReplayDriver, SensorDriver},
    io::csv,
    models::{reading::SensorRole, session::SessionConfig},
    remote::{RemoteNode, http_rest::HttpRemote},
};
use session_sync::{
    config::{Config, load_config_path},
    fusion::{self, dataset},
    metadata::SyncMetadataStore,
    observability::{LogFormat, init_logging},
    replication::{self, Puller, Replicator, stats::PullState},
    server::{self, AppState, DriverFactory},
    store::{ChunkStore, MIRROR_PREFIX, StoreOptions, chunk::FINAL_NAME},
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(version, about = "Paired sensor session capture, replication and fusion")]
struct Cli {
    /// TOML config; defaults apply when omitted.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the producer HTTP server over the local chunk store.
    Serve(ServeCmd),
    /// Mirror one remote session.
    Pull(PullCmd),
    /// Measure the remote clock offset.
    Clock {
        /// Record the measurement into this mission's sync metadata.
        #[arg(long)]
        mission: Option<String>,
    },
    /// Fuse two finalized session files into unified.csv.
    Fuse(FuseCmd),
    /// Clean up after a crash: drop partial files, repair manifests.
    Recover,
}

#[derive(Args)]
struct ServeCmd {
    /// Feed started sessions from this CSV file instead of a live instrument.
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,
    /// Delay between replayed readings.
    #[arg(long, default_value_t = 100)]
    pace_ms: u64,
}

#[derive(Args)]
struct PullCmd {
    #[arg(long)]
    mission: String,
    #[arg(long)]
    session: String,
    /// Print the pending work and exit.
    #[arg(long)]
    dry_run: bool,
    /// Run a single pass.
    #[arg(long)]
    once: bool,
}

#[derive(Args)]
struct FuseCmd {
    #[arg(long)]
    mission: String,
    /// In-water session.csv; taken from the sync metadata when omitted.
    #[arg(long, value_name = "FILE")]
    inwater: Option<PathBuf>,
    /// Surface session.csv; taken from the sync metadata when omitted.
    #[arg(long, value_name = "FILE")]
    surface: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => load_config_path(p),
        None => {
            let mut cfg = Config::default();
            session_sync::config::normalize_config(&mut cfg)?;
            Ok(cfg)
        }
    }
}

fn remote(cfg: &Config) -> Result<HttpRemote> {
    HttpRemote::new(&cfg.replication.endpoint, cfg.replication.request_timeout())
        .with_context(|| format!("invalid endpoint {}", cfg.replication.endpoint))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    let cfg = load_config(cli.config.as_ref())?;

    match cli.cmd {
        Cmd::Serve(cmd) => serve(cfg, cmd).await,
        Cmd::Pull(cmd) => pull(cfg, cmd).await,
        Cmd::Clock { mission } => {
            let remote = remote(&cfg)?;
            let m = measure_offset(&remote, cfg.clock.round_trips).await;
            println!("{}", serde_json::to_string_pretty(&m)?);
            if let Some(mission) = mission {
                let dir = cfg.storage.root.join(&mission);
                SyncMetadataStore::new(&dir, mission).record_clock(m)?;
            }
            Ok(())
        }
        Cmd::Fuse(cmd) => fuse(cfg, cmd),
        Cmd::Recover => {
            let store = ChunkStore::new(StoreOptions::from_config(&cfg.storage));
            let report = store.recover().context("recovery failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn serve(cfg: Config, cmd: ServeCmd) -> Result<()> {
    let store = Arc::new(ChunkStore::new(StoreOptions::from_config(&cfg.storage)));
    let report = store.recover().context("recovery failed")?;
    tracing::info!(?report, "store recovered");

    let mut state = AppState::new(store).with_rate_limit(cfg.server.requests_per_second);
    if let Some(path) = cmd.replay {
        let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let readings = csv::readings_only(csv::parse_document(&text)?);
        let pace = Duration::from_millis(cmd.pace_ms);
        tracing::info!(path = %path.display(), readings = readings.len(), "replay driver enabled");
        let factory: DriverFactory = Arc::new(move |_: &SessionConfig| {
            Box::new(ReplayDriver::new(readings.clone()).with_pace(pace)) as Box<dyn SensorDriver>
        });
        state = state.with_driver(factory);
    }

    let listener = tokio::net::TcpListener::bind(cfg.server.bind)
        .await
        .with_context(|| format!("bind {}", cfg.server.bind))?;
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    server::serve(listener, state, shutdown).await?;
    Ok(())
}

async fn pull(cfg: Config, cmd: PullCmd) -> Result<()> {
    let remote: Arc<dyn RemoteNode> = Arc::new(remote(&cfg)?);
    let dir = cfg
        .storage
        .root
        .join(&cmd.mission)
        .join(format!("{MIRROR_PREFIX}{}", cmd.session));

    if cmd.dry_run {
        let diff = replication::plan(&*remote, &cmd.session, &dir).await?;
        println!("{diff}");
        return Ok(());
    }

    if cmd.once {
        let replicator = Replicator::new(cfg.replication.bandwidth_cap_bytes_per_sec);
        let puller = Puller::open(remote, replicator.limiter(), &cmd.session, dir)
            .await?
            .with_quota(cfg.storage.storage_quota_bytes);
        let _ = puller.tick().await;
        println!("{}", serde_json::to_string_pretty(&*puller.stats())?);
        return Ok(());
    }

    let replicator = Replicator::new(cfg.replication.bandwidth_cap_bytes_per_sec)
        .with_mirror_quota(cfg.storage.storage_quota_bytes);
    replicator
        .start_sync(&cmd.session, remote, dir, cfg.replication.poll_interval())
        .await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !replicator.is_syncing(&cmd.session) {
                    break;
                }
            }
        }
    }
    let Some(stats) = replicator.stop_sync(&cmd.session).await else {
        bail!("session {} was not syncing", cmd.session);
    };
    println!("{}", serde_json::to_string_pretty(&*stats)?);
    if stats.state == PullState::Error {
        bail!("sync halted: {}", stats.last_error.as_deref().unwrap_or("unknown error"));
    }
    Ok(())
}

fn fuse(cfg: Config, cmd: FuseCmd) -> Result<()> {
    let mission_dir = cfg.storage.root.join(&cmd.mission);
    let meta = SyncMetadataStore::new(&mission_dir, cmd.mission.clone()).load()?;

    let file_for = |explicit: Option<PathBuf>, role: SensorRole| -> Result<PathBuf> {
        if let Some(p) = explicit {
            return Ok(p);
        }
        meta.as_ref()
            .and_then(|m| m.sensor(role))
            .map(|r| PathBuf::from(&r.path).join(FINAL_NAME))
            .with_context(|| format!("no {role} session recorded for mission {}", cmd.mission))
    };
    let inwater_file = file_for(cmd.inwater, SensorRole::InWater)?;
    let surface_file = file_for(cmd.surface, SensorRole::Surface)?;

    let inwater = dataset::load_samples(&inwater_file).with_context(|| format!("load {}", inwater_file.display()))?;
    let surface = dataset::load_samples(&surface_file).with_context(|| format!("load {}", surface_file.display()))?;
    let drift = meta.as_ref().and_then(|m| m.drift_model);

    let rows = fusion::fuse(
        &inwater,
        &surface,
        drift.as_ref(),
        cfg.fusion.strategy,
        &cfg.fusion.params(),
    );
    let out = dataset::write_unified_csv(&mission_dir, &rows)?;
    println!("{} rows -> {}", rows.len(), out.display());
    Ok(())
}
