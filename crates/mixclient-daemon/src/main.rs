//! mixclientd: the mixnet client daemon.
//!
//! Runs one send and one fetch pipeline per configured account against the
//! providers named in the signed consensus.
//!
//! ```text
//! mixclientd                 run with $MIXCLIENT_DATA_DIR/config.toml
//! mixclientd keygen <file>   write a new account identity key
//! ```

mod config;
mod epoch;
mod events;
mod keys;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mixclient_crypto::ed25519::VerifyingKey;
use mixclient_db::SqliteStore;
use mixclient_engine::Engine;
use mixclient_path::consensus::{ConsensusCache, ConsensusSource, StaticConsensusFile};
use mixclient_path::directory::UserDirectory;
use mixclient_transport::quic::{QuicConfig, QuicTransport};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("keygen") => {
            let path = args
                .get(1)
                .map(PathBuf::from)
                .context("usage: mixclientd keygen <file>")?;
            let secret = keys::generate(&path)?;
            println!("{}", hex::encode(secret.public_key().as_bytes()));
            return Ok(());
        }
        Some(other) => anyhow::bail!("unknown command {other:?}"),
        None => {}
    }

    // 1. Load config
    let config = DaemonConfig::load()?;
    config.validate()?;
    init_tracing(&config)?;
    info!(version = env!("CARGO_PKG_VERSION"), "mixclient daemon starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    // 2. Open database
    let store = Arc::new(SqliteStore::open(&config.data_path(&config.storage.database))?);

    // 3. Consensus and recipient directory
    let authority = VerifyingKey::from_hex(&config.pki.authority_public_key)
        .context("pki.authority_public_key")?;
    let source: Arc<dyn ConsensusSource> = Arc::new(StaticConsensusFile::new(
        config.data_path(&config.pki.consensus_file),
        authority,
    ));
    let consensus = Arc::new(ConsensusCache::from_snapshot(
        source.fetch_consensus(0).await.context("loading consensus")?,
    )?);
    let directory = Arc::new(
        UserDirectory::load(config.data_path(&config.pki.user_directory_file))
            .context("loading user directory")?,
    );

    // 4. Accounts
    let accounts = keys::load_accounts(&config);
    if accounts.is_empty() {
        anyhow::bail!("no account could be started");
    }

    // 5. Transport and engine
    let transport = Arc::new(QuicTransport::new(QuicConfig::default())?);
    let (engine, engine_events) = Engine::start(
        config.engine_config(),
        accounts,
        consensus,
        directory,
        Arc::clone(&transport) as Arc<dyn mixclient_transport::session::Transport>,
        store,
    )
    .await?;
    for (account, reason) in engine.aborted() {
        warn!(%account, %reason, "account not started");
    }
    let engine = Arc::new(engine);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event_task = tokio::spawn(events::run(engine_events));
    let epoch_task = tokio::spawn(epoch::run(
        Arc::clone(&engine),
        source,
        Duration::from_secs(config.pki.consensus_refresh_secs.max(1)),
        shutdown_rx,
    ));

    // 6. Run until interrupted
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => error!(error = %e, "signal handler failed, shutting down"),
    }

    // Graceful shutdown
    let _ = shutdown_tx.send(true);
    engine.shutdown().await;
    if let Err(e) = epoch_task.await {
        warn!(error = %e, "epoch task ended abnormally");
    }
    drop(engine);
    event_task.abort();
    transport.close();

    info!("daemon stopped");
    Ok(())
}

fn init_tracing(config: &DaemonConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("mixclient={}", config.logging.level).parse()?);
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = open_log(&config.data_path(&config.logging.file))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    }
    Ok(())
}

fn open_log(path: &Path) -> anyhow::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}
