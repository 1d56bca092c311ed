//! The `vcoind` daemon: configuration, data directory, block import, and shutdown.

pub mod config;
pub mod import;
pub mod lock;
pub mod store;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vcoin_chainstate::state::{ChainState, ChainStateOptions, ShutdownSignal};
use vcoin_consensus::hash256_to_hex;
use vcoin_consensus::params::chain_params;
use vcoin_log::{log_error, log_info, log_warn};
use vcoin_storage::KeyValueStore;

use crate::config::{usage, Backend, CliAction, Config};
use crate::import::{block_file_path, import_files, reindex_block_files};
use crate::lock::lock_data_dir;
use crate::store::Store;

const DB_DIR_NAME: &str = "db";
const BLOCKS_DIR_NAME: &str = "blocks";
const INTERRUPT_REASON: &str = "interrupt received";
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("vcoind {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(*config).await,
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    let start_time = Instant::now();
    vcoin_log::init(config.log.clone());
    log_info!(
        "Startup: network={}, backend={:?}, data_dir={}, script_threads={}",
        config.network.as_str(),
        config.backend,
        config.data_dir.display(),
        config.script_threads
    );

    let data_dir = &config.data_dir;
    let db_path = data_dir.join(DB_DIR_NAME);
    let blocks_dir = data_dir.join(BLOCKS_DIR_NAME);
    fs::create_dir_all(&blocks_dir)
        .map_err(|err| format!("failed to create {}: {err}", blocks_dir.display()))?;
    let _data_dir_lock = lock_data_dir(data_dir)?;

    if config.reindex && config.backend == Backend::Fjall {
        log_info!("Reindex requested; removing {}", db_path.display());
        store::wipe(&db_path)?;
    }
    let store = Arc::new(Store::open(config.backend, &db_path)?);
    let reindex = config.reindex
        || (store.is_volatile() && block_file_path(&blocks_dir, 0).exists());

    let shutdown = ShutdownSignal::new();
    spawn_signal_listener(shutdown.clone());

    let options = ChainStateOptions {
        relay: config.relay.clone(),
        coin_cache_size: config.coin_cache_size,
        txindex: config.txindex,
        script_threads: config.script_threads,
    };
    let chain = ChainState::open(
        chain_params(config.network),
        Arc::clone(&store),
        &blocks_dir,
        options,
    )
    .map_err(|err| format!("failed to open chain state: {err}"))?
    .with_shutdown(shutdown.clone());
    let chain = Arc::new(chain);

    chain
        .load()
        .map_err(|err| format!("failed to load block index: {err}"))?;
    if reindex {
        chain
            .set_reindexing(true)
            .map_err(|err| format!("failed to set reindex flag: {err}"))?;
    }
    // Records the index flags; while reindexing genesis comes back from the block files.
    chain
        .init_genesis()
        .map_err(|err| format!("failed to initialize genesis: {err}"))?;
    log_info!(
        "Startup: block index ready in {}ms",
        start_time.elapsed().as_millis()
    );

    let startup = StartupTasks {
        blocks_dir: blocks_dir.clone(),
        imports: config.imports.clone(),
        check_level: config.check_level,
        check_blocks: config.check_blocks,
    };
    let worker_chain = Arc::clone(&chain);
    let result = tokio::task::spawn_blocking(move || startup.run(&worker_chain))
        .await
        .map_err(|err| format!("startup task failed: {err}"))
        .and_then(|result| result);

    let outcome = match result {
        Ok(()) => {
            log_info!("Node ready; waiting for shutdown");
            wait_for_shutdown(&shutdown).await;
            Ok(())
        }
        Err(_) if shutdown.is_requested() => Ok(()),
        Err(err) => {
            shutdown.request(err.clone());
            Err(err)
        }
    };

    log_info!("Shutdown: flushing state");
    let flushed = flush_state(&chain, &store);
    let outcome = outcome.and(flushed);
    match shutdown.reason() {
        Some(reason) if reason != INTERRUPT_REASON && outcome.is_ok() => {
            log_error!("Shutdown: {reason}");
            Err(reason)
        }
        _ => {
            log_info!("Shutdown: done");
            outcome
        }
    }
}

/// Work done once the index is loaded: reindex, imports, and the startup check.
struct StartupTasks {
    blocks_dir: PathBuf,
    imports: Vec<PathBuf>,
    check_level: u32,
    check_blocks: i32,
}

impl StartupTasks {
    fn run<S: KeyValueStore>(&self, chain: &ChainState<S>) -> Result<(), String> {
        if chain.is_reindexing() {
            reindex_block_files(chain, &self.blocks_dir)?;
            chain
                .init_genesis()
                .map_err(|err| format!("failed to initialize genesis: {err}"))?;
        }
        if !self.imports.is_empty() {
            let loaded = import_files(chain, &self.imports)?;
            log_info!("Import: {} blocks from {} files", loaded, self.imports.len());
        }

        log_info!(
            "Verifying last {} blocks at level {}",
            self.check_blocks,
            self.check_level
        );
        chain.verify_chain(self.check_level, self.check_blocks).map_err(|err| {
            format!("block database is corrupted ({err}); restart with --reindex to rebuild it")
        })?;

        log_tip(chain);
        Ok(())
    }
}

fn log_tip<S: KeyValueStore>(chain: &ChainState<S>) {
    match chain.tip() {
        Ok(Some(tip)) => log_info!(
            "Best chain: height {} hash {} transactions {}",
            tip.height,
            hash256_to_hex(&tip.hash),
            tip.chain_tx
        ),
        Ok(None) => log_warn!("Best chain: none"),
        Err(err) => log_warn!("Best chain unavailable: {err}"),
    }
}

fn spawn_signal_listener(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log_info!("Shutdown: interrupt received");
                shutdown.request(INTERRUPT_REASON);
            }
            Err(err) => log_warn!("failed to listen for ctrl-c: {err}"),
        }
    });
}

async fn wait_for_shutdown(shutdown: &ShutdownSignal) {
    let mut ticker = tokio::time::interval(SHUTDOWN_POLL_INTERVAL);
    while !shutdown.is_requested() {
        ticker.tick().await;
    }
}

fn flush_state(chain: &ChainState<Store>, store: &Store) -> Result<(), String> {
    chain
        .flush()
        .map_err(|err| format!("failed to flush chain state: {err}"))?;
    store
        .persist()
        .map_err(|err| format!("failed to persist database: {err}"))
}
