//! Replaying block files into the chain state.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use vcoin_chainstate::state::{ChainState, ChainStateError};
use vcoin_log::{log_info, log_warn};
use vcoin_storage::KeyValueStore;

pub fn block_file_path(blocks_dir: &Path, file: u32) -> PathBuf {
    blocks_dir.join(format!("blk{file:05}.dat"))
}

/// Rebuilds the index from `blk00000.dat` onwards, stopping at the first missing file.
/// Blocks already indexed from an interrupted run are skipped by the chain state.
pub fn reindex_block_files<S: KeyValueStore>(
    chain: &ChainState<S>,
    blocks_dir: &Path,
) -> Result<usize, String> {
    let started = Instant::now();
    let mut total = 0usize;
    let mut file = 0u32;
    loop {
        let path = block_file_path(blocks_dir, file);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
        };
        log_info!("Reindexing block file {}", path.display());
        total += chain
            .load_external_blocks(&bytes, Some(file))
            .map_err(|err| chain_error(&path, err))?;
        file += 1;
    }
    chain
        .set_reindexing(false)
        .map_err(|err| format!("failed to clear reindex flag: {err}"))?;
    log_info!(
        "Reindex: {} blocks from {} files in {}ms",
        total,
        file,
        started.elapsed().as_millis()
    );
    Ok(total)
}

/// Feeds external block files in order. A missing file is skipped with a warning.
pub fn import_files<S: KeyValueStore>(
    chain: &ChainState<S>,
    files: &[PathBuf],
) -> Result<usize, String> {
    let mut total = 0usize;
    for path in files {
        if chain.shutdown_signal().is_requested() {
            break;
        }
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                log_warn!("Import: cannot read {}: {err}", path.display());
                continue;
            }
        };
        log_info!("Importing blocks from {}", path.display());
        total += chain
            .load_external_blocks(&bytes, None)
            .map_err(|err| chain_error(path, err))?;
    }
    Ok(total)
}

fn chain_error(path: &Path, err: ChainStateError) -> String {
    format!("failed to load blocks from {}: {err}", path.display())
}
