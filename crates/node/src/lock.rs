use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

/// Exclusive hold on a data directory, released when dropped.
pub struct DataDirLock {
    _file: File,
}

pub fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another vcoind may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_is_refused_until_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let held = lock_data_dir(dir.path()).expect("first lock");
        let err = match lock_data_dir(dir.path()) {
            Ok(_) => panic!("second lock should fail"),
            Err(err) => err,
        };
        assert!(err.contains("already locked"));
        assert!(err.contains("pid="));

        drop(held);
        lock_data_dir(dir.path()).expect("lock after release");
    }
}
