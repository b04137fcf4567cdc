use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn absolute_path(path: PathBuf) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Flushes directory metadata (renames, new entries) to stable storage.
pub fn sync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

/// Writes a newline separated list of host names.
pub fn write_host_file(path: &Path, hosts: &[String]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    for host in hosts {
        writeln!(file, "{host}")?;
    }
    file.sync_all()
}
