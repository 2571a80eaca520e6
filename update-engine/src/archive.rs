//! Package staging: tar.gz extraction into an engine-owned directory.

use flate2::read::GzDecoder;
use std::fs::File;
use std::path::Path;
use tracing::info;

use crate::error::{EngineError, Result};

/// Extract a `.tar.gz` package into `dest`. `dest` is created fresh; a
/// pre-existing directory is wiped first so a retried staging never sees
/// leftovers from an earlier attempt.
pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    if !archive.is_file() {
        return Err(EngineError::Integrity(format!(
            "package not found: {}",
            archive.display()
        )));
    }

    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::create_dir_all(dest)?;

    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest).map_err(|e| {
        EngineError::Integrity(format!("failed to extract {}: {}", archive.display(), e))
    })?;

    info!("Extracted package {} to {}", archive.display(), dest.display());
    Ok(())
}
