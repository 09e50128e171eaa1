// Job directory archiving: the whole working directory as a gzip tarball.

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Write `src` as a `.tar.gz` to `dest`.
///
/// Entries are stored under the directory's own name. Symlinks are stored
/// as links and never followed; sockets and other special files are skipped.
pub fn build_archive(src: &Path, dest: &Path) -> Result<()> {
    let root_name = src
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("job"));

    let file = File::create(dest)
        .with_context(|| format!("Failed to create archive {}", dest.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let file_type = entry.file_type();
        if !(file_type.is_dir() || file_type.is_file() || file_type.is_symlink()) {
            tracing::debug!("Skipping special file {}", entry.path().display());
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(src)
            .context("Walked outside the job directory")?;
        let name = root_name.join(relative);
        builder
            .append_path_with_name(entry.path(), &name)
            .with_context(|| format!("Failed to archive {}", entry.path().display()))?;
    }

    builder
        .into_inner()
        .context("Failed to finish archive")?
        .finish()
        .context("Failed to finish compression")?;
    Ok(())
}
