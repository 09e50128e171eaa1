// Job directory preparation: download and unpack the job's files.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use grader_common::constants::blob_keys::JOB_ARCHIVE;
use grader_sdk::{StringUtil, TraceWriter};
use std::fs::File;
use std::path::Path;
use tempfile::TempDir;

use crate::blob_store::BlobStore;
use crate::job_message::GradingJob;

/// Create `job_<jobId>_…` under the system temp directory, fill it from
/// `{s3RootKey}/job.tar.gz` and make the entrypoint executable.
///
/// The directory is deleted when the returned `TempDir` is dropped.
pub async fn prepare(
    job: &GradingJob,
    blob_store: &dyn BlobStore,
    trace: &dyn TraceWriter,
) -> Result<TempDir> {
    let job_dir = tempfile::Builder::new()
        .prefix(&format!(
            "job_{}_",
            StringUtil::format_into_safe_filename(&job.job_id)
        ))
        .tempdir()
        .context("Failed to create job directory")?;
    trace.info(&format!("Job directory: {}", job_dir.path().display()));

    let archive = tempfile::Builder::new()
        .prefix("job_archive_")
        .suffix(".tar.gz")
        .tempfile()
        .context("Failed to create temporary archive file")?;
    blob_store
        .download_to_file(&job.s3_bucket, &job.blob_key(JOB_ARCHIVE), archive.path())
        .await
        .context("Failed to download job files")?;

    let archive_path = archive.path().to_path_buf();
    let dest = job_dir.path().to_path_buf();
    tokio::task::spawn_blocking(move || extract_archive(&archive_path, &dest))
        .await
        .context("Extraction task panicked")??;
    trace.verbose("Extracted job files");

    if let Some(relative) = job.entrypoint_relative_path() {
        let entrypoint = job_dir.path().join(relative);
        if let Err(e) = make_executable(&entrypoint) {
            trace.warning(&format!(
                "Could not make {} executable: {e:#}",
                entrypoint.display()
            ));
        }
    }

    Ok(job_dir)
}

/// Unpack a gzip-compressed tarball into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
        .with_context(|| format!("Failed to extract job files into {}", dest.display()))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
