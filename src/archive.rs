use anyhow::{Context, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Zips the whole job directory into a sibling
/// `<job_id>_results.zip` and returns the archive path. Entry names
/// are relative to the job directory.
pub fn archive_job_dir(job_dir: &Path) -> Result<PathBuf> {
    let job_id = job_dir
        .file_name()
        .and_then(|n| n.to_str())
        .context("job directory has no name")?;
    let parent = job_dir
        .parent()
        .context("job directory has no parent")?;
    let zip_path = parent.join(format!("{job_id}_results.zip"));

    let file = File::create(&zip_path)
        .with_context(|| format!("cannot create archive at {}", zip_path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(job_dir).sort_by_file_name() {
        let entry = entry.context("walking job directory")?;
        let rel = entry
            .path()
            .strip_prefix(job_dir)
            .context("entry outside job directory")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = rel.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            writer.add_directory(&name, options)?;
        } else {
            writer.start_file(&name, options)?;
            let mut src = File::open(entry.path())
                .with_context(|| format!("cannot read {}", entry.path().display()))?;
            io::copy(&mut src, &mut writer)?;
        }
    }

    writer.finish()?;
    debug!("archived {} to {}", job_dir.display(), zip_path.display());
    Ok(zip_path)
}
