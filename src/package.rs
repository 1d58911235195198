//! Builds the deployable zip archive of a worker function.
//!
//! The archive holds the worker source, its shared modules and the job
//! descriptor, all at the archive root.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use glob::glob;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::FunctionConfig;
use crate::descriptor::DESCRIPTOR_FILE;
use crate::error::{JobError, JobResult};

fn entry_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Resolves the worker source and the shared-file patterns into archive
/// entry names. Two different files may not claim the same entry.
fn collect_sources(function: &FunctionConfig) -> JobResult<BTreeMap<String, PathBuf>> {
    let fail = |msg: String| JobError::packaging(&function.name, msg);
    let mut entries: BTreeMap<String, PathBuf> = BTreeMap::new();

    let mut add = |path: PathBuf| -> JobResult<()> {
        let name = entry_name(&path).ok_or_else(|| fail(format!("{} has no file name", path.display())))?;
        if name == DESCRIPTOR_FILE {
            return Err(fail(format!("{} is reserved for the job descriptor", name)));
        }
        match entries.get(&name) {
            Some(existing) if existing == &path => Ok(()),
            Some(existing) => Err(fail(format!(
                "{} and {} both map to archive entry {}",
                existing.display(),
                path.display(),
                name
            ))),
            None => {
                entries.insert(name, path);
                Ok(())
            }
        }
    };

    add(PathBuf::from(&function.name))?;
    for pattern in &function.shared_files {
        let mut matched = false;
        for path in glob(pattern).map_err(|e| fail(format!("bad pattern {}: {}", pattern, e)))? {
            let path = path.map_err(|e| fail(e.to_string()))?;
            if path.is_file() {
                matched = true;
                add(path)?;
            }
        }
        if !matched {
            return Err(fail(format!("pattern {} matched no files", pattern)));
        }
    }
    Ok(entries)
}

/// Zips the worker's files plus `descriptor` (as `jobconfig.json`) into an
/// in-memory archive. Fails if any constituent file cannot be read.
pub fn package_artifact(function: &FunctionConfig, descriptor: &[u8]) -> JobResult<Bytes> {
    let fail = |msg: String| JobError::packaging(&function.name, msg);
    let entries = collect_sources(function)?;

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for (name, path) in &entries {
        let data = std::fs::read(path)
            .map_err(|e| fail(format!("cannot read {}: {}", path.display(), e)))?;
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| fail(e.to_string()))?;
        writer.write_all(&data).map_err(|e| fail(e.to_string()))?;
        debug!("Packed {} ({} bytes) into {}", path.display(), data.len(), function.zip);
    }
    writer
        .start_file(DESCRIPTOR_FILE, options)
        .map_err(|e| fail(e.to_string()))?;
    writer.write_all(descriptor).map_err(|e| fail(e.to_string()))?;

    let archive = writer.finish().map_err(|e| fail(e.to_string()))?;
    Ok(Bytes::from(archive.into_inner()))
}

/// Packages on the blocking pool and writes the archive to the function's
/// `zip` path.
pub async fn package_to_file(function: FunctionConfig, descriptor: Bytes) -> JobResult<Bytes> {
    let name = function.name.clone();
    let zip_path = function.zip.clone();
    let archive = tokio::task::spawn_blocking(move || package_artifact(&function, &descriptor))
        .await
        .map_err(|e| JobError::packaging(&name, e))??;
    tokio::fs::write(&zip_path, &archive)
        .await
        .map_err(|e| JobError::packaging(&name, format!("cannot write {}: {}", zip_path, e)))?;
    Ok(archive)
}
