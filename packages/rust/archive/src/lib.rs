//! Package archive extraction.
//!
//! TED daily packages ship as `.tar.gz` archives, older mirrors as `.zip`.
//! [`extract`] trusts a recognized file-name suffix; otherwise it probes
//! tar.gz first, then zip. The extractor never interprets content, it only
//! unpacks it under the destination directory.

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use tedsync_shared::{ContainerFormat, Result, TedSyncError};

/// Formats tried, in order, when the file name carries no recognized suffix.
const PROBE_ORDER: [ContainerFormat; 2] = [ContainerFormat::TarGz, ContainerFormat::Zip];

/// Extract `path` into `dest`, inferring the format from the file name.
///
/// Returns the regular files written, sorted.
pub fn extract(path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    extract_with(path, dest, None)
}

/// Extract `path` into `dest` using `hint` (or the file-name suffix) as the
/// format. Without either, probes [`PROBE_ORDER`].
#[instrument(skip_all, fields(path = %path.display()))]
pub fn extract_with(
    path: &Path,
    dest: &Path,
    hint: Option<ContainerFormat>,
) -> Result<Vec<PathBuf>> {
    // Surface a missing/unreadable package as I/O, not as a format problem
    File::open(path).map_err(|e| TedSyncError::io(path, e))?;
    std::fs::create_dir_all(dest).map_err(|e| TedSyncError::io(dest, e))?;

    let mut files = match hint.or_else(|| ContainerFormat::from_file_name(path)) {
        Some(format) => unpack(format, path, dest).map_err(|message| {
            TedSyncError::CorruptArchive {
                path: path.to_path_buf(),
                message,
            }
        })?,
        None => probe(path, dest)?,
    };

    files.sort();
    info!(files = files.len(), dest = %dest.display(), "package extracted");
    Ok(files)
}

fn probe(path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    for format in PROBE_ORDER {
        match unpack(format, path, dest) {
            Ok(files) => {
                debug!(%format, "format detected by probing");
                return Ok(files);
            }
            Err(e) => debug!(%format, error = %e, "probe failed"),
        }
    }
    Err(TedSyncError::UnsupportedFormat {
        path: path.to_path_buf(),
    })
}

fn unpack(format: ContainerFormat, path: &Path, dest: &Path) -> std::result::Result<Vec<PathBuf>, String> {
    match format {
        ContainerFormat::TarGz => unpack_tar_gz(path, dest),
        ContainerFormat::Zip => unpack_zip(path, dest),
    }
}

fn unpack_tar_gz(path: &Path, dest: &Path) -> std::result::Result<Vec<PathBuf>, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut written = Vec::new();

    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let relative = clean_relative(&entry.path().map_err(|e| e.to_string())?);
        let is_file = entry.header().entry_type().is_file();

        // unpack_in refuses entries that would land outside `dest`
        if !entry.unpack_in(dest).map_err(|e| e.to_string())? {
            warn!(entry = %relative.display(), "skipping entry outside extraction dir");
            continue;
        }
        if is_file {
            written.push(dest.join(relative));
        }
    }

    Ok(written)
}

fn unpack_zip(path: &Path, dest: &Path) -> std::result::Result<Vec<PathBuf>, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| e.to_string())?;
    let mut written = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| e.to_string())?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping entry outside extraction dir");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| e.to_string())?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let mut out = File::create(&target).map_err(|e| e.to_string())?;
        std::io::copy(&mut entry, &mut out).map_err(|e| e.to_string())?;
        written.push(target);
    }

    Ok(written)
}

/// Drop `.` and root components so `./a/b.xml` and `a/b.xml` map to the same path.
fn clean_relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Recursively collect every `*.xml` file under `dir`, sorted.
pub fn find_xml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            TedSyncError::io(path, e.into())
        })?;
        if entry.file_type().is_file() && is_xml(entry.path()) {
            found.push(entry.into_path());
        }
    }

    found.sort();
    info!(count = found.len(), "found XML files");
    Ok(found)
}

fn is_xml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
}
