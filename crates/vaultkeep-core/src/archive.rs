//! Archive builder
//!
//! Packs the service data directory into a gzip-compressed tar with paths
//! relative to the directory root, so unpacking into an emptied data directory
//! reproduces it exactly. Directories and symlinks are stored as such.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Names that are never worth backing up
const EXCLUDED_NAMES: &[&str] = &["lost+found", ".DS_Store", "Thumbs.db"];

/// Suffixes of editor/temp leftovers
const EXCLUDED_SUFFIXES: &[&str] = &[".bak", ".tmp", ".swp"];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Default inclusion predicate for archive entries
pub fn is_file_allowed(name: &str) -> bool {
    if EXCLUDED_NAMES.contains(&name) {
        return false;
    }
    !EXCLUDED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// What went into an archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    /// Bytes of regular file content, before compression
    pub bytes: u64,
    /// Entries rejected by the inclusion predicate
    pub skipped: usize,
}

impl ArchiveStats {
    pub fn entries(&self) -> usize {
        self.files + self.directories + self.symlinks
    }
}

fn build_error(context: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::ArchiveBuild(format!("{} {}: {}", context, path.display(), e))
}

/// Pack `source` into a `.tar.gz` at `dest`
///
/// Entries whose file name fails `include` are skipped, along with everything
/// below a skipped directory. On failure the partial archive is removed.
pub fn build_archive<F>(source: &Path, dest: &Path, include: F) -> Result<ArchiveStats>
where
    F: Fn(&str) -> bool,
{
    let result = write_archive(source, dest, &include);
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

fn write_archive(source: &Path, dest: &Path, include: &dyn Fn(&str) -> bool) -> Result<ArchiveStats> {
    if !source.is_dir() {
        return Err(build_error("Source is not a directory:", source, "missing"));
    }

    let file = File::create(dest).map_err(|e| build_error("Failed to create", dest, e))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut stats = ArchiveStats::default();
    append_tree(&mut builder, source, source, include, &mut stats)?;

    let encoder = builder
        .into_inner()
        .map_err(|e| build_error("Failed to finish", dest, e))?;
    let mut writer = encoder
        .finish()
        .map_err(|e| build_error("Failed to compress", dest, e))?;
    writer
        .flush()
        .map_err(|e| build_error("Failed to write", dest, e))?;

    info!(
        "Archived {} files, {} directories, {} symlinks ({} bytes) from {}",
        stats.files,
        stats.directories,
        stats.symlinks,
        stats.bytes,
        source.display()
    );
    Ok(stats)
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    dir: &Path,
    include: &dyn Fn(&str) -> bool,
    stats: &mut ArchiveStats,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| build_error("Failed to read", dir, e))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| build_error("Failed to read", dir, e))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        if !include(&name.to_string_lossy()) {
            debug!("Skipping {}", path.display());
            stats.skipped += 1;
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .map_err(|e| build_error("Unexpected path", &path, e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| build_error("Failed to stat", &path, e))?;

        if file_type.is_dir() {
            builder
                .append_dir(relative, &path)
                .map_err(|e| build_error("Failed to add", &path, e))?;
            stats.directories += 1;
            append_tree(builder, root, &path, include, stats)?;
        } else {
            builder
                .append_path_with_name(&path, relative)
                .map_err(|e| build_error("Failed to add", &path, e))?;
            if file_type.is_symlink() {
                stats.symlinks += 1;
            } else {
                stats.files += 1;
                stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
    }

    Ok(())
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>> {
    let mut file = File::open(path)
        .map_err(|e| Error::Validation(format!("Cannot open {}: {}", path.display(), e)))?;

    let mut magic = [0u8; 2];
    let is_gzip = file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC;
    if !is_gzip {
        return Err(Error::Validation(format!(
            "{} is not a gzip-compressed archive",
            path.display()
        )));
    }

    // Reopen rather than seek so the decoder sees the header
    let file = File::open(path)?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

/// Check that `path` is a complete, readable archive
///
/// Reads every entry to the end so truncation and checksum errors surface here
/// rather than halfway through an unpack. Returns the number of entries.
pub fn validate_archive(path: &Path) -> Result<usize> {
    let mut archive = open_archive(path)?;
    let invalid = |e: io::Error| Error::Validation(format!("{}: {}", path.display(), e));

    let mut count = 0usize;
    for entry in archive.entries().map_err(invalid)? {
        let mut entry = entry.map_err(invalid)?;
        io::copy(&mut entry, &mut io::sink()).map_err(invalid)?;
        count += 1;
    }

    if count == 0 {
        return Err(Error::Validation(format!(
            "{} contains no entries",
            path.display()
        )));
    }

    debug!("Validated archive {} ({} entries)", path.display(), count);
    Ok(count)
}

/// Extract an archive into `dest`
///
/// Entries that would land outside `dest` are refused by the tar reader.
pub fn unpack_archive(path: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = open_archive(path)?;
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(dest).map_err(|e| {
        Error::Io(io::Error::new(
            e.kind(),
            format!("Failed to unpack {}: {}", path.display(), e),
        ))
    })?;

    info!("Unpacked {} into {}", path.display(), dest.display());
    Ok(())
}

/// Remove every entry under `dir`, leaving `dir` itself in place
///
/// Symlinks are removed, never followed.
pub fn clear_directory(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(0);
    }

    let mut removed = 0usize;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }

    info!("Cleared {} entries from {}", removed, dir.display());
    Ok(removed)
}
