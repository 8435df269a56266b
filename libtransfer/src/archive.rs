//! Blocking pack/unpack of the `tar.gz` blob format.
//!
//! Two forms share one container format:
//! - a directory archive holds every file, directory (empty ones included) and
//!   symlink below the source root, with paths relative to that root;
//! - a single-file archive holds exactly two entries: the payload and a
//!   zero-byte entry named [`SINGLE_FILE_MARKER`].

use std::{
    fs::{self, File, Metadata},
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::error::{Result, TransferError};

/// Name of the sentinel entry that tags an archive as holding one file.
pub const SINGLE_FILE_MARKER: &str = "__is__single__file_archive__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveForm {
    SingleFile,
    Directory,
}

/// Pack `source` into `archive_path`, choosing the form from what `source` is.
pub fn pack(source: &Path, archive_path: &Path) -> Result<ArchiveForm> {
    let metadata = fs::metadata(source)
        .map_err(|_| TransferError::UnsupportedPath(source.to_path_buf()))?;
    if metadata.is_dir() {
        pack_directory(source, archive_path)?;
        Ok(ArchiveForm::Directory)
    } else if metadata.is_file() {
        pack_file(source, archive_path, &metadata)?;
        Ok(ArchiveForm::SingleFile)
    } else {
        Err(TransferError::UnsupportedPath(source.to_path_buf()))
    }
}

fn create_builder(archive_path: &Path) -> Result<Builder<GzEncoder<BufWriter<File>>>> {
    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    Ok(Builder::new(encoder))
}

fn finish_builder(builder: Builder<GzEncoder<BufWriter<File>>>) -> Result<()> {
    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(())
}

/// Archive a directory tree, we should pay attention to empty directories and symlinks
fn pack_directory(source: &Path, archive_path: &Path) -> Result<()> {
    tracing::debug!(
        "archiving directory {} to {}",
        source.display(),
        archive_path.display()
    );
    let mut builder = create_builder(archive_path)?;

    for entry in WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        let metadata = entry.metadata().map_err(io::Error::other)?;

        // relative path used in tar file
        let relative_path = match path.strip_prefix(source) {
            Ok(rel_path) => rel_path.to_string_lossy().into_owned(),
            Err(_) => continue,
        };

        // skip source directory itself
        if relative_path.is_empty() {
            continue;
        }

        if metadata.is_file() {
            append_file(&mut builder, path, &relative_path, &metadata)?;
        } else if metadata.is_dir() {
            append_dir(&mut builder, &relative_path, &metadata)?;
        } else if metadata.file_type().is_symlink() {
            append_symlink(&mut builder, path, &relative_path)?;
        } else {
            tracing::warn!("Skip unsupported file type: {}", path.display());
        }
    }

    finish_builder(builder)
}

/// Archive one file next to the single-file marker.
fn pack_file(source: &Path, archive_path: &Path, metadata: &Metadata) -> Result<()> {
    tracing::debug!(
        "archiving file {} to {}",
        source.display(),
        archive_path.display()
    );
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::UnsupportedPath(source.to_path_buf()))?;

    let mut builder = create_builder(archive_path)?;
    append_file(&mut builder, source, &name, metadata)?;
    append_marker(&mut builder)?;
    finish_builder(builder)
}

// Names go through `append_data`/`append_link` so paths over 100 bytes get
// GNU long-name entries instead of failing.

/// Add regular file
fn append_file<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    name: &str,
    metadata: &Metadata,
) -> Result<()> {
    let file = BufReader::new(File::open(path)?);
    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    header.set_size(metadata.len());

    builder.append_data(&mut header, name, file)?;
    Ok(())
}

/// Add directory
fn append_dir<W: Write>(builder: &mut Builder<W>, name: &str, metadata: &Metadata) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    let dir_name = if name.ends_with('/') {
        name.to_string()
    } else {
        format!("{name}/")
    };
    header.set_size(0);
    header.set_entry_type(EntryType::Directory);

    builder.append_data(&mut header, dir_name, io::empty())?;
    Ok(())
}

/// Add symbolic link
fn append_symlink<W: Write>(builder: &mut Builder<W>, path: &Path, name: &str) -> Result<()> {
    let target = fs::read_link(path)?;
    let metadata = fs::symlink_metadata(path)?;
    let mut header = Header::new_gnu();
    header.set_metadata(&metadata);
    header.set_entry_type(EntryType::Symlink);
    header.set_size(0);

    builder.append_link(&mut header, name, &target)?;
    Ok(())
}

fn append_marker<W: Write>(builder: &mut Builder<W>) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::Regular);

    builder.append_data(&mut header, SINGLE_FILE_MARKER, io::empty())?;
    Ok(())
}

fn open_archive(archive_path: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(archive_path)?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

/// Entry names in archive order, as stored in the headers.
pub fn list_entries(archive_path: &Path) -> Result<Vec<String>> {
    let mut archive = open_archive(archive_path)?;
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Unpack `archive_path`. A single-file archive is written to `destination`
/// as an exact file path; a directory archive is extracted below
/// `destination`. `label` names the archive in error messages.
pub fn unpack(archive_path: &Path, destination: &Path, label: &str) -> Result<ArchiveForm> {
    let names = list_entries(archive_path)?;
    if names.iter().any(|n| n == SINGLE_FILE_MARKER) {
        if names.len() != 2 {
            return Err(TransferError::MalformedArchive {
                key: label.to_string(),
                reason: format!(
                    "single file archive expected to have 2 entries, found {}",
                    names.len()
                ),
            });
        }
        unpack_file(archive_path, destination, label)?;
        Ok(ArchiveForm::SingleFile)
    } else {
        tracing::debug!(
            "unpacking {} to directory {}",
            archive_path.display(),
            destination.display()
        );
        fs::create_dir_all(destination)?;
        open_archive(archive_path)?.unpack(destination)?;
        Ok(ArchiveForm::Directory)
    }
}

fn unpack_file(archive_path: &Path, destination: &Path, label: &str) -> Result<()> {
    tracing::debug!(
        "unpacking {} to file {}",
        archive_path.display(),
        destination.display()
    );
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut archive = open_archive(archive_path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == SINGLE_FILE_MARKER {
            continue;
        }
        if !entry.header().entry_type().is_file() {
            return Err(TransferError::MalformedArchive {
                key: label.to_string(),
                reason: "single file archive payload is not a regular file".to_string(),
            });
        }
        let mut out = BufWriter::new(File::create(destination)?);
        io::copy(&mut entry, &mut out)?;
        out.flush()?;
        return Ok(());
    }

    Err(TransferError::MalformedArchive {
        key: label.to_string(),
        reason: "single file archive has no payload entry".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_single_file_archive_has_two_entries() {
        let tmp_dir = tempdir().unwrap();
        let source = tmp_dir.path().join("AB.mdb");
        fs::write(&source, b"project database").unwrap();
        let archive_path = tmp_dir.path().join("AB.tar.gz");

        assert_eq!(pack(&source, &archive_path).unwrap(), ArchiveForm::SingleFile);

        let names = list_entries(&archive_path).unwrap();
        assert_eq!(names, vec!["AB.mdb".to_string(), SINGLE_FILE_MARKER.to_string()]);
    }

    #[test]
    fn test_single_file_restored_under_new_name() {
        let tmp_dir = tempdir().unwrap();
        let source = tmp_dir.path().join("tempfile");
        fs::write(&source, "testfile contents").unwrap();
        let archive_path = tmp_dir.path().join("doc.tar.gz");
        pack(&source, &archive_path).unwrap();

        let destination = tmp_dir.path().join("extract/nested/renamed.txt");
        let form = unpack(&archive_path, &destination, "doc").unwrap();
        assert_eq!(form, ArchiveForm::SingleFile);
        assert_eq!(fs::read_to_string(destination).unwrap(), "testfile contents");
    }

    #[test]
    fn test_directory_keeps_empty_subdirectories() {
        let tmp_dir = tempdir().unwrap();
        let source = tmp_dir.path().join("compress");
        fs::create_dir_all(source.join("empty/deeper")).unwrap();
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/a.txt"), "a").unwrap();
        let archive_path = tmp_dir.path().join("dir.tar.gz");

        assert_eq!(pack(&source, &archive_path).unwrap(), ArchiveForm::Directory);
        let names = list_entries(&archive_path).unwrap();
        assert!(!names.iter().any(|n| n == SINGLE_FILE_MARKER));

        let destination = tmp_dir.path().join("extract");
        assert_eq!(
            unpack(&archive_path, &destination, "dir").unwrap(),
            ArchiveForm::Directory
        );
        assert!(destination.join("empty/deeper").is_dir());
        assert_eq!(fs::read_to_string(destination.join("sub/a.txt")).unwrap(), "a");
    }

    #[test]
    fn test_marker_with_extra_entries_is_malformed() {
        let tmp_dir = tempdir().unwrap();
        let archive_path = tmp_dir.path().join("bad.tar.gz");
        let mut builder = create_builder(&archive_path).unwrap();
        for name in ["one", "two"] {
            let mut header = Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(3);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &b"abc"[..]).unwrap();
        }
        append_marker(&mut builder).unwrap();
        finish_builder(builder).unwrap();

        let err = unpack(&archive_path, &tmp_dir.path().join("out"), "bad").unwrap_err();
        assert!(matches!(err, TransferError::MalformedArchive { .. }));
    }

    #[test]
    fn test_missing_source_is_unsupported() {
        let tmp_dir = tempdir().unwrap();
        let err = pack(
            &tmp_dir.path().join("missing"),
            &tmp_dir.path().join("out.tar.gz"),
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::UnsupportedPath(_)));
    }
}
