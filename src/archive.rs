use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, Read, Seek, Write},
    path::Path,
};
use tempfile::NamedTempFile;
use tracing::debug;
use zip::{result::ZipError, write::FileOptions, ZipArchive, ZipWriter};

/// Vendor manifest namespace stripped from lower-priority archives.
pub const META_INF_PREFIX: &str = "META-INF/";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("zip: {0}")]
    Zip(#[from] ZipError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("archive does not contain {0}")]
    MissingEntry(String),
}

/// Copies every entry of `source` into `writer` unless its name was already
/// written by an earlier merge or `exclude` matches it. Entries are copied
/// raw, without recompression. Callers merge in priority order, so the first
/// writer of a name wins.
pub fn merge_archive<W, R>(
    writer: &mut ZipWriter<W>,
    source: &mut ZipArchive<R>,
    written: &mut HashSet<String>,
    exclude: &dyn Fn(&str) -> bool,
) -> Result<(), ArchiveError>
where
    W: Write + Seek,
    R: Read + Seek,
{
    for index in 0..source.len() {
        let entry = source.by_index_raw(index)?;
        let name = entry.name().to_string();
        if written.contains(&name) || exclude(&name) {
            continue;
        }
        if entry.is_dir() {
            drop(entry);
            writer.add_directory(name.clone(), FileOptions::<()>::default())?;
        } else {
            writer.raw_copy_file(entry)?;
        }
        written.insert(name);
    }
    Ok(())
}

pub fn keep_all(_name: &str) -> bool {
    false
}

pub fn is_meta_inf(name: &str) -> bool {
    name.starts_with(META_INF_PREFIX)
}

/// Merges `sources` (highest priority first) into `output`. The archive is
/// built in a temp file beside `output` and only renamed into place once
/// every source merged cleanly.
pub fn merge_into_file(
    output: &Path,
    sources: &[(&Path, &dyn Fn(&str) -> bool)],
) -> Result<usize, ArchiveError> {
    let parent = output.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", output.display()),
        )
    })?;
    fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    let mut written = HashSet::new();
    {
        let mut writer = ZipWriter::new(temp.as_file_mut());
        for (path, exclude) in sources {
            let mut archive = ZipArchive::new(File::open(path)?)?;
            let before = written.len();
            merge_archive(&mut writer, &mut archive, &mut written, *exclude)?;
            debug!(
                source = %path.display(),
                copied = written.len() - before,
                "merged archive"
            );
        }
        writer.finish()?;
    }
    temp.persist(output).map_err(|err| ArchiveError::Io(err.error))?;
    Ok(written.len())
}

/// Lays the pack's runtime archive over the vanilla client archive. The
/// client's signing metadata is dropped so it cannot shadow the pack's.
pub fn splice_client_archive(
    output: &Path,
    payload: &Path,
    client: &Path,
) -> Result<usize, ArchiveError> {
    let keep: &dyn Fn(&str) -> bool = &keep_all;
    let strip: &dyn Fn(&str) -> bool = &is_meta_inf;
    merge_into_file(output, &[(payload, keep), (client, strip)])
}

pub fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, ArchiveError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(ArchiveError::MissingEntry(name.to_string())),
        Err(err) => return Err(err.into()),
    };
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

pub fn extract_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    dest: &Path,
) -> Result<(), ArchiveError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(ArchiveError::MissingEntry(name.to_string())),
        Err(err) => return Err(err.into()),
    };
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(dest)?;
    io::copy(&mut entry, &mut out)?;
    Ok(())
}
