use crate::{
    cancel::CancelToken,
    digest::{ContentDigest, DigestAlgorithm},
};
use std::{
    fs,
    io::{self, Read, Write},
    path::Path,
    time::Duration,
};
use tempfile::NamedTempFile;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        expected: ContentDigest,
        actual: ContentDigest,
    },
    #[error("fetch cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ByteStream = Box<dyn Read + Send + 'static>;

pub trait FileFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<ByteStream, FetchError>;
}

/// Blocking HTTP fetcher; timeouts live here, not in the reconciler.
pub struct HttpFetcher {
    agent: ureq::Agent,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .timeout_write(Duration::from_secs(60))
            .build();
        Self {
            agent,
            user_agent: user_agent.to_string(),
        }
    }
}

impl FileFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<ByteStream, FetchError> {
        let response = self
            .agent
            .get(url)
            .set("User-Agent", &self.user_agent)
            .set("Accept", "*/*")
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(status, _) => FetchError::Status {
                    url: url.to_string(),
                    status,
                },
                ureq::Error::Transport(transport) => FetchError::Transport {
                    url: url.to_string(),
                    reason: transport.to_string(),
                },
            })?;
        Ok(Box::new(response.into_reader()))
    }
}

/// Streams `url` into `dest`, hashing as it goes. The bytes land in a temp
/// file beside `dest` and only replace it once the digest matches.
pub fn fetch_verified(
    fetcher: &dyn FileFetcher,
    url: &str,
    dest: &Path,
    algorithm: DigestAlgorithm,
    expected: &ContentDigest,
    cancel: &CancelToken,
) -> Result<(), FetchError> {
    if cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }
    let parent = dest.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", dest.display()),
        )
    })?;
    fs::create_dir_all(parent)?;

    let mut reader = fetcher.fetch(url)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    let actual = copy_hashed(&mut reader, temp.as_file_mut(), algorithm, cancel)?;
    if &actual != expected {
        return Err(FetchError::DigestMismatch {
            expected: expected.clone(),
            actual,
        });
    }
    temp.as_file_mut().flush()?;
    temp.persist(dest).map_err(|err| FetchError::Io(err.error))?;
    Ok(())
}

/// Downloads `url` into an anonymous temp file, optionally checking its
/// digest. The file is removed when the handle drops.
pub fn fetch_to_temp(
    fetcher: &dyn FileFetcher,
    url: &str,
    expected: Option<(DigestAlgorithm, &ContentDigest)>,
    cancel: &CancelToken,
) -> Result<NamedTempFile, FetchError> {
    if cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }
    let mut reader = fetcher.fetch(url)?;
    let mut temp = NamedTempFile::new()?;
    let algorithm = expected
        .map(|(algorithm, _)| algorithm)
        .unwrap_or_default();
    let actual = copy_hashed(&mut reader, temp.as_file_mut(), algorithm, cancel)?;
    if let Some((_, expected)) = expected {
        if &actual != expected {
            return Err(FetchError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }
    temp.as_file_mut().flush()?;
    Ok(temp)
}

fn copy_hashed(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    algorithm: DigestAlgorithm,
    cancel: &CancelToken,
) -> Result<ContentDigest, FetchError> {
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        hasher.update(&buffer[..read]);
        writer.write_all(&buffer[..read])?;
    }
    Ok(hasher.finish())
}
