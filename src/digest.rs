use crate::cancel::CancelToken;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::Path,
    str::FromStr,
};

const CHUNK_SIZE: usize = 64 * 1024;

/// Hash function a catalog publishes its file checksums with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
        }
    }

    pub fn hasher(self) -> ContentHasher {
        match self {
            DigestAlgorithm::Sha1 => ContentHasher::Sha1(Sha1::new()),
            DigestAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental hasher over either supported algorithm.
pub enum ContentHasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl ContentHasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            ContentHasher::Sha1(hasher) => hasher.update(bytes),
            ContentHasher::Sha256(hasher) => hasher.update(bytes),
        }
    }

    pub fn finish(self) -> ContentDigest {
        match self {
            ContentHasher::Sha1(hasher) => ContentDigest(hasher.finalize().to_vec()),
            ContentHasher::Sha256(hasher) => ContentDigest(hasher.finalize().to_vec()),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("digest is not valid hex: {0:?}")]
    InvalidHex(String),
    #[error("digest is empty")]
    Empty,
}

/// Digest of a file's full byte stream. Two files are identical iff their
/// digests are equal.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(Vec<u8>);

impl ContentDigest {
    pub fn from_hex(raw: &str) -> Result<Self, DigestParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DigestParseError::Empty);
        }
        let bytes =
            hex::decode(raw).map_err(|_| DigestParseError::InvalidHex(raw.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn of_bytes(algorithm: DigestAlgorithm, bytes: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(bytes);
        hasher.finish()
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ContentDigest::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Hashes a reader to the end, bailing out with `Interrupted` once the
/// token is cancelled.
pub fn digest_reader<R: Read>(
    algorithm: DigestAlgorithm,
    mut reader: R,
    cancel: &CancelToken,
) -> io::Result<ContentDigest> {
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        cancel.check_io()?;
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finish())
}

pub fn digest_file(
    algorithm: DigestAlgorithm,
    path: &Path,
    cancel: &CancelToken,
) -> io::Result<ContentDigest> {
    let file = File::open(path)?;
    digest_reader(algorithm, file, cancel)
}

/// What a path on disk looks like to the reconciler.
#[derive(Debug)]
pub enum FileProbe {
    Present(ContentDigest),
    Absent,
    Error(io::Error),
}

pub fn probe(path: &Path, algorithm: DigestAlgorithm, cancel: &CancelToken) -> FileProbe {
    let meta = match path.symlink_metadata() {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return FileProbe::Absent,
        Err(err) => return FileProbe::Error(err),
    };
    if meta.is_dir() {
        return FileProbe::Error(io::Error::new(
            io::ErrorKind::Other,
            format!("{} is a directory", path.display()),
        ));
    }
    match digest_file(algorithm, path, cancel) {
        Ok(digest) => FileProbe::Present(digest),
        Err(err) => FileProbe::Error(err),
    }
}
