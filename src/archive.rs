use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use sha2::{Digest, Sha256};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

/// Fixed scheme prefix for archive-member URLs. Persisted in git-annex
/// metadata, so the spelling must stay stable.
pub const ARCHIVE_URL_SCHEME: &str = "dl+archive";

const URL_PREFIX: &str = "dl+archive:";

/// Characters quoted inside the member-path portion of an archive URL.
const PATH_QUOTE: &AsciiSet = &CONTROLS.add(b' ').add(b'#').add(b'%').add(b'?');

/// A location inside an annexed archive: the archive's own key, the member
/// path within it, and the member size when known.
///
/// Wire form: `dl+archive:<key>/<quoted-path>[#size=<n>]`. The legacy form
/// without a size fragment decodes with `size = None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveUrl {
    pub key: String,
    pub path: String,
    pub size: Option<u64>,
}

impl ArchiveUrl {
    pub fn new(key: impl Into<String>, path: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            size,
        }
    }

    pub fn encode(&self) -> String {
        let quoted = utf8_percent_encode(&self.path, PATH_QUOTE);
        match self.size {
            Some(size) => format!("{}{}/{}#size={}", URL_PREFIX, self.key, quoted, size),
            None => format!("{}{}/{}", URL_PREFIX, self.key, quoted),
        }
    }

    pub fn decode(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(URL_PREFIX)
            .with_context(|| format!("not a {} URL: {}", ARCHIVE_URL_SCHEME, url))?;

        let (body, size) = match rest.split_once('#') {
            Some((body, fragment)) => {
                let size = fragment
                    .strip_prefix("size=")
                    .with_context(|| format!("unrecognized fragment in {}", url))?
                    .parse::<u64>()
                    .with_context(|| format!("invalid size in {}", url))?;
                (body, Some(size))
            }
            None => (rest, None),
        };

        let (key, quoted_path) = body
            .split_once('/')
            .with_context(|| format!("missing member path in {}", url))?;
        if key.is_empty() || quoted_path.is_empty() {
            bail!("missing key or member path in {}", url);
        }

        let path = percent_decode_str(quoted_path)
            .decode_utf8()
            .with_context(|| format!("undecodable member path in {}", url))?
            .into_owned();

        Ok(Self {
            key: key.to_string(),
            path,
            size,
        })
    }
}

/// Per-archive extraction cache.
///
/// Each archive gets its own directory under the cache root, keyed by a
/// digest of the archive path. The whole archive is extracted lazily on the
/// first member request and reused afterwards.
#[derive(Debug)]
pub struct ExtractionCache {
    root: PathBuf,
}

impl ExtractionCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn archive_dir(&self, archive: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(archive.as_os_str().as_encoded_bytes());
        let digest = format!("{:x}", hasher.finalize());
        let stem = archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string());
        self.root.join(format!("{}-{}", stem, &digest[..16]))
    }

    /// Extract the archive if this cache has not seen it yet; returns the
    /// directory holding the extracted tree.
    pub fn ensure_extracted(&self, archive: &Path) -> Result<PathBuf> {
        let dir = self.archive_dir(archive);
        let marker = dir.join(".extracted");
        if marker.exists() {
            return Ok(dir);
        }

        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        log::info!("extracting {} into {}", archive.display(), dir.display());
        unpack_tar(archive, &dir)?;
        fs::write(&marker, b"")?;
        Ok(dir)
    }

    /// Absolute path of one extracted member.
    pub fn member_path(&self, archive: &Path, member: &str) -> Result<PathBuf> {
        let dir = self.ensure_extracted(archive)?;
        let path = dir.join(member);
        if !path.is_file() {
            bail!("{} has no member {}", archive.display(), member);
        }
        Ok(path)
    }

    pub fn member_size(&self, archive: &Path, member: &str) -> Result<u64> {
        let path = self.member_path(archive, member)?;
        Ok(path.metadata()?.len())
    }

    /// Deliver a member into `dest`, hard-linking when the filesystem allows
    /// it and copying otherwise.
    pub fn provide(&self, archive: &Path, member: &str, dest: &Path) -> Result<()> {
        let source = self.member_path(archive, member)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            fs::remove_file(dest)?;
        }
        if fs::hard_link(&source, dest).is_err() {
            fs::copy(&source, dest)
                .with_context(|| format!("Failed to copy {} into place", member))?;
        }
        Ok(())
    }

    /// Drop every extracted tree.
    pub fn clean(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

fn unpack_tar(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive.to_string_lossy();
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", name))?;

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        tar::Archive::new(GzDecoder::new(file)).unpack(dest)
    } else if name.ends_with(".tar") {
        tar::Archive::new(file).unpack(dest)
    } else {
        bail!("unsupported archive format: {}", name);
    }
    .with_context(|| format!("Failed to extract {}", name))
}
