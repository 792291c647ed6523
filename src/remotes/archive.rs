use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::archive::{ArchiveUrl, ExtractionCache, ARCHIVE_URL_SCHEME};
use crate::cache::LocationCache;
use crate::remote::{AnnexIo, Presence, SpecialRemote, DEFAULT_COST};
use crate::repo::AnnexRepo;

const SCHEMES: &[&str] = &[ARCHIVE_URL_SCHEME];

/// Read-only special remote serving keys that live inside annexed archives.
///
/// A key's registered `dl+archive:` URLs name the containing archive's own
/// annex key and the member path; content is delivered out of a local
/// extraction cache, fetching the archive through git-annex first when
/// needed.
pub struct ArchiveRemote {
    repo: AnnexRepo,
    extraction: ExtractionCache,
    locations: LocationCache,
    cost: u32,
    /// Tie-breaker when a key maps to several archive URLs: prefer the one
    /// most recently confirmed by CHECKURL.
    last_checked_url: Option<String>,
}

impl ArchiveRemote {
    pub fn new(repo: AnnexRepo, extraction_root: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            extraction: ExtractionCache::new(extraction_root),
            locations: LocationCache::default(),
            cost: DEFAULT_COST,
            last_checked_url: None,
        }
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_location_cache(mut self, cache: LocationCache) -> Self {
        self.locations = cache;
        self
    }

    /// Relative path of locally present content for an archive key, through
    /// the bounded cache. Returns `None` instead of erroring when the key
    /// cannot be resolved; callers treat that as "not present".
    fn content_location(&mut self, key: &str) -> Option<PathBuf> {
        if let Some(path) = self.locations.get(key, self.repo.workdir()) {
            return Some(path);
        }
        match self.repo.content_location(key) {
            Ok(Some(path)) => {
                self.locations.put(key, path.clone());
                Some(path)
            }
            Ok(None) => None,
            Err(e) => {
                log::debug!("resolving {} failed: {:#}", key, e);
                None
            }
        }
    }

    /// Absolute path of the archive for `key`, fetching it via git-annex
    /// when no local copy exists yet.
    fn resolve_archive(&mut self, key: &str) -> Result<PathBuf> {
        if let Some(rel) = self.content_location(key) {
            return Ok(self.repo.workdir().join(rel));
        }
        log::info!("fetching archive {}", key);
        self.repo.get_key(key)?;
        let rel = self
            .content_location(key)
            .with_context(|| format!("archive {} still absent after fetch", key))?;
        Ok(self.repo.workdir().join(rel))
    }

    /// Archive URLs registered for `key`, best candidate first.
    fn candidate_urls(&mut self, io: &mut AnnexIo, key: &str) -> Result<Vec<ArchiveUrl>> {
        let mut urls = io.urls_for_key(SCHEMES, key)?;
        if let Some(last) = &self.last_checked_url {
            if let Some(pos) = urls.iter().position(|u| u == last) {
                urls.swap(0, pos);
            }
        }
        urls.iter().map(|u| ArchiveUrl::decode(u)).collect()
    }
}

impl SpecialRemote for ArchiveRemote {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn cost(&self) -> u32 {
        self.cost
    }

    fn url_schemes(&self) -> &[&str] {
        SCHEMES
    }

    /// Honor a per-remote `cost` setting when one is configured.
    fn prepare(&mut self, io: &mut AnnexIo) -> Result<()> {
        let cost = io.getconfig("cost")?;
        if !cost.is_empty() {
            self.cost = cost
                .parse()
                .with_context(|| format!("invalid cost setting: {}", cost))?;
        }
        Ok(())
    }

    fn check_url(&mut self, _io: &mut AnnexIo, url: &str) -> Result<Option<u64>> {
        let parsed = ArchiveUrl::decode(url)?;
        let rel = self
            .content_location(&parsed.key)
            .with_context(|| format!("archive {} not available locally", parsed.key))?;

        let size = match parsed.size {
            Some(size) => Some(size),
            None => {
                let archive = self.repo.workdir().join(rel);
                self.extraction.member_size(&archive, &parsed.path).ok()
            }
        };
        self.last_checked_url = Some(url.to_string());
        Ok(size)
    }

    fn check_present(&mut self, io: &mut AnnexIo, key: &str) -> Result<Presence> {
        let candidates = self.candidate_urls(io, key)?;
        if candidates.is_empty() {
            return Ok(Presence::Unknown(format!(
                "no archive URLs recorded for {}",
                key
            )));
        }
        for url in &candidates {
            if self.content_location(&url.key).is_some() {
                return Ok(Presence::Present);
            }
        }
        // A local miss proves nothing about what the archives contain.
        Ok(Presence::Unknown(
            "containing archive not available locally".to_string(),
        ))
    }

    fn retrieve(&mut self, io: &mut AnnexIo, key: &str, dest: &Path) -> Result<()> {
        let candidates = self.candidate_urls(io, key)?;
        if candidates.is_empty() {
            bail!("no archive URLs recorded for {}", key);
        }

        let mut last_error = None;
        for url in &candidates {
            let attempt = self
                .resolve_archive(&url.key)
                .and_then(|archive| self.extraction.provide(&archive, &url.path, dest));
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!("retrieving {} from {} failed: {:#}", key, url.key, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e.context(format!("could not retrieve {}", key))),
            None => bail!("could not retrieve {}", key),
        }
    }

    fn remove(&mut self, _io: &mut AnnexIo, _key: &str) -> Result<()> {
        bail!("content stored in archives is read-only")
    }

    fn whereis(&mut self, io: &mut AnnexIo, key: &str) -> Result<Option<String>> {
        let candidates = self.candidate_urls(io, key)?;
        Ok(candidates
            .first()
            .map(|url| format!("in archive {} at {}", url.key, url.path)))
    }
}
