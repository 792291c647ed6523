use anyhow::{bail, Context, Result};
use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
    time::Duration,
};

use crate::remote::{AnnexIo, Availability, Presence, SpecialRemote, DEFAULT_COST};

const SCHEMES: &[&str] = &["http", "https"];

/// Status of a remote URL, as far as a cheap check can tell.
#[derive(Debug)]
pub struct UrlStatus {
    pub size: Option<u64>,
}

/// Fetch-by-URL collaborator for the web remote.
pub trait Downloader {
    /// Check that the URL is reachable, reporting the content size when the
    /// server discloses it.
    fn status(&self, url: &str) -> Result<UrlStatus>;

    /// Download into `dest`, reporting cumulative bytes through `progress`.
    fn fetch(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u64)) -> Result<u64>;
}

/// Downloader backed by a blocking HTTP client.
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn status(&self, url: &str) -> Result<UrlStatus> {
        let response = self
            .client
            .head(url)
            .send()
            .with_context(|| format!("HEAD {} failed", url))?
            .error_for_status()
            .with_context(|| format!("{} not retrievable", url))?;
        Ok(UrlStatus {
            size: response.content_length(),
        })
    }

    fn fetch(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u64)) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("{} not retrievable", url))?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let mut buf = [0u8; 65536];
        let mut total = 0u64;
        loop {
            let n = response.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            total += n as u64;
            progress(total);
        }
        file.flush()?;
        Ok(total)
    }
}

/// Special remote serving keys backed by registered http(s) URLs.
pub struct WebRemote {
    downloader: Box<dyn Downloader>,
    cost: u32,
}

impl WebRemote {
    pub fn new(downloader: Box<dyn Downloader>) -> Self {
        Self {
            downloader,
            cost: DEFAULT_COST,
        }
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }
}

impl SpecialRemote for WebRemote {
    fn name(&self) -> &'static str {
        "web"
    }

    fn cost(&self) -> u32 {
        self.cost
    }

    fn availability(&self) -> Availability {
        Availability::Global
    }

    fn url_schemes(&self) -> &[&str] {
        SCHEMES
    }

    fn check_url(&mut self, _io: &mut AnnexIo, url: &str) -> Result<Option<u64>> {
        Ok(self.downloader.status(url)?.size)
    }

    fn check_present(&mut self, io: &mut AnnexIo, key: &str) -> Result<Presence> {
        let urls = io.urls_for_key(SCHEMES, key)?;
        if urls.is_empty() {
            return Ok(Presence::Unknown(format!("no URLs recorded for {}", key)));
        }
        let mut last_error = String::new();
        for url in &urls {
            match self.downloader.status(url) {
                Ok(_) => return Ok(Presence::Present),
                Err(e) => {
                    log::debug!("status of {} failed: {:#}", url, e);
                    last_error = format!("{:#}", e);
                }
            }
        }
        // Unreachable URLs do not prove the content is gone.
        Ok(Presence::Unknown(last_error))
    }

    fn retrieve(&mut self, io: &mut AnnexIo, key: &str, dest: &Path) -> Result<()> {
        let urls = io.urls_for_key(SCHEMES, key)?;
        if urls.is_empty() {
            bail!("no URLs recorded for {}", key);
        }
        let mut last_error = None;
        for url in &urls {
            match self
                .downloader
                .fetch(url, dest, &mut |total| io.progress(total))
            {
                Ok(bytes) => {
                    log::info!("retrieved {} ({} bytes) from {}", key, bytes, url);
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("fetch of {} failed: {:#}", url, e);
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
        bail!("cannot remove content from the web")
    }

    fn whereis(&mut self, io: &mut AnnexIo, key: &str) -> Result<Option<String>> {
        let urls = io.urls_for_key(SCHEMES, key)?;
        Ok(urls.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Engine;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Outbox(Arc<Mutex<Vec<u8>>>);

    impl Outbox {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl Write for Outbox {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Downloader serving canned content from memory.
    struct FakeDownloader {
        content: HashMap<String, Vec<u8>>,
    }

    impl Downloader for FakeDownloader {
        fn status(&self, url: &str) -> Result<UrlStatus> {
            match self.content.get(url) {
                Some(bytes) => Ok(UrlStatus {
                    size: Some(bytes.len() as u64),
                }),
                None => bail!("404 for {}", url),
            }
        }

        fn fetch(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u64)) -> Result<u64> {
            let bytes = self
                .content
                .get(url)
                .with_context(|| format!("404 for {}", url))?;
            std::fs::write(dest, bytes)?;
            progress(bytes.len() as u64);
            Ok(bytes.len() as u64)
        }
    }

    fn remote_with(urls: &[(&str, &str)]) -> WebRemote {
        let content = urls
            .iter()
            .map(|(u, b)| (u.to_string(), b.as_bytes().to_vec()))
            .collect();
        WebRemote::new(Box::new(FakeDownloader { content }))
    }

    fn run_session(remote: WebRemote, script: &str) -> Vec<String> {
        let outbox = Outbox::default();
        let mut engine = Engine::new(
            remote,
            AnnexIo::new(
                Box::new(Cursor::new(script.as_bytes().to_vec())),
                Box::new(outbox.clone()),
            ),
        );
        engine.run().unwrap();
        outbox.lines()
    }

    #[test]
    fn test_checkurl_reports_size() {
        let remote = remote_with(&[("http://example.com/data", "0123456789")]);
        let lines = run_session(remote, "CHECKURL http://example.com/data\n");
        assert_eq!(lines[1], "CHECKURL-CONTENTS 10");
    }

    #[test]
    fn test_checkurl_failure_for_unknown_url() {
        let remote = remote_with(&[]);
        let lines = run_session(remote, "CHECKURL http://example.com/gone\n");
        assert_eq!(lines[1], "CHECKURL-FAILURE");
    }

    #[test]
    fn test_checkpresent_present() {
        let remote = remote_with(&[("http://example.com/data", "x")]);
        // Host answers the GETURLS queries for both schemes
        let script = "CHECKPRESENT KEY1\nVALUE http://example.com/data\nVALUE\nVALUE\n";
        let lines = run_session(remote, script);
        assert!(lines.contains(&"CHECKPRESENT-SUCCESS KEY1".to_string()));
    }

    #[test]
    fn test_checkpresent_unknown_without_urls() {
        let remote = remote_with(&[]);
        let script = "CHECKPRESENT KEY1\nVALUE\nVALUE\n";
        let lines = run_session(remote, script);
        assert!(lines
            .iter()
            .any(|l| l.starts_with("CHECKPRESENT-UNKNOWN KEY1 ")));
    }

    #[test]
    fn test_retrieve_writes_destination_and_reports_progress() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dest = temp_dir.path().join("content");
        let remote = remote_with(&[("http://example.com/data", "payload")]);
        let script = format!(
            "TRANSFER RETRIEVE KEY1 {}\nVALUE http://example.com/data\nVALUE\nVALUE\n",
            dest.display()
        );
        let lines = run_session(remote, &script);
        assert!(lines.contains(&"PROGRESS 7".to_string()));
        assert!(lines.contains(&"TRANSFER-SUCCESS RETRIEVE KEY1".to_string()));
        assert_eq!(std::fs::read(dest).unwrap(), b"payload");
    }

    #[test]
    fn test_retrieve_failure_is_terminal_not_fatal() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dest = temp_dir.path().join("content");
        let remote = remote_with(&[]);
        let script = format!(
            "TRANSFER RETRIEVE KEY1 {}\nVALUE http://example.com/gone\nVALUE\nVALUE\nGETCOST\n",
            dest.display()
        );
        let lines = run_session(remote, &script);
        assert!(lines
            .iter()
            .any(|l| l.starts_with("TRANSFER-FAILURE RETRIEVE KEY1 ")));
        // The session survived and answered the next request
        assert!(lines.contains(&format!("COST {}", DEFAULT_COST)));
    }

    #[test]
    fn test_whereis_reports_first_url() {
        let remote = remote_with(&[]);
        let script = "WHEREIS KEY1\nVALUE http://example.com/a\nVALUE http://example.com/b\nVALUE\nVALUE\n";
        let lines = run_session(remote, script);
        assert!(lines.contains(&"WHEREIS-SUCCESS http://example.com/a".to_string()));
    }

    #[test]
    fn test_availability_is_global() {
        let remote = remote_with(&[]);
        let lines = run_session(remote, "GETAVAILABILITY\n");
        assert_eq!(lines[1], "AVAILABILITY GLOBAL");
    }
}
