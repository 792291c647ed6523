use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::runner::{CaptureOutput, RunCommand, Runner};

/// A local git-annex repository, addressed through the `git annex` CLI.
#[derive(Debug)]
pub struct AnnexRepo {
    workdir: PathBuf,
    annex_bin: String,
}

impl AnnexRepo {
    /// Discover the repository containing `path` (or any of its parents).
    pub fn discover(path: &Path) -> Result<Self> {
        let repo = git2::Repository::discover(path)
            .with_context(|| format!("No git repository at or above {}", path.display()))?;
        let workdir = repo
            .workdir()
            .context("Repository has no working directory")?
            .to_path_buf();
        Ok(Self {
            workdir,
            annex_bin: "git-annex".to_string(),
        })
    }

    pub fn at(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            annex_bin: "git-annex".to_string(),
        }
    }

    pub fn annex_bin(mut self, bin: impl Into<String>) -> Self {
        self.annex_bin = bin.into();
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn annex(&self, args: &[&str]) -> RunCommand {
        let mut argv = vec![self.annex_bin.clone()];
        argv.extend(args.iter().map(|s| s.to_string()));
        RunCommand::new(argv).cwd(&self.workdir)
    }

    /// Path, relative to the working directory, where the content for `key`
    /// is stored. `None` when the key has no local content.
    pub fn content_location(&self, key: &str) -> Result<Option<PathBuf>> {
        let output = Runner::run(
            &self.annex(&["contentlocation", key]),
            CaptureOutput::default(),
        )?;
        if !output.success() {
            log::debug!(
                "contentlocation {} failed ({}): {}",
                key,
                output.code,
                output.stderr_str().trim()
            );
            return Ok(None);
        }
        let path = output.stdout_str().trim().to_string();
        if path.is_empty() {
            Ok(None)
        } else {
            Ok(Some(PathBuf::from(path)))
        }
    }

    /// Fetch the content for `key` from wherever git-annex can get it.
    pub fn get_key(&self, key: &str) -> Result<()> {
        let output = Runner::run(
            &self.annex(&["get", "--key", key]),
            CaptureOutput::default(),
        )?;
        if !output.success() {
            anyhow::bail!(
                "git-annex get --key {} failed ({}): {}",
                key,
                output.code,
                output.stderr_str().trim()
            );
        }
        Ok(())
    }
}
