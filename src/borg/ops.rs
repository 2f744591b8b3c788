//! Per-subcommand operations on the borg driver.
//!
//! Thin glue: each operation validates its arguments, builds the option list
//! deterministically from the repository and its own options, drives a run,
//! and interprets the event sequence. Prompts are never answered silently;
//! an unexpected prompt aborts the operation with
//! [`BorgError::PromptRequired`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::driver::{Borg, EventStream, RunOutcome};
use super::error::BorgError;
use super::events::{classify_msgid, BorgEvent, BorgMessage, Classification};
use super::process::BorgCommand;
use crate::repo::Repository;

/// Valid archive sorting criteria for `list`.
const SORT_KEYS: &[&str] = &["timestamp", "name", "id"];

/// Options for [`Borg::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Paths to include in the archive. Must not be empty.
    pub includes: Vec<String>,
    /// Exclude patterns.
    pub excludes: Vec<String>,
    /// Archive name prefix; borg expands placeholders like `{hostname}`.
    pub prefix: String,
    /// Request summary statistics.
    pub stats: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            prefix: "{hostname}".to_string(),
            stats: false,
        }
    }
}

/// Options for [`Borg::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only archives whose name starts with this prefix.
    pub prefix: Option<String>,
    /// Only archives matching this shell glob. Mutually exclusive with
    /// `prefix`.
    pub glob: Option<String>,
    /// Sorting criteria, each one of `timestamp`, `name`, `id`.
    pub sort_by: Vec<String>,
    /// Only the first N matching archives.
    pub first: u32,
    /// Only the last N matching archives.
    pub last: u32,
    /// Names only.
    pub short: bool,
    /// Extra format keys to request per archive.
    pub additional_keys: Vec<String>,
}

/// Options for [`Borg::prune`].
#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
    /// Retention rules: interval name (`hourly`, `daily`, …) to count.
    /// Must not be empty.
    pub keep: BTreeMap<String, u32>,
    /// Only consider archives with this name prefix.
    pub prefix: Option<String>,
    /// List the kept/pruned archives in the log output.
    pub list_details: bool,
}

/// One archive row from a captured listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArchiveRecord {
    /// Archive name.
    pub name: String,
    /// Creation timestamp, when the listing carried one.
    #[serde(default)]
    pub time: Option<String>,
    /// Archive id, when the listing carried one.
    #[serde(default)]
    pub id: Option<String>,
}

impl ArchiveRecord {
    /// Decode a captured line: JSON rows become structured records, anything
    /// else is a name-only record.
    #[must_use]
    pub fn from_line(line: &str) -> Self {
        serde_json::from_str(line).unwrap_or_else(|_| Self {
            name: line.trim().to_string(),
            time: None,
            id: None,
        })
    }
}

fn archive_spec(repo: &Repository, archive: &str) -> String {
    format!("{repo}::{archive}")
}

impl Borg {
    /// Create an archive of `opts.includes` in the repository.
    ///
    /// Progress events are forwarded to `progress` when given; requesting a
    /// callback turns on per-line progress reporting.
    ///
    /// # Errors
    ///
    /// [`BorgError::InvalidArgument`] when no include paths are given, plus
    /// anything the run itself surfaces.
    pub async fn create(
        &self,
        repo: &Repository,
        opts: &CreateOptions,
        progress: Option<&mut dyn FnMut(&BorgMessage)>,
    ) -> Result<RunOutcome, BorgError> {
        if opts.includes.is_empty() {
            return Err(BorgError::InvalidArgument(
                "no paths given to include in the archive".to_string(),
            ));
        }

        let mut options = repo.borg_args(true);
        if opts.stats {
            options.push("--stats".to_string());
        }
        for exclude in &opts.excludes {
            options.extend(["--exclude".to_string(), exclude.clone()]);
        }
        options.push(archive_spec(repo, &opts.prefix));
        options.extend(opts.includes.iter().cloned());

        let call = BorgCommand::new("create")
            .args(options)
            .envs(repo.environment())
            .progress(progress.is_some())
            .capture_primary(true);
        let events = self.run(call)?;
        self.consume(events, progress).await
    }

    /// List the archives in the repository, in the order borg reports them.
    ///
    /// # Errors
    ///
    /// [`BorgError::InvalidArgument`] on conflicting matchers or an unknown
    /// sorting criterion, plus anything the run itself surfaces.
    pub async fn list(
        &self,
        repo: &Repository,
        opts: &ListOptions,
    ) -> Result<Vec<ArchiveRecord>, BorgError> {
        if opts.prefix.is_some() && opts.glob.is_some() {
            return Err(BorgError::InvalidArgument(
                "cannot combine archive matching by prefix and glob pattern".to_string(),
            ));
        }
        for key in &opts.sort_by {
            if !SORT_KEYS.contains(&key.as_str()) {
                return Err(BorgError::InvalidArgument(format!(
                    "invalid sorting criterion {key} for archive listing"
                )));
            }
        }

        let mut options = repo.borg_args(false);
        if let Some(prefix) = &opts.prefix {
            options.extend(["--prefix".to_string(), prefix.clone()]);
        }
        if let Some(glob) = &opts.glob {
            options.extend(["--glob-archives".to_string(), glob.clone()]);
        }
        if opts.short {
            options.push("--short".to_string());
        }
        if !opts.sort_by.is_empty() {
            options.extend(["--sort-by".to_string(), opts.sort_by.join(",")]);
        }
        if opts.first > 0 {
            options.extend(["--first".to_string(), opts.first.to_string()]);
        }
        if opts.last > 0 {
            options.extend(["--last".to_string(), opts.last.to_string()]);
        }
        if !opts.additional_keys.is_empty() {
            let format = opts
                .additional_keys
                .iter()
                .map(|key| format!("{{{key}}}"))
                .collect::<Vec<_>>()
                .join(" ");
            options.extend(["--format".to_string(), format]);
        }
        options.push(repo.to_string());

        let call = BorgCommand::new("list")
            .args(options)
            .envs(repo.environment())
            .capture_primary(true)
            .non_interactive();
        let events = self.run(call)?;
        let outcome = self.consume(events, None).await?;
        Ok(outcome
            .captured
            .iter()
            .map(|line| ArchiveRecord::from_line(line))
            .collect())
    }

    /// Prune archives according to the retention rules.
    ///
    /// # Errors
    ///
    /// [`BorgError::InvalidArgument`] when no retention rules are given,
    /// plus anything the run itself surfaces.
    pub async fn prune(
        &self,
        repo: &Repository,
        opts: &PruneOptions,
    ) -> Result<RunOutcome, BorgError> {
        if opts.keep.is_empty() {
            return Err(BorgError::InvalidArgument(
                "no archives to keep given for pruning".to_string(),
            ));
        }

        let mut options = repo.borg_args(false);
        if opts.list_details {
            options.extend(["--list".to_string(), "--stats".to_string()]);
        }
        for (interval, number) in &opts.keep {
            options.extend([format!("--keep-{interval}"), number.to_string()]);
        }
        if let Some(prefix) = &opts.prefix {
            options.extend(["--prefix".to_string(), prefix.clone()]);
        }
        options.push(repo.to_string());

        let call = BorgCommand::new("prune")
            .args(options)
            .envs(repo.environment());
        let events = self.run(call)?;
        self.consume(events, None).await
    }

    /// Initialize a new repository with the given encryption mode.
    ///
    /// # Errors
    ///
    /// Anything the run surfaces, notably `Repository.AlreadyExists`.
    pub async fn init(&self, repo: &Repository, encryption: &str) -> Result<RunOutcome, BorgError> {
        let mut options = repo.borg_args(false);
        options.extend(["--encryption".to_string(), encryption.to_string()]);
        options.push(repo.to_string());

        let call = BorgCommand::new("init")
            .args(options)
            .envs(repo.environment());
        let events = self.run(call)?;
        self.consume(events, None).await
    }

    /// Show repository or archive information; the JSON document borg
    /// prints lands in the outcome's captured output.
    ///
    /// # Errors
    ///
    /// Anything the run surfaces.
    pub async fn info(
        &self,
        repo: &Repository,
        archive: Option<&str>,
    ) -> Result<RunOutcome, BorgError> {
        let mut options = repo.borg_args(false);
        options.push(match archive {
            Some(archive) => archive_spec(repo, archive),
            None => repo.to_string(),
        });

        let call = BorgCommand::new("info")
            .args(options)
            .envs(repo.environment())
            .capture_primary(true)
            .non_interactive();
        let events = self.run(call)?;
        self.consume(events, None).await
    }

    /// Delete one archive from the repository.
    ///
    /// # Errors
    ///
    /// Anything the run surfaces; deleting a whole repository prompts and
    /// therefore fails with [`BorgError::PromptRequired`].
    pub async fn delete(&self, repo: &Repository, archive: &str) -> Result<RunOutcome, BorgError> {
        let mut options = repo.borg_args(false);
        options.push(archive_spec(repo, archive));

        let call = BorgCommand::new("delete")
            .args(options)
            .envs(repo.environment());
        let events = self.run(call)?;
        self.consume(events, None).await
    }

    /// Mount a repository or archive at `mountpoint`.
    ///
    /// # Errors
    ///
    /// Anything the run surfaces.
    pub async fn mount(
        &self,
        repo: &Repository,
        archive: Option<&str>,
        mountpoint: &Path,
        foreground: bool,
    ) -> Result<RunOutcome, BorgError> {
        let mut options = repo.borg_args(false);
        if foreground {
            options.push("--foreground".to_string());
        }
        options.push(match archive {
            Some(archive) => archive_spec(repo, archive),
            None => repo.to_string(),
        });
        options.push(mountpoint.display().to_string());

        let call = BorgCommand::new("mount")
            .args(options)
            .envs(repo.environment());
        let events = self.run(call)?;
        self.consume(events, None).await
    }

    /// Unmount a previously mounted repository or archive.
    ///
    /// # Errors
    ///
    /// Anything the run surfaces.
    pub async fn umount(&self, mountpoint: &Path) -> Result<RunOutcome, BorgError> {
        let call = BorgCommand::new("umount").arg(mountpoint.display().to_string());
        let events = self.run(call)?;
        self.consume(events, None).await
    }

    /// Extract paths from an archive into the current (or given) directory.
    ///
    /// # Errors
    ///
    /// Anything the run surfaces.
    pub async fn extract(
        &self,
        repo: &Repository,
        archive: &str,
        paths: &[String],
        target_dir: Option<&Path>,
    ) -> Result<RunOutcome, BorgError> {
        let mut options = repo.borg_args(false);
        options.push(archive_spec(repo, archive));
        options.extend(paths.iter().cloned());

        let mut call = BorgCommand::new("extract")
            .args(options)
            .envs(repo.environment());
        if let Some(dir) = target_dir {
            call = call.working_dir(dir);
        }
        let events = self.run(call)?;
        self.consume(events, None).await
    }

    /// Re-create archives to apply new settings (compression, excludes).
    ///
    /// # Errors
    ///
    /// Anything the run surfaces.
    pub async fn recreate(
        &self,
        repo: &Repository,
        archive: Option<&str>,
    ) -> Result<RunOutcome, BorgError> {
        let mut options = repo.borg_args(true);
        options.push(match archive {
            Some(archive) => archive_spec(repo, archive),
            None => repo.to_string(),
        });

        let call = BorgCommand::new("recreate")
            .args(options)
            .envs(repo.environment());
        let events = self.run(call)?;
        self.consume(events, None).await
    }

    /// Drive a run to completion: forward progress, log informational
    /// messages, and abort on prompts.
    async fn consume(
        &self,
        mut events: EventStream,
        mut progress: Option<&mut dyn FnMut(&BorgMessage)>,
    ) -> Result<RunOutcome, BorgError> {
        while let Some(event) = events.next_event().await? {
            match event {
                BorgEvent::Message(msg) => match &msg {
                    BorgMessage::LogMessage(log) => {
                        if classify_msgid(log.msgid.as_deref()) == Classification::Prompt {
                            // no answer policy here; dropping the stream
                            // closes stdin and reaps the child
                            return Err(log.to_prompt_required());
                        }
                        tracing::debug!(
                            level = log.levelname.as_deref().unwrap_or("INFO"),
                            logger = log.name.as_deref().unwrap_or(""),
                            message = log.message.as_deref().unwrap_or(""),
                            "borg log"
                        );
                    }
                    BorgMessage::ProgressMessage(_) | BorgMessage::ProgressPercent(_) => {
                        if let Some(callback) = progress.as_deref_mut() {
                            callback(&msg);
                        }
                    }
                    BorgMessage::Unknown => {
                        tracing::trace!("unrecognized borg message type");
                    }
                },
                BorgEvent::RawOutput(line) => {
                    tracing::debug!(%line, "borg output");
                }
            }
        }
        events.finish().await
    }
}
