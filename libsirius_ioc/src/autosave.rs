//! Save/restore of selected channels.
//!
//! Channels listed in the request file are periodically read through the bus
//! and written to `<basename>__<YYYY-MM-DD_HH-MM-SS>__.sav`, one `name value`
//! pair per line. On boot, after a delay, the most recent save is written back
//! through the bus so that every value goes through the driver's validation.
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use time::macros::format_description;
use time::OffsetDateTime;

use super::bus::client::ChannelAccess;
use super::channel::ChannelValue;
use super::config::{seconds, AutosaveConfig};
use super::error::AutosaveError;
use super::logging::{guarded, LogChannel};

const STOP_POLL: Duration = Duration::from_millis(50);

/// Read the channel names of a request file. Blank lines and `#` comments are ignored.
pub fn read_request_file(path: &Path) -> Result<Vec<String>, AutosaveError> {
    if !path.exists() {
        return Err(AutosaveError::BadFilePath(path.to_path_buf()));
    }
    let reader = BufReader::new(File::open(path)?);
    let mut names = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        names.push(line.to_string());
    }
    Ok(names)
}

pub fn save_file_name(basename: &str, when: OffsetDateTime) -> Result<String, AutosaveError> {
    let stamp = when.format(format_description!(
        "[year]-[month]-[day]_[hour]-[minute]-[second]"
    ))?;
    Ok(format!("{basename}__{stamp}__.sav"))
}

pub fn backup_file_name(basename: &str) -> String {
    format!("{basename}_Backup.sav")
}

/// Save files of `basename` in `dir`, oldest first
pub fn list_save_files(dir: &Path, basename: &str) -> Result<Vec<PathBuf>, AutosaveError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let head = format!("{basename}__");
    let mut saves: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&head) && n.ends_with("__.sav"))
        })
        .collect();
    // Timestamps sort lexicographically
    saves.sort();
    Ok(saves)
}

/// Parse the `name value` lines of a save file. Malformed lines are logged and skipped.
pub fn parse_save_file(path: &Path) -> Result<Vec<(String, String)>, AutosaveError> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                spdlog::warn!("Skipping unreadable line {} of {path:?}: {e}", number + 1);
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed.split_once(char::is_whitespace) {
            Some((name, value)) => entries.push((name.to_string(), value.trim().to_string())),
            None => spdlog::warn!("Skipping malformed line {} of {path:?}: {trimmed}", number + 1),
        }
    }
    Ok(entries)
}

fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Outcome of one save
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    pub path: PathBuf,
    pub saved: usize,
    pub failed: Vec<String>,
}

/// Outcome of one restore
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub path: PathBuf,
    pub restored: usize,
    pub failed: Vec<String>,
}

/// The save/restore subsystem of one IOC
pub struct Autosave {
    config: AutosaveConfig,
    prefix: String,
    access: Arc<dyn ChannelAccess>,
    log: LogChannel,
}

impl std::fmt::Debug for Autosave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autosave")
            .field("config", &self.config)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Autosave {
    /// `prefix` is prepended to the names of the request file to address them on the bus
    pub fn new(
        config: AutosaveConfig,
        prefix: &str,
        access: Arc<dyn ChannelAccess>,
        log: LogChannel,
    ) -> Self {
        Self {
            config,
            prefix: prefix.to_string(),
            access,
            log,
        }
    }

    fn backup_path(&self) -> PathBuf {
        self.config.dir.join(backup_file_name(&self.config.basename))
    }

    fn timeout(&self) -> Duration {
        seconds(self.config.timeout)
    }

    /// Snapshot every requested channel into a new save file.
    ///
    /// The newest previous save is copied to the backup first, unless a backup
    /// is already present from an interrupted run. The backup is removed only
    /// if every channel was read.
    pub fn save(&self) -> Result<SaveReport, AutosaveError> {
        let names = read_request_file(&self.config.request_file)?;
        std::fs::create_dir_all(&self.config.dir)?;
        let basename = &self.config.basename;
        let target = self.config.dir.join(save_file_name(basename, now_local())?);

        let mut saves = list_save_files(&self.config.dir, basename)?;
        let backup = self.backup_path();
        if backup.exists() {
            spdlog::warn!("Keeping backup {backup:?} left by an interrupted save");
        } else if let Some(newest) = saves.last() {
            std::fs::copy(newest, &backup)?;
        }

        saves.retain(|path| *path != target);
        let max_files = self.config.max_files.max(1);
        while saves.len() >= max_files {
            let oldest = saves.remove(0);
            spdlog::debug!("Removing old save file {oldest:?}");
            std::fs::remove_file(&oldest)?;
        }

        let mut lines = String::new();
        let mut failed = Vec::new();
        let mut saved = 0;
        for name in names.iter() {
            let full = format!("{}{name}", self.prefix);
            match self.access.get(&full, self.timeout()) {
                Ok(reading) => {
                    lines.push_str(&format!("{name} {}\n", reading.value));
                    saved += 1;
                }
                Err(e) => {
                    spdlog::warn!("Could not read {full} for saving: {e}");
                    failed.push(name.clone());
                }
            }
        }
        let mut file = File::create(&target)?;
        file.write_all(lines.as_bytes())?;
        file.sync_all()?;

        if failed.is_empty() {
            if backup.exists() {
                std::fs::remove_file(&backup)?;
            }
        } else {
            self.log.warn(&format!(
                "Autosave could not read {} channel(s); backup retained",
                failed.len()
            ));
        }
        spdlog::info!(
            "Saved {saved} channel(s) to {target:?} ({})",
            human_bytes::human_bytes(lines.len() as f64)
        );
        Ok(SaveReport {
            path: target,
            saved,
            failed,
        })
    }

    /// The file a restore should use: the newest save, or the backup if the
    /// newest save holds strictly fewer entries.
    pub fn choose_restore_file(&self) -> Result<PathBuf, AutosaveError> {
        let saves = list_save_files(&self.config.dir, &self.config.basename)?;
        let backup = self.backup_path();
        let newest = match saves.last() {
            Some(newest) => newest.clone(),
            None if backup.exists() => return Ok(backup),
            None => return Err(AutosaveError::NoSaveFile(self.config.dir.clone())),
        };
        if backup.exists() {
            let newest_len = parse_save_file(&newest)?.len();
            let backup_len = parse_save_file(&backup)?.len();
            if newest_len < backup_len {
                spdlog::warn!(
                    "Newest save {newest:?} has {newest_len} entries, backup has {backup_len}; restoring the backup"
                );
                return Ok(backup);
            }
        }
        Ok(newest)
    }

    /// Write back every value of the chosen save file. One bad line never aborts the restore.
    pub fn restore(&self) -> Result<RestoreReport, AutosaveError> {
        let path = self.choose_restore_file()?;
        let entries = parse_save_file(&path)?;
        let mut restored = 0;
        let mut failed = Vec::new();
        for (name, value) in entries {
            let full = format!("{}{name}", self.prefix);
            match self
                .access
                .put(&full, ChannelValue::Str(value), self.timeout())
            {
                Ok(()) => restored += 1,
                Err(e) => {
                    spdlog::warn!("Could not restore {full}: {e}");
                    failed.push(name);
                }
            }
        }
        self.log
            .info(&format!("Restored {restored} channel(s) from {}", path.display()));
        Ok(RestoreReport {
            path,
            restored,
            failed,
        })
    }

    /// Start the restore-on-boot and periodic save threads
    pub fn spawn(self: Arc<Self>, stop: Arc<AtomicBool>) -> Result<Vec<JoinHandle<()>>, AutosaveError> {
        let restorer = {
            let autosave = self.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(String::from("autosave-restore"))
                .spawn(move || {
                    if !sleep_unless_stopped(&stop, seconds(autosave.config.restore_delay)) {
                        return;
                    }
                    guarded(&autosave.log, "Restore", || match autosave.restore() {
                        Ok(_) => (),
                        Err(AutosaveError::NoSaveFile(dir)) => {
                            spdlog::info!("Nothing to restore in {dir:?}")
                        }
                        Err(e) => autosave.log.error(&format!("Restore failed: {e}")),
                    });
                })?
        };
        let saver = std::thread::Builder::new()
            .name(String::from("autosave-save"))
            .spawn(move || {
                let period = seconds(self.config.period).max(Duration::from_secs(1));
                // Give the restore a chance to run before the first save
                let first = seconds(self.config.restore_delay) + period;
                let mut wait = first;
                while sleep_unless_stopped(&stop, wait) {
                    wait = period;
                    guarded(&self.log, "Autosave", || {
                        if let Err(e) = self.save() {
                            self.log.error(&format!("Autosave failed: {e}"));
                        }
                    });
                }
            })?;
        Ok(vec![restorer, saver])
    }
}

/// Sleep for `duration` in short steps; `false` if the stop flag was raised
fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(STOP_POLL.min(deadline - now));
    }
}
