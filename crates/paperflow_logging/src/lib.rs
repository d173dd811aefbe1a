//! Logging setup shared by the paperflow binaries.
//!
//! Worker hosts use stdout for the startup handshake, so no layer here ever
//! writes to stdout. Settings come from [`LogSettings`], normally read from
//! the `PAPERFLOW_LOG_*` variables as part of the scanning configuration;
//! workers inherit them through their environment.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const ENV_HOME: &str = "PAPERFLOW_HOME";
/// Log folder, or `off` to disable log files.
pub const ENV_LOG_DIR: &str = "PAPERFLOW_LOG_DIR";
pub const ENV_LOG_MAX_BYTES: &str = "PAPERFLOW_LOG_MAX_BYTES";
pub const ENV_LOG_KEEP: &str = "PAPERFLOW_LOG_KEEP";

const DEFAULT_FILTER: &str = "paperflow=info,paperflow_worker=info,paperflow_protocol=info";
const VERBOSE_FILTER: &str = "paperflow=debug,paperflow_worker=debug,paperflow_protocol=debug";
const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_KEEP: usize = 4;

/// What reaches stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Console {
    /// Same events as the log file.
    #[default]
    Normal,
    /// Debug output of the paperflow crates.
    Verbose,
    /// Warnings and errors only; used by worker hosts so the parent's
    /// terminal is not flooded.
    WarningsOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    /// Folder for log files. `None` logs to stderr only.
    pub dir: Option<PathBuf>,
    /// Size at which the live file is archived.
    pub max_bytes: u64,
    /// Archived files kept next to the live one.
    pub keep: usize,
    pub console: Console,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: Some(logs_dir()),
            max_bytes: DEFAULT_MAX_BYTES,
            keep: DEFAULT_KEEP,
            console: Console::Normal,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(dir) = lookup(ENV_LOG_DIR).filter(|v| !v.trim().is_empty()) {
            settings.dir = (!dir.trim().eq_ignore_ascii_case("off")).then(|| PathBuf::from(dir));
        }
        if let Some(value) = lookup(ENV_LOG_MAX_BYTES) {
            settings.max_bytes = value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{} must be a byte count, got '{}'", ENV_LOG_MAX_BYTES, value))?;
        }
        if let Some(value) = lookup(ENV_LOG_KEEP) {
            settings.keep = value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("{} must be a file count, got '{}'", ENV_LOG_KEEP, value))?;
        }
        Ok(settings)
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }
}

/// Install the global subscriber: `<app_name>.log` in the log folder and
/// stderr. `RUST_LOG` overrides the default filter.
pub fn init_logging(app_name: &str, settings: &LogSettings) -> Result<()> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    let file_layer = match &settings.dir {
        Some(dir) => {
            let log = RotatingLog::open(dir, app_name, settings.max_bytes, settings.keep)
                .with_context(|| format!("Failed to open log file in {}", dir.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(log))
                    .with_ansi(false)
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    let console_filter = match settings.console {
        Console::Normal => filter(),
        Console::Verbose => EnvFilter::new(VERBOSE_FILTER),
        Console::WarningsOnly => EnvFilter::new("warn"),
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(())
}

/// Paperflow home: `$PAPERFLOW_HOME`, else `~/.paperflow`, else a folder in
/// the temp dir for accounts without a home directory.
pub fn paperflow_home() -> PathBuf {
    if let Some(home) = std::env::var_os(ENV_HOME).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".paperflow")
}

pub fn logs_dir() -> PathBuf {
    paperflow_home().join("logs")
}

/// Size-capped log file: `<name>.log` plus archives `<name>.<seq>.log`.
/// Archiving prunes the lowest sequence numbers beyond `keep`.
struct RotatingLog {
    dir: PathBuf,
    name: String,
    max_bytes: u64,
    keep: usize,
    file: Option<File>,
    written: u64,
}

impl RotatingLog {
    fn open(dir: &Path, name: &str, max_bytes: u64, keep: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let name = file_stem(name);
        let file = open_append(&dir.join(format!("{}.log", name)))?;
        let written = file.metadata()?.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            name,
            max_bytes,
            keep,
            file: Some(file),
            written,
        })
    }

    fn live_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.name))
    }

    /// Archives of this log, oldest first.
    fn archives(&self) -> io::Result<Vec<(u64, PathBuf)>> {
        let prefix = format!("{}.", self.name);
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let seq = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|rest| rest.strip_suffix(".log"))
                .and_then(|seq| seq.parse::<u64>().ok());
            if let Some(seq) = seq {
                found.push((seq, path));
            }
        }
        found.sort();
        Ok(found)
    }

    fn archive(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        let live = self.live_path();

        if self.keep == 0 {
            self.file = Some(File::create(&live)?);
        } else {
            let mut archives = self.archives()?;
            let next = archives.last().map_or(1, |(seq, _)| seq + 1);
            let archived = self.dir.join(format!("{}.{}.log", self.name, next));
            fs::rename(&live, &archived)?;
            archives.push((next, archived));

            let excess = archives.len().saturating_sub(self.keep);
            for (_, old) in archives.drain(..excess) {
                let _ = fs::remove_file(old);
            }
            self.file = Some(open_append(&live)?);
        }
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.archive()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file is closed"))?;
        let written = file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// `worker-12/x86` -> `worker-12_x86`
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
