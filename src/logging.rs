//! Logging setup: env_logger with the configured level, optionally writing
//! to a size-rotated log file instead of stderr.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::LoggingConfig;

/// Initialize the global logger. `cli_level` (from `-v` flags) and
/// `cli_logfile` (from `--logfile`) override the config file.
pub fn init(config: &LoggingConfig, cli_level: Option<&str>, cli_logfile: Option<&str>) -> Result<()> {
    let level = cli_level.unwrap_or(&config.level);
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    let filename = cli_logfile
        .map(str::to_string)
        .or_else(|| if config.log_to_file { Some(log_filename(config)) } else { None });
    if let Some(filename) = filename {
        let writer = RollingFileWriter::open(
            PathBuf::from(filename),
            config.max_log_size,
            config.backup_count,
        )?;
        builder.target(env_logger::Target::Pipe(Box::new(writer)));
    }

    builder.init();
    Ok(())
}

fn log_filename(config: &LoggingConfig) -> String {
    config.filename.clone().unwrap_or_else(|| "mmrelay.log".to_string())
}

/// Append-only log file that rotates (`log` → `log.1` → ... → `log.N`) when
/// it grows past `max_size` bytes.
struct RollingFileWriter {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    backup_count: u32,
}

impl RollingFileWriter {
    fn open(path: PathBuf, max_size: u64, backup_count: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create log dir {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, file, written, max_size, backup_count })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        for index in (1..self.backup_count).rev() {
            let from = backup_path(&self.path, index);
            if from.exists() {
                let _ = std::fs::rename(&from, backup_path(&self.path, index + 1));
            }
        }
        if self.backup_count > 0 {
            let _ = std::fs::rename(&self.path, backup_path(&self.path, 1));
        }
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn backup_path(path: &std::path::Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.max_size > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}
