//! Unified logging module for the rhilex gateway
//!
//! Console output uses a bracketed level format, file output goes through a
//! non-blocking size-rolling writer with backup pruning and optional gzip.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        self,
        format::Writer,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Target used by script-originated log records (rule Debug, VM errors, applet console)
pub const SCRIPT_TARGET: &str = "script";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Engine started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Global guards for keeping loggers alive
static GUARDS: OnceLock<Arc<Mutex<Vec<WorkerGuard>>>> = OnceLock::new();

// Dynamic log level reload support
type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

const MIB: u64 = 1024 * 1024;

// ============================================================================
// Size rolling writer
// ============================================================================

/// Rotation policy for the running log file
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Rotate once the active file grows past this many bytes
    pub max_size: u64,
    /// Rotated files kept on disk, 0 keeps all
    pub max_backups: usize,
    /// Rotated files older than this are removed, zero disables age pruning
    pub max_age: Duration,
    /// Gzip rotated files
    pub compress: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_size: 5 * MIB,
            max_backups: 5,
            max_age: Duration::from_secs(7 * 86400),
            compress: true,
        }
    }
}

struct RollingState {
    file: Option<File>,
    size: u64,
}

/// File writer named `{name}.log` that rotates to `{name}-{timestamp}.log[.gz]`
#[derive(Clone)]
struct SizeRollingWriter {
    name: String,
    log_dir: PathBuf,
    policy: RotationPolicy,
    state: Arc<Mutex<RollingState>>,
}

impl SizeRollingWriter {
    fn new(name: String, log_dir: PathBuf, policy: RotationPolicy) -> std::io::Result<Self> {
        fs::create_dir_all(&log_dir)?;
        let path = log_dir.join(format!("{}.log", name));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            name,
            log_dir,
            policy,
            state: Arc::new(Mutex::new(RollingState {
                file: Some(file),
                size,
            })),
        })
    }

    fn active_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.name))
    }

    fn rotate(&self, state: &mut RollingState) -> std::io::Result<()> {
        // Close before rename so the handle does not keep writing into the backup
        state.file = None;

        let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S%.3f");
        let backup = self.log_dir.join(format!("{}-{}.log", self.name, stamp));
        let active = self.active_path();
        if active.exists() {
            fs::rename(&active, &backup)?;
            if self.policy.compress {
                compress_file(&backup)?;
                fs::remove_file(&backup)?;
            }
        }

        state.file = Some(OpenOptions::new().create(true).append(true).open(&active)?);
        state.size = 0;

        prune_backups(&self.log_dir, &self.name, &self.policy)
    }
}

impl std::io::Write for SizeRollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| std::io::Error::other(format!("Mutex poisoned: {}", e)))?;

        if state.size > 0 && state.size + buf.len() as u64 > self.policy.max_size {
            self.rotate(&mut state)?;
        }

        // Re-create the file if it was removed underneath us
        if state.file.is_none() || !self.active_path().exists() {
            fs::create_dir_all(&self.log_dir)?;
            state.file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.active_path())?,
            );
            state.size = 0;
        }

        match state.file.as_mut() {
            Some(file) => {
                let written = file.write(buf)?;
                state.size += written as u64;
                Ok(written)
            },
            None => Ok(0),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| std::io::Error::other(format!("Mutex poisoned: {}", e)))?;
        match state.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Compress a single file into `{path}.gz`
fn compress_file(path: &Path) -> std::io::Result<()> {
    let buffer = fs::read(path)?;
    let output = File::create(format!("{}.gz", path.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::best());
    encoder.write_all(&buffer)?;
    encoder.finish()?;
    Ok(())
}

/// Remove rotated files beyond the backup count or the age limit
fn prune_backups(log_dir: &Path, name: &str, policy: &RotationPolicy) -> std::io::Result<()> {
    let prefix = format!("{}-", name);
    let mut backups: Vec<(SystemTime, PathBuf)> = Vec::new();

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.starts_with(&prefix)
            || !(file_name.ends_with(".log") || file_name.ends_with(".log.gz"))
        {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        backups.push((modified, entry.path()));
    }

    // Newest first; names carry a sortable timestamp so ties break on the name
    backups.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let now = SystemTime::now();
    for (index, (modified, path)) in backups.iter().enumerate() {
        let too_many = policy.max_backups > 0 && index >= policy.max_backups;
        let too_old = !policy.max_age.is_zero()
            && now
                .duration_since(*modified)
                .map(|age| age > policy.max_age)
                .unwrap_or(false);
        if too_many || too_old {
            fs::remove_file(path)?;
        }
    }

    Ok(())
}

// ============================================================================
// Subscriber bootstrap
// ============================================================================

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, also the log file stem
    pub service_name: String,
    /// Directory for the running log
    pub log_dir: PathBuf,
    /// Filter used when RUST_LOG is not set (e.g. "info" or "info,rhilex=debug")
    pub level: String,
    /// Write to stdout as well as the file
    pub console: bool,
    pub rotation: RotationPolicy,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "rhilex".to_string(),
            log_dir: PathBuf::from("rhilex-running-log"),
            level: "info".to_string(),
            console: true,
            rotation: RotationPolicy::default(),
        }
    }
}

impl LogConfig {
    /// Build from the gateway `[app]` settings
    pub fn from_app(config: &crate::config::RhilexConfig) -> Self {
        Self {
            service_name: config.app_id.clone(),
            log_dir: PathBuf::from(&config.log_path),
            level: config.log_level.clone(),
            console: true,
            rotation: RotationPolicy {
                max_size: config.log_max_size.max(1) * MIB,
                max_backups: config.log_max_backups,
                max_age: Duration::from_secs(config.log_max_age * 86400),
                compress: config.log_compress,
            },
        }
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let writer = SizeRollingWriter::new(
        config.service_name.clone(),
        config.log_dir.clone(),
        config.rotation.clone(),
    )?;
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);

    let guards = GUARDS.get_or_init(|| Arc::new(Mutex::new(Vec::new())));
    match guards.lock() {
        Ok(mut guards) => guards.push(guard),
        Err(poisoned) => {
            eprintln!("Warning: GUARDS lock was poisoned, recovering...");
            poisoned.into_inner().push(guard);
        },
    }

    // RUST_LOG wins over the configured level
    let filter_str = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    let env_filter = EnvFilter::try_new(&filter_str).unwrap_or_else(|_| EnvFilter::new("info"));

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let _ = CURRENT_LOG_LEVEL.set(Mutex::new(filter_str));

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_ansi(true)
            .event_format(BracketedLevelFormat)
            .boxed()
    });

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(BracketedLevelFormat)
        .boxed();

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Logging: {} @ {:?}",
        config.service_name,
        config.log_dir
    );

    Ok(())
}

/// Console-only init for tools and tests
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let _ = CURRENT_LOG_LEVEL.set(Mutex::new(level.to_string()));

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(fmt::layer().event_format(BracketedLevelFormat))
        .try_init()?;
    Ok(())
}

/// Dynamically set log filter level at runtime
///
/// Accepts a bare level (`"debug"`) or a full filter spec (`"info,rhilex=debug"`).
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Get current log filter level
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy(max_size: u64, max_backups: usize, compress: bool) -> RotationPolicy {
        RotationPolicy {
            max_size,
            max_backups,
            max_age: Duration::ZERO,
            compress,
        }
    }

    fn backups(dir: &Path, name: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(&format!("{}-", name)))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_writer_rotates_when_size_exceeded() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            SizeRollingWriter::new("gw".into(), tmp.path().to_path_buf(), policy(16, 5, false))
                .unwrap();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();
        writer.flush().unwrap();

        let rotated = backups(tmp.path(), "gw");
        assert_eq!(rotated.len(), 1);
        let active = fs::read_to_string(tmp.path().join("gw.log")).unwrap();
        assert_eq!(active, "0123456789");
    }

    #[test]
    fn test_writer_compresses_rotated_files() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            SizeRollingWriter::new("gw".into(), tmp.path().to_path_buf(), policy(4, 5, true))
                .unwrap();

        writer.write_all(b"aaaa").unwrap();
        writer.write_all(b"bbbb").unwrap();

        let rotated = backups(tmp.path(), "gw");
        assert_eq!(rotated.len(), 1);
        assert!(rotated[0].ends_with(".log.gz"));
    }

    #[test]
    fn test_prune_keeps_max_backups() {
        let tmp = TempDir::new().unwrap();
        for i in 0..4 {
            fs::write(tmp.path().join(format!("gw-2024010{}T000000.000.log", i)), "x").unwrap();
        }
        fs::write(tmp.path().join("other.log"), "x").unwrap();

        prune_backups(tmp.path(), "gw", &policy(1, 2, false)).unwrap();

        assert_eq!(backups(tmp.path(), "gw").len(), 2);
        assert!(tmp.path().join("other.log").exists());
    }

    #[test]
    fn test_writer_recreates_deleted_file() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SizeRollingWriter::new(
            "gw".into(),
            tmp.path().to_path_buf(),
            policy(MIB, 5, false),
        )
        .unwrap();

        fs::remove_file(tmp.path().join("gw.log")).unwrap();
        writer.write_all(b"after").unwrap();
        writer.flush().unwrap();

        assert_eq!(
            fs::read_to_string(tmp.path().join("gw.log")).unwrap(),
            "after"
        );
    }

    #[test]
    fn test_log_config_from_app() {
        let app = crate::config::RhilexConfig::default();
        let cfg = LogConfig::from_app(&app);
        assert_eq!(cfg.rotation.max_size, 5 * MIB);
        assert_eq!(cfg.rotation.max_backups, 5);
        assert!(cfg.rotation.compress);
        assert_eq!(cfg.log_dir, PathBuf::from("rhilex-running-log"));
    }
}
