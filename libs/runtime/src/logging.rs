use crate::config::{LoggingConfig, Section};
use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::Level;
use tracing_subscriber::{
    filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};

// -------- level helpers --------
fn parse_tracing_level(s: &str) -> Option<Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" => None,
        _ => Some(Level::INFO),
    }
}

fn level_filter(s: &str) -> tracing_subscriber::filter::LevelFilter {
    match parse_tracing_level(s) {
        Some(l) => l.into(),
        None => tracing_subscriber::filter::LevelFilter::OFF,
    }
}

// -------- rotating writer for files --------
#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendCount>>>);

impl<'a> fmt::MakeWriter<'a> for RotWriter {
    type Writer = RotWriterHandle;
    fn make_writer(&'a self) -> Self::Writer {
        RotWriterHandle(self.0.clone())
    }
}

#[derive(Clone)]
struct RotWriterHandle(Arc<Mutex<FileRotate<AppendCount>>>);

impl Write for RotWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

fn rotating_writer(path: &Path, section: &Section) -> RotWriter {
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let max_bytes = section.max_size_mb.unwrap_or(100) as usize * 1024 * 1024;
    let max_backups = section.max_backups.unwrap_or(3);
    let rotate = FileRotate::new(
        path,
        AppendCount::new(max_backups),
        ContentLimit::Bytes(max_bytes),
        Compression::None,
        None,
    );
    RotWriter(Arc::new(Mutex::new(rotate)))
}

/// Build a `Targets` filter from the non-default sections: each subsystem key
/// maps to its own console level, everything else falls back to the default.
fn console_targets(config: &LoggingConfig, default_level: &str) -> Targets {
    let mut targets = Targets::new().with_default(level_filter(default_level));
    for (name, section) in config {
        if name == "default" {
            continue;
        }
        targets = targets.with_target(name.clone(), level_filter(&section.console_level));
    }
    targets
}

/// Initialize tracing from the logging configuration.
///
/// The "default" section drives the console level and the optional rotated
/// log file; other sections override the console level per target prefix.
/// Relative file paths are resolved against `base_dir`.
pub fn init_logging_from_config(config: &LoggingConfig, base_dir: &Path) {
    let default_section = config.get("default").cloned().unwrap_or(Section {
        console_level: "info".to_string(),
        file: String::new(),
        file_level: String::new(),
        max_backups: None,
        max_size_mb: None,
    });

    let targets = console_targets(config, &default_section.console_level);
    let console = fmt::layer().with_target(true).with_writer(std::io::stdout);

    if default_section.file.is_empty() {
        tracing_subscriber::registry()
            .with(console.with_filter(targets))
            .try_init()
            .ok();
        return;
    }

    let mut file_path = PathBuf::from(&default_section.file);
    if file_path.is_relative() {
        file_path = base_dir.join(file_path);
    }
    let writer = rotating_writer(&file_path, &default_section);
    let file_level = if default_section.file_level.is_empty() {
        default_section.console_level.clone()
    } else {
        default_section.file_level.clone()
    };
    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(level_filter(&file_level));

    tracing_subscriber::registry()
        .with(console.with_filter(targets))
        .with(file_layer)
        .try_init()
        .ok();
}
