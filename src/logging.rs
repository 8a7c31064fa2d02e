use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// `<dir>/<name>_<YYYYmmdd_HHMMSS>.log`
pub fn log_file_path(dir: &Path, name: &str) -> PathBuf {
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("{}_{}.log", name, ts))
}

/// stderr + ログファイルへ出力する subscriber を登録
///
/// フィルタは `RUST_LOG` があればそれを、なければ設定の level を使う。
/// 戻り値はログファイルのパス（ファイル出力無効なら None）。
pub fn init(config: &LoggingConfig, name: &str) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level: {}", config.level))?;

    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let (file_layer, path) = if config.file {
        let dir = Path::new(&config.dir);
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let path = log_file_path(dir, name);
        let file = fs::File::create(&path)
            .with_context(|| format!("Failed to create log file: {}", path.display()))?;
        let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
        (Some(layer), Some(path))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(path) = &path {
        tracing::info!("Log: {}", path.display());
    }
    Ok(path)
}
