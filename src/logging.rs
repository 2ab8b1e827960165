//! # Logging モジュール
//!
//! tracingの購読者を組み立てます。コンソールはcompact形式、ファイルは
//! 日次ローテーションのJSON Lines形式（tracing-appenderで非同期書き込み）です。
//! 環境変数`RUST_LOG`が設定されている場合はそちらが優先されます。
//!
//! 知覚・移動は毎ティック大量のtraceを出すため、既定では
//! `squadsim::models::perception`と`squadsim::models::navigation`を
//! 一段階低い詳細度に抑えます。
//!
//! ## 主なイベントタグ
//!
//! - `AGENT_STATE_TRANSITION` / `AGENT_DIED` / `AGENT_DESTROYED`
//! - `TARGET_DETECTED` / `TARGET_LOST`
//! - `COVER_CLAIMED` / `COVER_RELEASED`
//! - `SQUAD_ALERT` / `SQUAD_COMMANDER_PROMOTED` / `SQUAD_DISBANDED`
//! - `INVALID_STATE_ENTRY`（警告）

use std::str::FromStr;

use thiserror::Error;
use tracing::Level;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 毎ティック出力が多いモジュール
const NOISY_MODULES: [&str; 2] = ["squadsim::models::perception", "squadsim::models::navigation"];

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("無効な出力先: {0} (console, file, both のいずれか)")]
    InvalidOutput(String),
    #[error("無効なログレベル: {0} (trace, debug, info, warn, error のいずれか)")]
    InvalidLevel(String),
    #[error("ログディレクトリを作成できません {dir}: {source}")]
    Directory {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ログフィルタが不正です: {0}")]
    Filter(String),
    #[error("購読者の登録に失敗しました: {0}")]
    Init(String),
}

/// ログの出力先
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

impl FromStr for LogOutput {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(Self::Console),
            "file" => Ok(Self::File),
            "both" | "all" => Ok(Self::Both),
            other => Err(LoggingError::InvalidOutput(other.to_string())),
        }
    }
}

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub output: LogOutput,
    /// ファイル出力先ディレクトリ
    pub log_dir: String,
    pub file_prefix: String,
    /// 毎ティックのモジュールも`level`で出すか
    pub include_tick_chatter: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            output: LogOutput::Console,
            log_dir: "logs".to_string(),
            file_prefix: "squadsim".to_string(),
            include_tick_chatter: false,
        }
    }
}

impl LogConfig {
    /// `-v`の回数から設定を作る（-vvvで毎ティックのログも含める）
    pub fn from_verbosity(verbose_level: u8) -> Self {
        Self {
            level: level_for_verbosity(verbose_level),
            include_tick_chatter: verbose_level >= 3,
            ..Self::default()
        }
    }

    /// `RUST_LOG`未設定時に使うフィルタ文字列
    pub fn directives(&self) -> String {
        let level = self.level.to_string().to_ascii_lowercase();
        let mut directives = vec![level];
        if !self.include_tick_chatter {
            let quiet = quieter(self.level).to_string().to_ascii_lowercase();
            directives.extend(NOISY_MODULES.iter().map(|module| format!("{}={}", module, quiet)));
        }
        directives.join(",")
    }
}

/// 非同期ファイル書き込みのガード（破棄時に残りを書き出す）
#[must_use = "破棄するとファイルへのログ出力が止まります"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// ログシステムを初期化
///
/// 戻り値のガードはプログラム終了まで保持してください。
///
/// ```no_run
/// use squadsim::logging::{LogConfig, LogOutput, init_logging};
///
/// let config = LogConfig { output: LogOutput::Both, ..LogConfig::from_verbosity(2) };
/// let _guard = init_logging(&config)?;
/// # Ok::<(), squadsim::logging::LoggingError>(())
/// ```
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard, LoggingError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.directives()).map_err(|e| LoggingError::Filter(e.to_string()))?,
    };

    let console_layer = config.output.console().then(|| {
        fmt::layer()
            .compact()
            .with_timer(fmt::time::uptime())
            .with_target(false)
            .boxed()
    });

    let (file_layer, file_guard) = if config.output.file() {
        ensure_log_directory(&config.log_dir)?;
        let (writer, guard) = non_blocking(rolling::daily(&config.log_dir, &config.file_prefix));
        let layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_target(true)
            .with_writer(writer)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(LoggingGuard { _file: file_guard })
}

pub fn parse_log_level(level_str: &str) -> Result<Level, LoggingError> {
    Level::from_str(level_str.trim()).map_err(|_| LoggingError::InvalidLevel(level_str.to_string()))
}

/// 詳細出力レベル（-v の回数）から既定のログレベルを決める
pub fn level_for_verbosity(verbose_level: u8) -> Level {
    match verbose_level {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// 1段階詳細度を下げたレベル
fn quieter(level: Level) -> Level {
    match level {
        Level::TRACE => Level::DEBUG,
        Level::DEBUG => Level::INFO,
        Level::INFO => Level::WARN,
        _ => Level::ERROR,
    }
}

pub fn ensure_log_directory(log_dir: &str) -> Result<(), LoggingError> {
    std::fs::create_dir_all(log_dir).map_err(|source| LoggingError::Directory {
        dir: log_dir.to_string(),
        source,
    })
}
