use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::GatewayError;

/// 第三方依赖的日志最多放到 warn，避免淹没网关自身的日志
const NOISY_TARGETS: &[&str] = &["hickory_proto", "maxminddb"];

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(GatewayError::config(format!("未知日志级别: {}", other))),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, GatewayError> {
        value.parse()
    }
}

/// 日志输出目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File,
    Both,
}

/// 配置文件中的 `log` 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: LogLevel,
    pub output: LogOutput,
    pub file_path: PathBuf,
    /// 仅对 file / both 生效
    pub enable_rotation: bool,
    pub max_size_mb: u64,
    pub max_backups: usize,
    pub show_timestamp: bool,
    pub show_module: bool,
    /// 仅终端输出使用颜色
    pub use_color: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Stdout,
            file_path: PathBuf::from("logs/smart-gateway.log"),
            enable_rotation: true,
            max_size_mb: 10,
            max_backups: 5,
            show_timestamp: true,
            show_module: true,
            use_color: true,
        }
    }
}

impl LogSettings {
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    fn rotation(&self) -> Option<(u64, usize)> {
        if self.enable_rotation && self.max_size_mb > 0 {
            Some((self.max_size_mb * 1024 * 1024, self.max_backups))
        } else {
            None
        }
    }
}

/// 文件写入器，超过大小上限时轮转为 `xxx.log.1` … `xxx.log.N`
struct FileWriter {
    file: File,
    current_size: u64,
    path: PathBuf,
    rotation: Option<(u64, usize)>,
}

impl FileWriter {
    fn open(path: PathBuf, rotation: Option<(u64, usize)>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            file,
            current_size,
            path,
            rotation,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        if let Some((max_size, _)) = self.rotation {
            if self.current_size > 0 && self.current_size + line.len() as u64 + 1 > max_size {
                self.rotate()?;
            }
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.current_size += line.len() as u64 + 1;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let max_backups = self.rotation.map(|(_, n)| n).unwrap_or(0);

        if max_backups == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
        } else {
            let _ = std::fs::remove_file(self.backup_path(max_backups));
            for i in (1..max_backups).rev() {
                let from = self.backup_path(i);
                if from.exists() {
                    let _ = std::fs::rename(from, self.backup_path(i + 1));
                }
            }
            std::fs::rename(&self.path, self.backup_path(1))?;
            self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        }
        self.current_size = 0;
        Ok(())
    }
}

struct GatewayLogger {
    settings: LogSettings,
    file: Option<Mutex<FileWriter>>,
}

impl GatewayLogger {
    fn format(&self, record: &Record, color: bool) -> String {
        let mut line = String::with_capacity(128);
        if self.settings.show_timestamp {
            line.push_str(&format!("[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f")));
        }

        let level = match (record.level(), color) {
            (log::Level::Error, true) => "\x1b[31mERROR\x1b[0m",
            (log::Level::Warn, true) => "\x1b[33mWARN \x1b[0m",
            (log::Level::Info, true) => "\x1b[32mINFO \x1b[0m",
            (log::Level::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
            (log::Level::Trace, true) => "\x1b[35mTRACE\x1b[0m",
            (log::Level::Error, false) => "ERROR",
            (log::Level::Warn, false) => "WARN ",
            (log::Level::Info, false) => "INFO ",
            (log::Level::Debug, false) => "DEBUG",
            (log::Level::Trace, false) => "TRACE",
        };
        line.push_str(level);
        line.push(' ');

        if self.settings.show_module {
            if let Some(module) = record.module_path() {
                line.push('[');
                line.push_str(module);
                line.push_str("] ");
            }
        }

        line.push_str(&record.args().to_string());
        line
    }
}

impl Log for GatewayLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let target = metadata.target();
        if NOISY_TARGETS.iter().any(|t| target.starts_with(t)) && metadata.level() > log::Level::Warn {
            return false;
        }
        metadata.level() <= self.settings.level.to_level_filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if matches!(self.settings.output, LogOutput::Stdout | LogOutput::Both) {
            println!("{}", self.format(record, self.settings.use_color));
        }

        // 文件中不使用颜色
        if let Some(file) = &self.file {
            let line = self.format(record, false);
            let _ = file.lock().write_line(&line);
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            let _ = file.lock().file.flush();
        }
    }
}

/// 按配置安装全局日志器
pub fn init_logger(settings: LogSettings) -> Result<(), GatewayError> {
    let file = match settings.output {
        LogOutput::File | LogOutput::Both => {
            let writer = FileWriter::open(settings.file_path.clone(), settings.rotation())
                .map_err(|e| GatewayError::config(format!("无法创建日志文件: {}", e)))?;
            Some(Mutex::new(writer))
        }
        LogOutput::Stdout => None,
    };

    let max_level = settings.level.to_level_filter();
    log::set_boxed_logger(Box::new(GatewayLogger { settings, file }))
        .map_err(|e| GatewayError::config(format!("设置日志器失败: {}", e)))?;
    log::set_max_level(max_level);
    Ok(())
}

/// 读取 RUST_LOG 环境变量，其余保持默认
///
/// ```bash
/// RUST_LOG=debug ./smart-gateway config.json
/// ```
pub fn init_from_env() -> Result<(), GatewayError> {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogLevel::Info);
    init_logger(LogSettings::default().with_level(level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("ERROR".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("off".parse::<LogLevel>().unwrap(), LogLevel::Off);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Debug.to_level_filter(), LevelFilter::Debug);
    }

    #[test]
    fn test_settings_from_json() {
        let settings: LogSettings =
            serde_json::from_str(r#"{"level":"debug","output":"both","max_size_mb":1}"#).unwrap();
        assert_eq!(settings.level, LogLevel::Debug);
        assert_eq!(settings.output, LogOutput::Both);
        assert_eq!(settings.rotation(), Some((1024 * 1024, 5)));
        assert!(settings.show_timestamp);

        let bad = serde_json::from_str::<LogSettings>(r#"{"level":"loud"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_rotation_keeps_backups() {
        let dir = std::env::temp_dir().join(format!("smart-gateway-log-{}", std::process::id()));
        let path = dir.join("gw.log");
        let mut writer = FileWriter::open(path.clone(), Some((16, 2))).unwrap();

        for i in 0..4 {
            writer.write_line(&format!("line-{:08}", i)).unwrap();
        }

        assert!(path.exists());
        assert!(writer.backup_path(1).exists());
        assert!(writer.backup_path(2).exists());
        assert!(!writer.backup_path(3).exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_format_without_decorations() {
        let logger = GatewayLogger {
            settings: LogSettings {
                show_timestamp: false,
                show_module: false,
                use_color: false,
                ..Default::default()
            },
            file: None,
        };
        let line = logger.format(
            &Record::builder()
                .args(format_args!("hello"))
                .level(log::Level::Warn)
                .build(),
            false,
        );
        assert_eq!(line, "WARN  hello");
    }
}
