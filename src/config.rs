use crate::persistence::PersistenceType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// 进度落盘节流配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressThrottleConfig {
    /// 两次批量落盘的最小间隔(ms)
    pub interval_ms: u64,
    /// 缓冲中累计的进度变化达到该阈值(bytes)时立即落盘
    pub threshold_bytes: u64,
}

impl Default for ProgressThrottleConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            threshold_bytes: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl ProgressThrottleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// 断点存储配置主结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub persistence_type: PersistenceType,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub wal: bool,
    pub progress_throttle: ProgressThrottleConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            persistence_type: PersistenceType::Sqlite("breakpoints.db".into()),
            max_connections: 4,
            busy_timeout_ms: 5000,
            operation_timeout_ms: 10_000,
            wal: true,
            progress_throttle: ProgressThrottleConfig::default(),
        }
    }
}

/// Builder 模式的实现
#[derive(Debug, Clone, Default)]
pub struct LedgerConfigBuilder {
    inner: LedgerConfig,
}

impl LedgerConfigBuilder {
    pub fn new() -> Self {
        Self {
            inner: LedgerConfig::default(),
        }
    }

    pub fn persistence_type(mut self, p: PersistenceType) -> Self {
        self.inner.persistence_type = p;
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.inner.max_connections = n;
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u64) -> Self {
        self.inner.busy_timeout_ms = ms;
        self
    }

    pub fn operation_timeout_ms(mut self, ms: u64) -> Self {
        self.inner.operation_timeout_ms = ms;
        self
    }

    pub fn wal(mut self, enable: bool) -> Self {
        self.inner.wal = enable;
        self
    }

    pub fn progress_throttle(mut self, cfg: ProgressThrottleConfig) -> Self {
        self.inner.progress_throttle = cfg;
        self
    }

    /// 构建配置并验证
    pub fn build(self) -> Result<LedgerConfig, LedgerConfigError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[derive(Debug, Error)]
pub enum LedgerConfigError {
    #[error("Invalid database path: {0}")]
    InvalidDatabasePath(String),
    #[error("Invalid pool size: {0}")]
    InvalidPoolSize(u32),
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("Invalid progress throttle: {0}")]
    InvalidThrottle(String),
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl LedgerConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), LedgerConfigError> {
        if let PersistenceType::Sqlite(path) = &self.persistence_type {
            if path.trim().is_empty() {
                return Err(LedgerConfigError::InvalidDatabasePath(path.clone()));
            }
        }

        if self.max_connections == 0 || self.max_connections > 64 {
            return Err(LedgerConfigError::InvalidPoolSize(self.max_connections));
        }

        if self.operation_timeout_ms == 0 {
            return Err(LedgerConfigError::InvalidTimeout(
                "operation timeout must be positive".into(),
            ));
        }

        if self.operation_timeout_ms < self.busy_timeout_ms {
            return Err(LedgerConfigError::InvalidTimeout(format!(
                "operation timeout {}ms is shorter than busy timeout {}ms",
                self.operation_timeout_ms, self.busy_timeout_ms
            )));
        }

        if self.progress_throttle.interval_ms == 0 {
            return Err(LedgerConfigError::InvalidThrottle(
                "interval_ms must be positive".into(),
            ));
        }

        Ok(())
    }

    /// 从 TOML 文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LedgerConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }
}

impl FromStr for LedgerConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}
