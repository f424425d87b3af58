use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 捕获服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// 快照文件与累计文件的输出目录（不存在时自动创建）
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// 定时保存间隔（秒）
    #[serde(default = "default_save_interval")]
    pub save_interval: u64,

    /// 缓冲记录数达到该值时立即保存
    #[serde(default = "default_save_count")]
    pub save_count: usize,

    /// 快照文件名前缀
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,

    /// 累计文件名
    #[serde(default = "default_cumulative_file")]
    pub cumulative_file: String,

    /// 写入文件的来源标记（captured_via）
    #[serde(default = "default_captured_via")]
    pub captured_via: String,

    /// 终止信号触发的强制保存超时（秒）
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// 代理引擎 CA 证书路径（仅用于状态查询）
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/captured")
}

fn default_save_interval() -> u64 {
    30
}

fn default_save_count() -> usize {
    10
}

fn default_snapshot_prefix() -> String {
    "mitm_captured".to_string()
}

fn default_cumulative_file() -> String {
    "all-captured.json".to_string()
}

fn default_captured_via() -> String {
    "mitmproxy_improved".to_string()
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/certs/mitmproxy-ca-cert.pem")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            save_interval: default_save_interval(),
            save_count: default_save_count(),
            snapshot_prefix: default_snapshot_prefix(),
            cumulative_file: default_cumulative_file(),
            captured_via: default_captured_via(),
            shutdown_timeout: default_shutdown_timeout(),
            cert_path: default_cert_path(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "capture.json"
    }

    /// 使用指定输出目录的默认配置
    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 用进程环境变量覆盖配置
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    /// 用任意键值来源覆盖配置
    ///
    /// 数值解析失败时保留原值并记录警告
    pub fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("OUTPUT_DIR").filter(|v| !v.trim().is_empty()) {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("SAVE_INTERVAL") {
            match raw.trim().parse() {
                Ok(v) => self.save_interval = v,
                Err(e) => tracing::warn!(value = %raw, "SAVE_INTERVAL 无效，已忽略: {}", e),
            }
        }
        if let Some(raw) = lookup("SAVE_COUNT") {
            match raw.trim().parse() {
                Ok(v) => self.save_count = v,
                Err(e) => tracing::warn!(value = %raw, "SAVE_COUNT 无效，已忽略: {}", e),
            }
        }
        if let Some(tag) = lookup("CAPTURED_VIA").filter(|v| !v.trim().is_empty()) {
            self.captured_via = tag;
        }
        if let Some(cert) = lookup("CERT_PATH").filter(|v| !v.trim().is_empty()) {
            self.cert_path = PathBuf::from(cert);
        }
    }

    /// 将阈值限制在可用范围内
    pub fn validated(mut self) -> Self {
        if self.save_count == 0 {
            tracing::warn!("saveCount 不能为 0，已调整为 1");
            self.save_count = 1;
        }
        if self.save_interval == 0 {
            tracing::warn!("saveInterval 不能为 0，已调整为 1 秒");
            self.save_interval = 1;
        }
        self
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// 累计文件完整路径
    pub fn cumulative_path(&self) -> PathBuf {
        self.output_dir.join(&self.cumulative_file)
    }
}
