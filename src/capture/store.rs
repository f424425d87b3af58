//! 捕获持久化存储
//!
//! 每次保存写两个文件：
//! - 快照文件 `<prefix>_<YYYYmmdd_HHMMSS>.json`，只包含本批次
//! - 累计文件（默认 `all-captured.json`），读出旧内容后追加本批次再整体写回
//!
//! 累计文件损坏时按空处理，保证新数据能写入

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::config::Config;

use super::error::PersistError;
use super::record::{CaptureBatch, RouteEntry};

/// 输出目录权限
#[cfg(unix)]
const DIR_MODE: u32 = 0o755;
/// 输出文件权限
#[cfg(unix)]
const FILE_MODE: u32 = 0o644;

/// 快照文件内容
#[derive(Debug, Serialize)]
struct SnapshotFile<'a> {
    routes: Vec<RouteEntry<'a>>,
    captured_via: &'a str,
    timestamp: String,
    total_captures: usize,
}

/// 累计文件内容
///
/// 已有记录保持原始 JSON，避免旧格式记录在合并时丢失
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CumulativeFile {
    pub routes: Vec<Value>,
    #[serde(default)]
    pub captured_via: String,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub total_captures: usize,
}

/// 读取累计文件的结果
#[derive(Debug)]
pub enum PriorStore {
    /// 文件不存在
    Missing,
    Loaded(CumulativeFile),
    /// 文件存在但无法读取或解析
    Corrupt(String),
}

/// 一次成功保存的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub snapshot_path: PathBuf,
    pub cumulative_path: PathBuf,
    /// 本批次写入的记录数
    pub records_written: usize,
    /// 合并后累计文件中的记录总数
    pub cumulative_total: usize,
    /// 旧累计文件损坏并被丢弃
    pub recovered_corrupt_store: bool,
}

/// 捕获文件存储
#[derive(Debug, Clone)]
pub struct CaptureStore {
    output_dir: PathBuf,
    snapshot_prefix: String,
    cumulative_path: PathBuf,
    captured_via: String,
}

impl CaptureStore {
    /// 创建存储并确保输出目录存在
    pub fn open(config: &Config) -> Result<Self, PersistError> {
        let store = Self {
            output_dir: config.output_dir.clone(),
            snapshot_prefix: config.snapshot_prefix.clone(),
            cumulative_path: config.cumulative_path(),
            captured_via: config.captured_via.clone(),
        };
        store.ensure_output_dir()?;
        #[cfg(unix)]
        set_mode(&store.output_dir, DIR_MODE);
        Ok(store)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn cumulative_path(&self) -> &Path {
        &self.cumulative_path
    }

    fn ensure_output_dir(&self) -> Result<(), PersistError> {
        fs::create_dir_all(&self.output_dir).map_err(|source| PersistError::CreateDir {
            path: self.output_dir.clone(),
            source,
        })
    }

    /// 保存一个批次：写快照，再合并进累计文件
    pub fn flush(&self, batch: &CaptureBatch) -> Result<FlushReport, PersistError> {
        let now = Utc::now();
        self.ensure_output_dir()?;

        let snapshot_path = self.write_snapshot(batch, now)?;
        tracing::info!(
            count = batch.len(),
            path = %snapshot_path.display(),
            "已保存捕获快照"
        );

        let (mut routes, recovered_corrupt_store) = match read_cumulative(&self.cumulative_path) {
            PriorStore::Missing => (Vec::new(), false),
            PriorStore::Loaded(prior) => (prior.routes, false),
            PriorStore::Corrupt(reason) => {
                tracing::warn!(
                    path = %self.cumulative_path.display(),
                    "累计文件损坏，按空文件处理: {}",
                    reason
                );
                (Vec::new(), true)
            }
        };

        for record in batch.records() {
            let value = serde_json::to_value(record.route_entry()).map_err(|source| PersistError::Serialize {
                path: self.cumulative_path.clone(),
                source,
            })?;
            routes.push(value);
        }

        let cumulative = CumulativeFile {
            total_captures: routes.len(),
            routes,
            captured_via: self.captured_via.clone(),
            last_updated: Some(now.to_rfc3339()),
        };
        self.write_cumulative(&cumulative)?;
        tracing::info!(
            total = cumulative.total_captures,
            path = %self.cumulative_path.display(),
            "已更新累计文件"
        );

        Ok(FlushReport {
            snapshot_path,
            cumulative_path: self.cumulative_path.clone(),
            records_written: batch.len(),
            cumulative_total: cumulative.total_captures,
            recovered_corrupt_store,
        })
    }

    fn write_snapshot(
        &self,
        batch: &CaptureBatch,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, PersistError> {
        let snapshot = SnapshotFile {
            routes: batch.records().iter().map(|r| r.route_entry()).collect(),
            captured_via: &self.captured_via,
            timestamp: now.to_rfc3339(),
            total_captures: batch.len(),
        };

        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let content = serde_json::to_vec_pretty(&snapshot).map_err(|source| {
            PersistError::Serialize {
                path: self.output_dir.join(format!("{}_{}.json", self.snapshot_prefix, stamp)),
                source,
            }
        })?;

        let (path, file) = self.create_snapshot_file(&stamp)?;
        fill_new_file(&path, file, &content)?;

        #[cfg(unix)]
        set_mode(&path, FILE_MODE);
        Ok(path)
    }

    /// 以 create-new 方式创建快照文件，同一秒内的重名追加递增序号
    fn create_snapshot_file(&self, stamp: &str) -> Result<(PathBuf, fs::File), PersistError> {
        let mut seq = 0u32;
        loop {
            let name = if seq == 0 {
                format!("{}_{}.json", self.snapshot_prefix, stamp)
            } else {
                format!("{}_{}_{}.json", self.snapshot_prefix, stamp, seq)
            };
            let path = self.output_dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => seq += 1,
                Err(source) => return Err(PersistError::Write { path, source }),
            }
        }
    }

    /// 先写临时文件再 rename，读者不会看到写了一半的累计文件
    fn write_cumulative(&self, cumulative: &CumulativeFile) -> Result<(), PersistError> {
        let content = serde_json::to_vec_pretty(cumulative).map_err(|source| {
            PersistError::Serialize {
                path: self.cumulative_path.clone(),
                source,
            }
        })?;

        let tmp_path = self.cumulative_path.with_extension("json.tmp");
        fs::write(&tmp_path, content).map_err(|source| PersistError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        #[cfg(unix)]
        set_mode(&tmp_path, FILE_MODE);

        fs::rename(&tmp_path, &self.cumulative_path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            PersistError::Write {
                path: self.cumulative_path.clone(),
                source,
            }
        })
    }
}

/// 写入刚创建的文件，失败时删除，避免留下空的或写了一半的快照
fn fill_new_file(path: &Path, mut file: fs::File, content: &[u8]) -> Result<(), PersistError> {
    let result = file.write_all(content).and_then(|_| file.sync_all());
    drop(file);
    result.map_err(|source| {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), "删除不完整的快照文件失败: {}", e);
        }
        PersistError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// 读取累计文件（只读，不会失败）
pub fn read_cumulative(path: &Path) -> PriorStore {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return PriorStore::Missing,
        Err(e) => return PriorStore::Corrupt(format!("读取失败: {}", e)),
    };
    if content.trim().is_empty() {
        return PriorStore::Corrupt("文件为空".to_string());
    }
    match serde_json::from_str::<CumulativeFile>(&content) {
        Ok(file) => PriorStore::Loaded(file),
        Err(e) => PriorStore::Corrupt(format!("解析失败: {}", e)),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        tracing::warn!(path = %path.display(), "设置文件权限失败: {}", e);
    }
}
