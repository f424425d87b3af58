//! 捕获目录状态查询
//!
//! 只读取输出目录，不写入；累计文件缺失、为空或正在写入时都不会报错

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capture::store::{read_cumulative, PriorStore};
use crate::model::config::Config;

/// 最近快照文件的展示数量
const RECENT_FILES: usize = 5;

/// 单个快照文件信息
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFileInfo {
    pub name: String,
    pub size: u64,
    pub modified: Option<String>,
}

/// 捕获状态
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub capture_directory: PathBuf,
    /// 目录中 JSON 文件数量（含累计文件）
    pub file_count: usize,
    /// 累计文件中的记录数
    pub total_captures: usize,
    /// 累计文件的 last_updated
    pub latest_update: Option<String>,
    /// 累计文件无法解析时的原因
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    /// 最近修改的快照文件
    pub recent_files: Vec<SnapshotFileInfo>,
}

impl CaptureStatus {
    /// 收集输出目录状态
    pub fn collect(config: &Config) -> Self {
        let dir = &config.output_dir;
        let snapshot_prefix = format!("{}_", config.snapshot_prefix);

        let mut file_count = 0;
        let mut snapshots: Vec<(SystemTime, SnapshotFileInfo)> = Vec::new();
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.extension().map(|e| e == "json").unwrap_or(false) {
                    continue;
                }
                file_count += 1;

                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with(&snapshot_prefix) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let modified = meta.modified().ok();
                snapshots.push((
                    modified.unwrap_or(SystemTime::UNIX_EPOCH),
                    SnapshotFileInfo {
                        name,
                        size: meta.len(),
                        modified: modified.map(format_time),
                    },
                ));
            }
        }
        snapshots.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.name.cmp(&a.1.name)));
        let recent_files = snapshots
            .into_iter()
            .take(RECENT_FILES)
            .map(|(_, info)| info)
            .collect();

        let (total_captures, latest_update, store_error) =
            match read_cumulative(&config.cumulative_path()) {
                PriorStore::Missing => (0, None, None),
                PriorStore::Loaded(file) => (file.routes.len(), file.last_updated, None),
                PriorStore::Corrupt(reason) => (0, None, Some(reason)),
            };

        Self {
            capture_directory: dir.clone(),
            file_count,
            total_captures,
            latest_update,
            store_error,
            recent_files,
        }
    }
}

/// CA 证书状态
#[derive(Debug, Clone, Serialize)]
pub struct CertificateStatus {
    pub path: PathBuf,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    pub readable: bool,
}

impl CertificateStatus {
    pub fn inspect(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) => Self {
                path: path.to_path_buf(),
                exists: true,
                size: Some(meta.len()),
                modified: meta.modified().ok().map(format_time),
                readable: fs::File::open(path).is_ok(),
            },
            Err(_) => Self {
                path: path.to_path_buf(),
                exists: false,
                size: None,
                modified: None,
                readable: false,
            },
        }
    }
}

/// 完整状态报告
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: String,
    pub captures: CaptureStatus,
    pub certificate: CertificateStatus,
}

impl StatusReport {
    pub fn collect(config: &Config) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            captures: CaptureStatus::collect(config),
            certificate: CertificateStatus::inspect(&config.cert_path),
        }
    }
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}
