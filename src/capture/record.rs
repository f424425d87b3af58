//! 捕获记录数据模型

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 一条规范化后的捕获记录（创建后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub method: String,
    /// 数字段与 UUID 形式的段替换为 `{id}` 后的路径
    pub path_template: String,
    /// 原始请求路径
    pub original_path: String,
    pub status: u16,
    /// JSON 响应体；非 JSON 时为（截断后的）文本；空 body 为 null
    pub response_body: Value,
    pub request_body: Value,
    pub request_headers: Map<String, Value>,
    pub response_headers: Map<String, Value>,
    pub query_params: Map<String, Value>,
    pub response_time_ms: i64,
    pub host: String,
    pub full_url: String,
    pub description: String,
    /// 规范化时间（RFC3339）
    pub captured_at: String,
}

/// 写入快照/累计文件的路由条目
///
/// 在记录字段之外附带 mock server 读取的 `path` / `response` / `headers`
#[derive(Debug, Serialize)]
pub struct RouteEntry<'a> {
    /// 等同于 `path_template`
    pub path: &'a str,
    /// 等同于 `response_body`
    pub response: &'a Value,
    /// 等同于 `response_headers`
    pub headers: &'a Map<String, Value>,
    #[serde(flatten)]
    pub record: &'a CaptureRecord,
}

impl CaptureRecord {
    pub fn route_entry(&self) -> RouteEntry<'_> {
        RouteEntry {
            path: &self.path_template,
            response: &self.response_body,
            headers: &self.response_headers,
            record: self,
        }
    }
}

/// 一个待持久化的非空批次
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureBatch {
    records: Vec<CaptureRecord>,
}

impl CaptureBatch {
    /// 空记录列表返回 None
    pub fn new(records: Vec<CaptureRecord>) -> Option<Self> {
        if records.is_empty() {
            None
        } else {
            Some(Self { records })
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CaptureRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<CaptureRecord> {
        self.records
    }
}
