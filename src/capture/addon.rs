//! 代理引擎回调入口
//!
//! 代理引擎在看到请求、看到响应、停止时分别调用
//! [`CaptureAddon::on_request`]、[`CaptureAddon::on_response`]、
//! [`CaptureAddon::on_shutdown`]。回调本身不会失败，也不会在写盘上阻塞。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::config::Config;
use crate::model::flow::RawFlow;

use super::buffer::CaptureBuffer;
use super::error::CaptureError;
use super::normalizer::Normalizer;
use super::policy::{FlushHandle, FlushOutcome, FlushTrigger};

/// 等待响应的请求最长保留时间，超过后按无请求时间处理（耗时记为 0）
const PENDING_REQUEST_TTL_SECS: i64 = 600;
/// 等待响应的请求数上限，超出时淘汰最早的请求
const MAX_PENDING_REQUESTS: usize = 10_000;
/// 过期请求的清理间隔
const PENDING_SWEEP_INTERVAL_SECS: i64 = 60;

/// 请求到达时间表
///
/// 没有响应的流量（客户端中断、上游错误、websocket 升级）不会被响应回调移除，
/// 插入时按间隔清理过期项，并限制总数
#[derive(Debug, Default)]
struct PendingRequests {
    seen: HashMap<String, DateTime<Utc>>,
    last_sweep: Option<DateTime<Utc>>,
}

impl PendingRequests {
    fn insert(&mut self, id: String, seen_at: DateTime<Utc>) {
        self.seen.insert(id, seen_at);

        let sweep_due = self.last_sweep.is_none_or(|last| {
            seen_at - last >= chrono::Duration::seconds(PENDING_SWEEP_INTERVAL_SECS)
        });
        if sweep_due || self.seen.len() > MAX_PENDING_REQUESTS {
            self.evict_stale(seen_at);
        }
        while self.seen.len() > MAX_PENDING_REQUESTS {
            let Some(oldest) = self
                .seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            self.seen.remove(&oldest);
        }
    }

    fn evict_stale(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::seconds(PENDING_REQUEST_TTL_SECS);
        let before = self.seen.len();
        self.seen.retain(|_, at| now - *at < ttl);
        self.last_sweep = Some(now);

        let evicted = before - self.seen.len();
        if evicted > 0 {
            tracing::debug!(evicted, pending = self.seen.len(), "清理未收到响应的请求");
        }
        evicted
    }
}

/// 捕获插件
pub struct CaptureAddon {
    normalizer: Normalizer,
    buffer: Arc<CaptureBuffer>,
    flush: FlushHandle,
    /// 本轮记录数达到该值时请求保存
    save_count: usize,
    /// 流量 ID -> 请求到达时间
    request_seen: Mutex<PendingRequests>,
}

impl CaptureAddon {
    pub fn new(config: &Config, buffer: Arc<CaptureBuffer>, flush: FlushHandle) -> Self {
        Self {
            normalizer: Normalizer::new(config.captured_via.clone()),
            buffer,
            flush,
            save_count: config.save_count.max(1),
            request_seen: Mutex::new(PendingRequests::default()),
        }
    }

    /// 请求回调：记录请求到达时间
    pub fn on_request(&self, flow: &RawFlow) {
        self.on_request_at(flow, Utc::now());
    }

    /// 使用指定时间记录请求到达
    pub fn on_request_at(&self, flow: &RawFlow, seen_at: DateTime<Utc>) {
        if flow.id.is_empty() {
            tracing::warn!(method = %flow.method, path = %flow.path, "请求缺少流量 ID，无法记录耗时");
            return;
        }
        self.request_seen.lock().insert(flow.id.clone(), seen_at);
    }

    /// 响应回调：规范化并写入缓冲区
    pub fn on_response(&self, flow: &RawFlow) {
        self.on_response_at(flow, Utc::now());
    }

    /// 使用指定时间处理响应
    ///
    /// 单条流量的错误只记录日志，不会向调用方传播
    pub fn on_response_at(&self, flow: &RawFlow, seen_at: DateTime<Utc>) {
        if let Err(e) = self.capture(flow, seen_at) {
            tracing::warn!(
                method = %flow.method,
                path = %flow.path,
                status = flow.response.as_ref().map(|r| r.status),
                "捕获流量失败，已丢弃: {}",
                e
            );
        }
    }

    fn capture(&self, flow: &RawFlow, seen_at: DateTime<Utc>) -> Result<(), CaptureError> {
        let request_seen_at = self.request_seen.lock().seen.remove(&flow.id);
        let record = self.normalizer.normalize(flow, request_seen_at, seen_at)?;

        #[cfg(feature = "sensitive-logs")]
        tracing::debug!(
            request_body = %record.request_body,
            response_body = %record.response_body,
            "捕获流量 body"
        );

        let (method, path, status, elapsed) = (
            record.method.clone(),
            record.original_path.clone(),
            record.status,
            record.response_time_ms,
        );
        let cycle = self.buffer.append(record);
        tracing::info!(
            total = self.buffer.total_count(),
            "已捕获: {} {} -> {} ({}ms)",
            method,
            path,
            status,
            elapsed
        );

        if cycle >= self.save_count {
            tracing::info!(save_count = self.save_count, "达到保存数量阈值，触发保存");
            self.flush.request(FlushTrigger::Count);
        }
        Ok(())
    }

    /// 停止回调：强制保存剩余记录，返回生命周期内的捕获总数
    pub async fn on_shutdown(&self) -> u64 {
        tracing::info!("代理引擎停止，保存剩余捕获记录");
        if let FlushOutcome::Failed { error, dropped } = self.flush.flush(FlushTrigger::Shutdown).await {
            tracing::error!(dropped, "停止前保存失败: {}", error);
        }
        self.request_seen.lock().seen.clear();

        let total = self.buffer.total_count();
        tracing::info!(total, "本次会话捕获总数");
        total
    }

    /// 带超时的停止回调（用于终止信号路径）
    pub async fn on_shutdown_with_timeout(&self, timeout: Duration) -> u64 {
        match tokio::time::timeout(timeout, self.on_shutdown()).await {
            Ok(total) => total,
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs(), "停止前保存超时");
                self.buffer.total_count()
            }
        }
    }

    /// 等待响应的请求数
    pub fn pending_requests(&self) -> usize {
        self.request_seen.lock().seen.len()
    }

    /// 清理超过保留时间仍未收到响应的请求，返回清理数量
    pub fn evict_stale_requests(&self, now: DateTime<Utc>) -> usize {
        self.request_seen.lock().evict_stale(now)
    }

    pub fn buffer(&self) -> &Arc<CaptureBuffer> {
        &self.buffer
    }
}
