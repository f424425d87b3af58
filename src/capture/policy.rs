//! 保存策略
//!
//! 数量阈值、定时器、信号和 shutdown 钩子都只负责发送保存请求，
//! 由唯一的后台任务串行执行 drain + 写盘。drain 为空时直接跳过。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::buffer::CaptureBuffer;
use super::store::{CaptureStore, FlushReport};

/// 请求通道容量（超出时说明已有足够的请求在排队）
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// 保存触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// 本轮记录数达到阈值
    Count,
    /// 定时器
    Timer,
    /// 外部信号（SIGUSR1 / SIGTERM / SIGINT）
    Signal,
    /// 代理引擎停止
    Shutdown,
}

impl FlushTrigger {
    /// 强制保存：缓冲区为空时也要给出明确结果
    pub fn is_forced(self) -> bool {
        matches!(self, FlushTrigger::Signal | FlushTrigger::Shutdown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Count => "count",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Signal => "signal",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// 一次保存的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Saved(FlushReport),
    /// 没有需要保存的记录
    Empty,
    /// 写盘失败，`dropped` 条记录已丢弃
    Failed { error: String, dropped: usize },
}

struct FlushRequest {
    trigger: FlushTrigger,
    ack: Option<oneshot::Sender<FlushOutcome>>,
}

/// 保存请求句柄（可在同步代码中使用）
#[derive(Clone)]
pub struct FlushHandle {
    sender: mpsc::Sender<FlushRequest>,
}

impl FlushHandle {
    /// 非阻塞地请求一次保存
    ///
    /// 返回 false 表示后台任务已退出
    pub fn request(&self, trigger: FlushTrigger) -> bool {
        match self.sender.try_send(FlushRequest { trigger, ack: None }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(trigger = trigger.as_str(), "保存请求队列已满，跳过本次请求");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(trigger = trigger.as_str(), "保存任务已停止，无法处理保存请求");
                false
            }
        }
    }

    /// 请求保存并等待结果
    pub async fn flush(&self, trigger: FlushTrigger) -> FlushOutcome {
        let (tx, rx) = oneshot::channel();
        let request = FlushRequest {
            trigger,
            ack: Some(tx),
        };
        if self.sender.send(request).await.is_err() {
            return worker_stopped();
        }
        rx.await.unwrap_or_else(|_| worker_stopped())
    }

    /// 带超时的强制保存
    pub async fn flush_with_timeout(
        &self,
        trigger: FlushTrigger,
        timeout: Duration,
    ) -> Option<FlushOutcome> {
        match tokio::time::timeout(timeout, self.flush(trigger)).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                tracing::warn!(
                    trigger = trigger.as_str(),
                    timeout_secs = timeout.as_secs(),
                    "强制保存超时"
                );
                None
            }
        }
    }
}

fn worker_stopped() -> FlushOutcome {
    FlushOutcome::Failed {
        error: "flush worker stopped".to_string(),
        dropped: 0,
    }
}

/// 启动唯一的保存任务
pub fn spawn_flush_worker(
    buffer: Arc<CaptureBuffer>,
    store: Arc<CaptureStore>,
) -> (FlushHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<FlushRequest>(REQUEST_CHANNEL_CAPACITY);

    let task = tokio::spawn(async move {
        while let Some(request) = receiver.recv().await {
            let outcome = flush_once(&buffer, &store, request.trigger).await;
            if let Some(ack) = request.ack {
                let _ = ack.send(outcome);
            }
        }
        tracing::debug!("保存任务已退出");
    });

    (FlushHandle { sender }, task)
}

/// drain 缓冲区并写盘
///
/// 写盘在阻塞线程池中执行，不持有缓冲区锁
async fn flush_once(
    buffer: &CaptureBuffer,
    store: &Arc<CaptureStore>,
    trigger: FlushTrigger,
) -> FlushOutcome {
    let Some(batch) = buffer.drain() else {
        if trigger.is_forced() {
            tracing::info!(trigger = trigger.as_str(), "没有需要保存的捕获记录");
        } else {
            tracing::debug!(trigger = trigger.as_str(), "缓冲区为空，跳过保存");
        }
        return FlushOutcome::Empty;
    };

    let batch_size = batch.len();
    let write_store = store.clone();
    match tokio::task::spawn_blocking(move || write_store.flush(&batch)).await {
        Ok(Ok(report)) => {
            tracing::info!(
                trigger = trigger.as_str(),
                count = report.records_written,
                total = report.cumulative_total,
                "捕获记录已保存"
            );
            FlushOutcome::Saved(report)
        }
        Ok(Err(e)) => {
            tracing::error!(
                trigger = trigger.as_str(),
                path = %e.path().display(),
                batch_size,
                "保存捕获记录失败，本批次已丢弃: {}",
                e
            );
            FlushOutcome::Failed {
                error: e.to_string(),
                dropped: batch_size,
            }
        }
        Err(e) => {
            tracing::error!(
                trigger = trigger.as_str(),
                batch_size,
                "保存任务异常，本批次已丢弃: {}",
                e
            );
            FlushOutcome::Failed {
                error: e.to_string(),
                dropped: batch_size,
            }
        }
    }
}

/// 启动定时保存任务
///
/// 只在缓冲区非空时发出请求；保存任务退出后定时器随之结束
pub fn spawn_timer(
    handle: FlushHandle,
    buffer: Arc<CaptureBuffer>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if buffer.is_empty() {
                continue;
            }
            tracing::info!(interval_secs = period.as_secs(), "定时触发保存");
            if !handle.request(FlushTrigger::Timer) {
                break;
            }
        }
    })
}

/// 等待信号
///
/// SIGUSR1 强制保存后继续等待；SIGTERM / SIGINT 强制保存（带超时）后返回信号名，
/// 由调用方结束进程
#[cfg(unix)]
pub async fn watch_signals(handle: FlushHandle, timeout: Duration) -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    loop {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            _ = user1.recv() => "SIGUSR1",
        };
        tracing::info!(signal = name, "收到信号，保存捕获记录");
        handle.flush_with_timeout(FlushTrigger::Signal, timeout).await;
        if name != "SIGUSR1" {
            return Ok(name);
        }
    }
}

#[cfg(not(unix))]
pub async fn watch_signals(handle: FlushHandle, timeout: Duration) -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(signal = "ctrl-c", "收到信号，保存捕获记录");
    handle.flush_with_timeout(FlushTrigger::Signal, timeout).await;
    Ok("ctrl-c")
}
