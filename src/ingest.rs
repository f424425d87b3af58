//! 代理引擎事件接入
//!
//! 代理引擎（例如一个很薄的 mitmproxy 插件）把回调逐行以 JSON 写出：
//!
//! ```text
//! {"event":"request","flow":{...}}
//! {"event":"response","flow":{...}}
//! {"event":"shutdown"}
//! ```
//!
//! 收到 `shutdown`、输入结束或读取出错时都会调用停止回调

use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::capture::CaptureAddon;
use crate::model::flow::FlowEvent;

/// 一次接入的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub requests: u64,
    pub responses: u64,
    /// 无法解析而跳过的行（含非法 UTF-8）
    pub malformed: u64,
    /// 事件流读取出错时的原因（此后不再读取）
    pub read_error: Option<String>,
    /// 生命周期捕获总数
    pub total_captured: u64,
}

/// 读取事件流直到 shutdown 或 EOF
///
/// 单行的问题只跳过该行；读取本身出错时结束读取。无论哪种情况，
/// 返回前都会执行停止回调保存剩余记录
pub async fn run<R>(mut reader: R, addon: &CaptureAddon) -> IngestSummary
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = IngestSummary::default();
    let mut line_no = 0u64;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(line = line_no + 1, "读取事件流失败，停止接入: {}", e);
                summary.read_error = Some(e.to_string());
                break;
            }
        }
        line_no += 1;

        let line = buf.trim_ascii();
        if line.is_empty() {
            continue;
        }

        let event = match serde_json::from_slice::<FlowEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                summary.malformed += 1;
                tracing::warn!(line = line_no, "无法解析事件，已跳过: {}", e);
                continue;
            }
        };

        match event {
            FlowEvent::Request { flow } => {
                summary.requests += 1;
                addon.on_request_at(&flow, flow.arrived_at.unwrap_or_else(Utc::now));
            }
            FlowEvent::Response { flow } => {
                summary.responses += 1;
                addon.on_response(&flow);
            }
            FlowEvent::Shutdown => {
                tracing::debug!(line = line_no, "收到 shutdown 事件");
                break;
            }
        }
    }

    summary.total_captured = addon.on_shutdown().await;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::policy::spawn_flush_worker;
    use crate::capture::store::{read_cumulative, PriorStore};
    use crate::capture::{CaptureBuffer, CaptureStore};
    use crate::model::config::Config;
    use std::sync::Arc;

    fn addon_in(dir: &std::path::Path) -> (CaptureAddon, Arc<CaptureStore>) {
        let config = Config::with_output_dir(dir);
        let store = Arc::new(CaptureStore::open(&config).unwrap());
        let buffer = Arc::new(CaptureBuffer::new());
        let (handle, _task) = spawn_flush_worker(buffer.clone(), store.clone());
        (CaptureAddon::new(&config, buffer, handle), store)
    }

    const FLOW: &str = r#"{"id":"f1","method":"POST","url":"https://api.test/v1/orders?dry=1","host":"api.test","path":"/v1/orders?dry=1","request_body":"{\"qty\":2}","arrived_at":"2026-01-01T00:00:00Z"}"#;

    #[tokio::test]
    async fn test_run_captures_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (addon, store) = addon_in(dir.path());
        let response = FLOW.replacen(
            "\"arrived_at\"",
            "\"response\":{\"status\":201,\"body\":\"created\"},\"arrived_at\"",
            1,
        );
        let input = format!(
            "{{\"event\":\"request\",\"flow\":{}}}\n\nnot json\n{{\"event\":\"response\",\"flow\":{}}}\n",
            FLOW, response
        );

        let summary = run(input.as_bytes(), &addon).await;
        assert_eq!(summary.requests, 1);
        assert_eq!(summary.responses, 1);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.total_captured, 1);

        let PriorStore::Loaded(file) = read_cumulative(store.cumulative_path()) else {
            panic!("expected cumulative store");
        };
        let record = &file.routes[0];
        assert_eq!(record["method"], "POST");
        assert_eq!(record["request_body"], serde_json::json!({"qty": 2}));
        assert_eq!(record["response_body"], "created");
        assert_eq!(record["query_params"]["dry"], "1");
    }

    #[tokio::test]
    async fn test_run_stops_at_shutdown_event() {
        let dir = tempfile::tempdir().unwrap();
        let (addon, _store) = addon_in(dir.path());
        let input = format!(
            "{{\"event\":\"shutdown\"}}\n{{\"event\":\"request\",\"flow\":{}}}\n",
            FLOW
        );

        let summary = run(input.as_bytes(), &addon).await;
        assert_eq!(summary.requests, 0);
        assert_eq!(summary.total_captured, 0);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped_and_buffer_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let (addon, store) = addon_in(dir.path());
        let response = FLOW.replacen(
            "\"arrived_at\"",
            "\"response\":{\"status\":200,\"body\":\"ok\"},\"arrived_at\"",
            1,
        );
        let mut input = format!("{{\"event\":\"response\",\"flow\":{}}}\n", response).into_bytes();
        input.extend_from_slice(b"\xff\xfe\n");

        let summary = run(input.as_slice(), &addon).await;
        assert_eq!(summary.responses, 1);
        assert_eq!(summary.malformed, 1);
        assert!(summary.read_error.is_none());
        assert_eq!(summary.total_captured, 1);
        assert!(addon.buffer().is_empty());

        let PriorStore::Loaded(file) = read_cumulative(store.cumulative_path()) else {
            panic!("expected cumulative store");
        };
        assert_eq!(file.routes.len(), 1);
    }

    struct FailingReader;

    impl tokio::io::AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("pipe closed")))
        }
    }

    #[tokio::test]
    async fn test_read_error_still_flushes_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (addon, store) = addon_in(dir.path());
        let flow: crate::model::flow::RawFlow = serde_json::from_str(&FLOW.replacen(
            "\"arrived_at\"",
            "\"response\":{\"status\":200},\"arrived_at\"",
            1,
        ))
        .unwrap();
        addon.on_response(&flow);

        let summary = run(tokio::io::BufReader::new(FailingReader), &addon).await;
        assert_eq!(summary.read_error.as_deref(), Some("pipe closed"));
        assert_eq!(summary.total_captured, 1);
        assert!(matches!(read_cumulative(store.cumulative_path()), PriorStore::Loaded(_)));
    }
}
