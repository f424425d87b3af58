//! 代理引擎上报的原始流量数据

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};

/// 一次请求/响应交互（由代理引擎产生，本模块只读取）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFlow {
    /// 代理引擎分配的流量 ID，用于关联 request/response 两次回调
    pub id: String,
    pub method: String,
    /// 完整 URL
    pub url: String,
    pub host: String,
    /// 请求路径（可能带 query string）
    pub path: String,
    /// 请求头（保持顺序，允许重复 key）
    #[serde(default)]
    pub request_headers: Vec<(String, String)>,
    #[serde(default, deserialize_with = "wire_body")]
    pub request_body: Bytes,
    /// 响应（请求阶段为 None）
    #[serde(default)]
    pub response: Option<RawResponse>,
    /// 代理引擎记录的到达时间（可选）
    #[serde(default)]
    pub arrived_at: Option<DateTime<Utc>>,
}

/// 原始响应
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, deserialize_with = "wire_body")]
    pub body: Bytes,
}

impl RawFlow {
    /// 路径部分（去掉 query string）
    fn path_only(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(p, _)| p)
    }

    /// 路径分段（URL 解码，忽略空段）
    pub fn path_segments(&self) -> Vec<String> {
        self.path_only()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                urlencoding::decode(s)
                    .map(|d| d.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            })
            .collect()
    }

    /// query string（不含 `?`）
    pub fn query_string(&self) -> Option<&str> {
        self.path
            .split_once('?')
            .map(|(_, q)| q.split_once('#').map_or(q, |(q, _)| q))
            .filter(|q| !q.is_empty())
    }
}

/// 代理引擎回调事件（每行一个 JSON）
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "EventLine")]
pub enum FlowEvent {
    Request { flow: RawFlow },
    Response { flow: RawFlow },
    Shutdown,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EventKind {
    Request,
    Response,
    Shutdown,
}

/// 事件行的线上格式
///
/// 不使用 serde 的内部标签枚举：serde_json 开启 arbitrary_precision 后，
/// 经过缓冲的数字无法再还原为 u16 等整数类型
#[derive(Deserialize)]
struct EventLine {
    event: EventKind,
    #[serde(default)]
    flow: Option<RawFlow>,
}

impl TryFrom<EventLine> for FlowEvent {
    type Error = String;

    fn try_from(line: EventLine) -> Result<Self, Self::Error> {
        match (line.event, line.flow) {
            (EventKind::Request, Some(flow)) => Ok(FlowEvent::Request { flow }),
            (EventKind::Response, Some(flow)) => Ok(FlowEvent::Response { flow }),
            (EventKind::Shutdown, _) => Ok(FlowEvent::Shutdown),
            (_, None) => Err("missing field `flow`".to_string()),
        }
    }
}

/// body 既可以是 JSON 字符串，也可以是字节数组
fn wire_body<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    struct WireBody;

    impl<'de> Visitor<'de> for WireBody {
        type Value = Bytes;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string or an array of bytes")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Bytes, E> {
            Ok(Bytes::copy_from_slice(v.as_bytes()))
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Bytes, E> {
            Ok(Bytes::from(v))
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Bytes, E> {
            Ok(Bytes::copy_from_slice(v))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Bytes, E> {
            Ok(Bytes::new())
        }

        fn visit_none<E: de::Error>(self) -> Result<Bytes, E> {
            Ok(Bytes::new())
        }

        fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Bytes, D::Error> {
            deserializer.deserialize_any(self)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Bytes, A::Error> {
            let mut raw = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                raw.push(byte);
            }
            Ok(Bytes::from(raw))
        }
    }

    deserializer.deserialize_any(WireBody)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow_with_path(path: &str) -> RawFlow {
        RawFlow {
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_path_segments_skip_empty_and_query() {
        let flow = flow_with_path("/api//users/42/?page=2");
        assert_eq!(flow.path_segments(), vec!["api", "users", "42"]);
    }

    #[test]
    fn test_path_segments_are_decoded() {
        let flow = flow_with_path("/files/a%20b");
        assert_eq!(flow.path_segments(), vec!["files", "a b"]);
    }

    #[test]
    fn test_query_string() {
        assert_eq!(flow_with_path("/a?x=1&y=2").query_string(), Some("x=1&y=2"));
        assert_eq!(flow_with_path("/a?").query_string(), None);
        assert_eq!(flow_with_path("/a").query_string(), None);
    }

    #[test]
    fn test_deserialize_response_event_with_text_and_raw_bodies() {
        let line = r#"{
            "event": "response",
            "flow": {
                "id": "f1",
                "method": "POST",
                "url": "http://api.test/items",
                "host": "api.test",
                "path": "/items",
                "request_headers": [["Content-Type", "application/json"]],
                "request_body": "{\"a\":1}",
                "response": {"status": 201, "headers": [], "body": [111, 107]}
            }
        }"#;

        let event: FlowEvent = serde_json::from_str(line).unwrap();
        let FlowEvent::Response { flow } = event else {
            panic!("expected response event");
        };
        assert_eq!(flow.request_body, Bytes::from_static(b"{\"a\":1}"));
        let response = flow.response.unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, Bytes::from_static(b"ok"));
        assert!(flow.arrived_at.is_none());
    }

    #[test]
    fn test_deserialize_null_body_and_missing_flow() {
        let line = r#"{"event":"request","flow":{"id":"f2","method":"GET","url":"http://a.test/","host":"a.test","path":"/","request_body":null}}"#;
        let FlowEvent::Request { flow } = serde_json::from_str(line).unwrap() else {
            panic!("expected request event");
        };
        assert!(flow.request_body.is_empty());

        assert!(serde_json::from_str::<FlowEvent>(r#"{"event":"response"}"#).is_err());
    }

    #[test]
    fn test_deserialize_shutdown_event() {
        let event: FlowEvent = serde_json::from_str(r#"{"event":"shutdown"}"#).unwrap();
        assert!(matches!(event, FlowEvent::Shutdown));
    }
}
