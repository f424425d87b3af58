//! 流量规范化
//!
//! 把代理引擎上报的原始请求/响应转换成稳定结构的 [`CaptureRecord`]：
//! - 路径模板化（数字 ID / UUID 段替换为 `{id}`）
//! - body 解析（优先 JSON，失败回退为截断文本）
//! - header / query 参数展开
//! - 响应耗时计算

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::common::truncate_with_marker;
use crate::model::flow::RawFlow;

use super::error::CaptureError;
use super::record::CaptureRecord;

/// 文本 body 最大保留字符数
pub const MAX_BODY_CHARS: usize = 10_000;

/// 路径模板中的 ID 占位符
pub const ID_PLACEHOLDER: &str = "{id}";

/// UUID 形式段的长度与连字符数（宽松匹配，不校验字符集）
const UUID_LEN: usize = 36;
const UUID_HYPHENS: usize = 4;

/// 流量规范化器
#[derive(Debug, Clone)]
pub struct Normalizer {
    /// 写入 description 的来源标记
    source_tag: String,
}

impl Normalizer {
    pub fn new(source_tag: impl Into<String>) -> Self {
        Self {
            source_tag: source_tag.into(),
        }
    }

    /// 规范化一条完整流量
    ///
    /// `request_seen_at` 为 None 时耗时记为 0。body 解析失败不会报错，
    /// 只有缺少响应或字段非法时返回 [`CaptureError`]。
    pub fn normalize(
        &self,
        flow: &RawFlow,
        request_seen_at: Option<DateTime<Utc>>,
        response_seen_at: DateTime<Utc>,
    ) -> Result<CaptureRecord, CaptureError> {
        let response = flow.response.as_ref().ok_or(CaptureError::MissingResponse)?;

        if flow.method.is_empty() {
            return Err(CaptureError::MissingField("method"));
        }
        http::Method::from_bytes(flow.method.as_bytes())
            .map_err(|_| CaptureError::InvalidMethod(flow.method.clone()))?;
        http::StatusCode::from_u16(response.status)
            .map_err(|_| CaptureError::InvalidStatus(response.status))?;
        if flow.path.is_empty() {
            return Err(CaptureError::MissingField("path"));
        }

        Ok(CaptureRecord {
            method: flow.method.clone(),
            path_template: path_template(&flow.path_segments()),
            original_path: flow.path.clone(),
            status: response.status,
            response_body: parse_body(&response.body),
            request_body: parse_body(&flow.request_body),
            request_headers: header_map(&flow.request_headers),
            response_headers: header_map(&response.headers),
            query_params: query_params(flow.query_string()),
            response_time_ms: response_time_ms(request_seen_at, response_seen_at),
            host: flow.host.clone(),
            full_url: flow.url.clone(),
            description: format!("Captured via {} from {}", self.source_tag, flow.host),
            captured_at: Utc::now().to_rfc3339(),
        })
    }
}

/// 判断路径段是否为 ID（纯数字，或 36 字符且含 4 个连字符）
pub fn is_id_segment(segment: &str) -> bool {
    let all_digits = !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit());
    let uuid_like = segment.chars().count() == UUID_LEN
        && segment.matches('-').count() == UUID_HYPHENS;
    all_digits || uuid_like
}

/// 生成路径模板
pub fn path_template(segments: &[String]) -> String {
    let parts: Vec<&str> = segments
        .iter()
        .map(|s| if is_id_segment(s) { ID_PLACEHOLDER } else { s.as_str() })
        .collect();
    format!("/{}", parts.join("/"))
}

/// 解析 body
///
/// 空 body 为 null；合法 JSON 原样保留；否则按 UTF-8 解码（非法字节替换）并截断
pub fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return value;
    }
    let text = String::from_utf8_lossy(body);
    Value::String(truncate_with_marker(&text, MAX_BODY_CHARS))
}

/// header 列表转为有序映射
///
/// 重复 key（大小写敏感）后者覆盖前者，位置保持首次出现处
pub fn header_map(headers: &[(String, String)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(name.clone(), Value::String(value.clone()));
    }
    map
}

/// 解析 query string，重复 key 保留第一个值
pub fn query_params(query: Option<&str>) -> Map<String, Value> {
    let mut map = Map::new();
    let Some(query) = query else {
        return map;
    };

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_form_component(key);
        if !map.contains_key(&key) {
            map.insert(key, Value::String(decode_form_component(value)));
        }
    }
    map
}

/// 解码 application/x-www-form-urlencoded 分量（`+` 视为空格）
fn decode_form_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// 计算响应耗时（毫秒，四舍五入）
///
/// 没有请求时间戳时返回 0；时钟回拨导致的负值也记为 0
pub fn response_time_ms(
    request_seen_at: Option<DateTime<Utc>>,
    response_seen_at: DateTime<Utc>,
) -> i64 {
    let Some(start) = request_seen_at else {
        return 0;
    };
    let elapsed = response_seen_at - start;
    match elapsed.num_microseconds() {
        Some(us) => ((us as f64) / 1000.0).round().max(0.0) as i64,
        None => elapsed.num_milliseconds().max(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TRUNCATION_MARKER;
    use crate::model::flow::RawResponse;
    use bytes::Bytes;
    use chrono::Duration;

    fn segments(path: &str) -> Vec<String> {
        RawFlow {
            path: path.to_string(),
            ..Default::default()
        }
        .path_segments()
    }

    fn get_flow(path: &str, status: u16, body: &'static [u8]) -> RawFlow {
        RawFlow {
            id: "flow-1".to_string(),
            method: "GET".to_string(),
            url: format!("https://api.example.com{}", path),
            host: "api.example.com".to_string(),
            path: path.to_string(),
            request_headers: vec![("Accept".to_string(), "application/json".to_string())],
            request_body: Bytes::new(),
            response: Some(RawResponse {
                status,
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                body: Bytes::from_static(body),
            }),
            arrived_at: None,
        }
    }

    #[test]
    fn test_path_template_replaces_numeric_and_uuid_segments() {
        let path = "/users/482/orders/8f14e45f-ceea-4abc-a2b9-9a6d1b4e9a1f";
        assert_eq!(path_template(&segments(path)), "/users/{id}/orders/{id}");
    }

    #[test]
    fn test_path_template_keeps_other_segments() {
        assert_eq!(path_template(&segments("/v2/users/me")), "/v2/users/me");
        assert_eq!(path_template(&segments("/")), "/");
    }

    #[test]
    fn test_path_template_uuid_heuristic_is_permissive() {
        // 36 字符、4 个连字符，但不是合法十六进制
        let odd = "zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz";
        assert!(is_id_segment(odd));
        // 连字符数量不对
        assert!(!is_id_segment("zzzzzzzz-zzzz-zzzz-zzzzzzzzzzzzzzzzz"));
        assert!(!is_id_segment("12a"));
        assert!(!is_id_segment(""));
    }

    #[test]
    fn test_path_template_ignores_query() {
        assert_eq!(path_template(&segments("/items/7?expand=true")), "/items/{id}");
    }

    #[test]
    fn test_parse_body_json() {
        let value = parse_body(br#"{"ok":true,"items":[1,2,{"n":null}]}"#);
        assert_eq!(value, serde_json::json!({"ok": true, "items": [1, 2, {"n": null}]}));
    }

    #[test]
    fn test_parse_body_keeps_large_numbers_exact() {
        let body = br#"{"id":123456789012345678901234567890,"price":0.10000000000000000001}"#;
        let value = parse_body(body);
        assert_eq!(value["id"].to_string(), "123456789012345678901234567890");
        assert_eq!(value["price"].to_string(), "0.10000000000000000001");
        assert_eq!(serde_json::to_vec(&value).unwrap(), body.to_vec());
    }

    #[test]
    fn test_parse_body_empty_is_null() {
        assert_eq!(parse_body(b""), Value::Null);
    }

    #[test]
    fn test_parse_body_text_fallback() {
        assert_eq!(parse_body(b"<html>hi</html>"), Value::String("<html>hi</html>".into()));
    }

    #[test]
    fn test_parse_body_invalid_utf8_is_replaced() {
        let value = parse_body(&[b'o', b'k', 0xff]);
        assert_eq!(value, Value::String("ok\u{fffd}".into()));
    }

    #[test]
    fn test_parse_body_truncates_long_text() {
        let body = "x".repeat(MAX_BODY_CHARS + 500);
        let Value::String(text) = parse_body(body.as_bytes()) else {
            panic!("expected text body");
        };
        assert_eq!(text.chars().count(), MAX_BODY_CHARS + TRUNCATION_MARKER.len());
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_header_map_last_wins_keeps_case() {
        let headers = vec![
            ("Set-Cookie".to_string(), "a=1".to_string()),
            ("X-Trace".to_string(), "t".to_string()),
            ("Set-Cookie".to_string(), "b=2".to_string()),
            ("set-cookie".to_string(), "c=3".to_string()),
        ];
        let map = header_map(&headers);
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec!["Set-Cookie", "X-Trace", "set-cookie"]);
        assert_eq!(map["Set-Cookie"], "b=2");
    }

    #[test]
    fn test_query_params_first_wins_and_decodes() {
        let map = query_params(Some("q=hello+world&tag=a&tag=b&empty&x=%2Fy"));
        assert_eq!(map["q"], "hello world");
        assert_eq!(map["tag"], "a");
        assert_eq!(map["empty"], "");
        assert_eq!(map["x"], "/y");
        assert!(query_params(None).is_empty());
    }

    #[test]
    fn test_response_time_ms() {
        let start = Utc::now();
        assert_eq!(response_time_ms(Some(start), start + Duration::milliseconds(120)), 120);
        assert_eq!(response_time_ms(Some(start), start + Duration::microseconds(1_600)), 2);
        assert_eq!(response_time_ms(None, start), 0);
        assert_eq!(response_time_ms(Some(start), start - Duration::seconds(1)), 0);
    }

    #[test]
    fn test_normalize_full_record() {
        let normalizer = Normalizer::new("mitmproxy");
        let start = Utc::now();
        let flow = get_flow("/items/42?verbose=1", 200, br#"{"ok":true}"#);

        let record = normalizer
            .normalize(&flow, Some(start), start + Duration::milliseconds(120))
            .unwrap();

        assert_eq!(record.method, "GET");
        assert_eq!(record.path_template, "/items/{id}");
        assert_eq!(record.original_path, "/items/42?verbose=1");
        assert_eq!(record.status, 200);
        assert_eq!(record.response_body, serde_json::json!({"ok": true}));
        assert_eq!(record.request_body, Value::Null);
        assert_eq!(record.response_time_ms, 120);
        assert_eq!(record.query_params["verbose"], "1");
        assert_eq!(record.request_headers["Accept"], "application/json");
        assert_eq!(record.description, "Captured via mitmproxy from api.example.com");
        assert!(DateTime::parse_from_rfc3339(&record.captured_at).is_ok());
    }

    #[test]
    fn test_normalize_without_response_fails() {
        let normalizer = Normalizer::new("mitmproxy");
        let mut flow = get_flow("/items/1", 200, b"");
        flow.response = None;

        assert_eq!(
            normalizer.normalize(&flow, None, Utc::now()),
            Err(CaptureError::MissingResponse)
        );
    }

    #[test]
    fn test_normalize_rejects_bad_fields() {
        let normalizer = Normalizer::new("mitmproxy");

        let mut flow = get_flow("/items/1", 200, b"");
        flow.method = String::new();
        assert_eq!(
            normalizer.normalize(&flow, None, Utc::now()),
            Err(CaptureError::MissingField("method"))
        );

        let mut flow = get_flow("/items/1", 200, b"");
        flow.method = "GE T".to_string();
        assert!(matches!(
            normalizer.normalize(&flow, None, Utc::now()),
            Err(CaptureError::InvalidMethod(_))
        ));

        let flow = get_flow("/items/1", 42, b"");
        assert_eq!(
            normalizer.normalize(&flow, None, Utc::now()),
            Err(CaptureError::InvalidStatus(42))
        );
    }
}
