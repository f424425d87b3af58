//! 公共工具模块

/// 文本截断后追加的标记
pub const TRUNCATION_MARKER: &str = "... (truncated)";

/// 按字符数安全地截断字符串，不会在多字节字符中间截断
///
/// 返回不超过 `max_chars` 个字符的前缀
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

/// 超过 `max_chars` 个字符时截断并追加 [`TRUNCATION_MARKER`]
pub fn truncate_with_marker(s: &str, max_chars: usize) -> String {
    let truncated = truncate_chars(s, max_chars);
    if truncated.len() == s.len() {
        return s.to_string();
    }
    format!("{}{}", truncated, TRUNCATION_MARKER)
}
