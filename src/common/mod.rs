//! 公共工具模块

pub mod auth;

/// 截断到不超过 `max_bytes` 字节，并在截断时追加 `...`
///
/// 按字符边界截断，不会切开多字节字符。
pub fn truncate_with_ellipsis(s: &str, max_bytes: usize) -> String {
    const ELLIPSIS: &str = "...";
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let budget = max_bytes.saturating_sub(ELLIPSIS.len());
    let end = s
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= budget)
        .last()
        .unwrap_or(0);
    format!("{}{}", &s[..end], ELLIPSIS)
}
