//! 响应体解析，区分 SSE 与 JSON，不会 panic

use serde_json::Value;

use crate::token_stats::ResponseType;

#[derive(Debug)]
pub enum ParsedResponse {
    /// SSE 的 data 行（已去掉 `data:` 前缀和 `[DONE]`）
    Sse { data_lines: Vec<String> },
    Json { data: Value },
    /// 空响应体或没有状态码（上游失败、连接中断）
    Empty,
    ParseError {
        error: String,
        response_type: ResponseType,
    },
}

pub struct ResponseParser;

impl ResponseParser {
    pub fn parse(body: &[u8], status: u16, is_sse: bool) -> ParsedResponse {
        if body.is_empty() || status == 0 {
            return ParsedResponse::Empty;
        }
        if is_sse {
            Self::parse_sse(body)
        } else {
            Self::parse_json(body)
        }
    }

    fn parse_sse(body: &[u8]) -> ParsedResponse {
        let text = String::from_utf8_lossy(body);
        let data_lines: Vec<String> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.trim())
            .filter(|data| !data.is_empty() && *data != "[DONE]")
            .map(|data| data.to_string())
            .collect();

        if data_lines.is_empty() {
            return ParsedResponse::ParseError {
                error: "SSE 流不包含有效的 data 行".to_string(),
                response_type: ResponseType::Sse,
            };
        }
        ParsedResponse::Sse { data_lines }
    }

    fn parse_json(body: &[u8]) -> ParsedResponse {
        match serde_json::from_slice::<Value>(body) {
            Ok(data) => ParsedResponse::Json { data },
            Err(e) => ParsedResponse::ParseError {
                error: e.to_string(),
                response_type: ResponseType::Json,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_lines() {
        let body = b"event: message_start\ndata: {\"type\":\"message_start\"}\n\ndata:{\"type\":\"ping\"}\n\ndata: [DONE]\n";
        match ResponseParser::parse(body, 200, true) {
            ParsedResponse::Sse { data_lines } => {
                assert_eq!(data_lines, vec![r#"{"type":"message_start"}"#, r#"{"type":"ping"}"#]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_sse_without_data() {
        assert!(matches!(
            ResponseParser::parse(b"event: ping\n\n", 200, true),
            ParsedResponse::ParseError { response_type: ResponseType::Sse, .. }
        ));
    }

    #[test]
    fn test_json_and_errors() {
        assert!(matches!(
            ResponseParser::parse(br#"{"id":"x"}"#, 200, false),
            ParsedResponse::Json { .. }
        ));
        assert!(matches!(
            ResponseParser::parse(b"{truncated", 200, false),
            ParsedResponse::ParseError { response_type: ResponseType::Json, .. }
        ));
        assert!(matches!(ResponseParser::parse(b"", 200, false), ParsedResponse::Empty));
        assert!(matches!(ResponseParser::parse(b"{}", 0, false), ParsedResponse::Empty));
    }
}
