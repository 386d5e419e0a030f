use super::{websocket, MessageSplitter, SplitResult};
use crate::buffer::ByteAccumulator;
use crate::session::SessionHandle;

/// 会话属性: 置位后表示该会话已完成 WebSocket 升级,
/// 后续字节按 WebSocket 帧而不是 HTTP 报文分割
pub const WEBSOCKET_MODE_ATTR: &str = "websocket.upgraded";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// HTTP 报文分割器
///
/// 完整条件: 头部终止符已出现, 且满足以下之一:
/// Content-Length 指示的字节已到齐 / chunked 的零长终止块已到 /
/// multipart 关闭边界已到 / 没有任何指示报文体的头 (视为无体报文)。
///
/// 无体启发式按原始行为保留: 不对 TRACE/CONNECT 做更严格的 RFC 推断。
pub struct HttpSplitter;

impl MessageSplitter for HttpSplitter {
    fn can_split(&self, session: &SessionHandle, accumulated: &ByteAccumulator) -> SplitResult {
        // 升级后的会话切换为 WebSocket 帧规则
        if session.get_attribute::<bool>(WEBSOCKET_MODE_ATTR).unwrap_or(false) {
            return websocket::frame_length(accumulated.peek());
        }
        http_frame_length(accumulated.peek())
    }
}

fn http_frame_length(buf: &[u8]) -> SplitResult {
    if buf.is_empty() {
        return SplitResult::Incomplete;
    }

    let header_end = match find(buf, HEADER_TERMINATOR) {
        Some(index) => index + HEADER_TERMINATOR.len(),
        None => {
            // 首行已完整但不是 HTTP 起始行的, 直接判违规
            if let Some(line_end) = find(buf, b"\r\n") {
                if !is_http_start_line(&buf[..line_end]) {
                    return SplitResult::Invalid;
                }
            }
            return SplitResult::Incomplete;
        }
    };

    let head = &buf[..header_end];
    if let Some(line_end) = find(head, b"\r\n") {
        if !is_http_start_line(&head[..line_end]) {
            return SplitResult::Invalid;
        }
    }

    if let Some(value) = header_value(head, "content-length") {
        let content_length: usize = match value.trim().parse() {
            Ok(n) => n,
            Err(_) => return SplitResult::Invalid,
        };
        let total = header_end + content_length;
        return if buf.len() >= total {
            SplitResult::Frame(total)
        } else {
            SplitResult::Incomplete
        };
    }

    if header_value(head, "transfer-encoding")
        .map(|value| value.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        // 终止块 "0\r\n\r\n" 到达即完整
        return match find(&buf[header_end..], b"0\r\n\r\n") {
            Some(index) => SplitResult::Frame(header_end + index + 5),
            None => SplitResult::Incomplete,
        };
    }

    if let Some(content_type) = header_value(head, "content-type") {
        let lowered = content_type.to_ascii_lowercase();
        if lowered.contains("multipart") {
            let boundary = match lowered
                .split("boundary=")
                .nth(1)
                .map(|rest| rest.split(';').next().unwrap_or(rest).trim().to_string())
            {
                Some(b) if !b.is_empty() => b,
                _ => return SplitResult::Invalid,
            };
            let mut closing = Vec::with_capacity(boundary.len() + 4);
            closing.extend_from_slice(b"--");
            closing.extend_from_slice(boundary.as_bytes());
            closing.extend_from_slice(b"--");
            return match find(&buf[header_end..], &closing) {
                Some(index) => {
                    let mut end = header_end + index + closing.len();
                    // 关闭边界后的 CRLF 也属于本帧
                    if buf.len() >= end + 2 && &buf[end..end + 2] == b"\r\n" {
                        end += 2;
                    }
                    SplitResult::Frame(end)
                }
                None => SplitResult::Incomplete,
            };
        }
    }

    // 无任何报文体指示头: 无体报文, 头部即整帧
    SplitResult::Frame(header_end)
}

fn is_http_start_line(line: &[u8]) -> bool {
    // 请求行以 "HTTP/x.y" 结尾, 状态行以它开头
    let line = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(_) => return false,
    };
    line.starts_with("HTTP/") || line.rsplit(' ').next().map(|tail| tail.starts_with("HTTP/")).unwrap_or(false)
}

fn header_value(head: &[u8], name: &str) -> Option<String> {
    let text = std::str::from_utf8(head).ok()?;
    for line in text.split("\r\n").skip(1) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim().to_string());
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
