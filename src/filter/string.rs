use bytes::Bytes;

use super::{Filter, Message};
use crate::session::SessionHandle;

/// UTF-8 文本过滤器
///
/// 编码方向 Text -> Bytes, 解码方向 Bytes -> Text。
/// 非法 UTF-8 解码返回 None, 由链层上报协议违规。
pub struct StringFilter;

impl Filter for StringFilter {
    fn name(&self) -> &str {
        "string"
    }

    fn encode(&self, _session: &SessionHandle, message: Message) -> Option<Message> {
        match message {
            Message::Text(text) => Some(Message::Bytes(Bytes::from(text.into_bytes()))),
            other => Some(other),
        }
    }

    fn decode(&self, _session: &SessionHandle, message: Message) -> Option<Message> {
        match message {
            Message::Bytes(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Some(Message::Text(text)),
                Err(_) => None,
            },
            other => Some(other),
        }
    }
}
