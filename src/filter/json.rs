use super::{Filter, Message};
use crate::session::SessionHandle;

/// JSON 过滤器
///
/// 编码方向 Json -> Text, 解码方向 Text -> Json,
/// 通常排在 StringFilter 之前组成 Json <-> 线路字节 的完整链。
pub struct JsonFilter;

impl Filter for JsonFilter {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, _session: &SessionHandle, message: Message) -> Option<Message> {
        match message {
            Message::Json(value) => match serde_json::to_string(&value) {
                Ok(text) => Some(Message::Text(text)),
                Err(_) => None,
            },
            other => Some(other),
        }
    }

    fn decode(&self, _session: &SessionHandle, message: Message) -> Option<Message> {
        match message {
            Message::Text(text) => match serde_json::from_str(&text) {
                Ok(value) => Some(Message::Json(value)),
                Err(_) => None,
            },
            other => Some(other),
        }
    }
}
