/// 过滤链: 线路字节与应用对象之间的对称编解码管道
///
/// encode 按链序应用, decode 按逆序应用, 因此同一条链天然满足
/// `decode(encode(o)) == o` (除非某个过滤器声明自己有损)。
mod json;
mod string;

pub use json::JsonFilter;
pub use string::StringFilter;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;
use crate::session::SessionHandle;

/// 流经过滤链的应用对象
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// 原始字节, 编码方向的终点
    Bytes(Bytes),
    /// UTF-8 文本
    Text(String),
    /// 结构化 JSON 值
    Json(serde_json::Value),
}

impl Message {
    pub fn text(value: impl Into<String>) -> Self {
        Message::Text(value.into())
    }

    pub fn bytes(value: impl Into<Bytes>) -> Self {
        Message::Bytes(value.into())
    }

    /// 编码结束后取出线路字节, 非字节形态说明链配置有误
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Message::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// 双向编解码过滤器
///
/// 返回 `None` 表示中止整条链, 会话按协议违规处理;
/// 不属于自己的对象类型应原样返回。
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, session: &SessionHandle, message: Message) -> Option<Message>;

    fn decode(&self, session: &SessionHandle, message: Message) -> Option<Message>;
}

/// 有序过滤器集合
///
/// 不变式: encode 正序, decode 逆序, 保证后编码的先解码。
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self { filters: Vec::new() }
    }

    /// 链式追加过滤器
    pub fn with(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn add(&mut self, filter: impl Filter + 'static) {
        self.filters.push(Arc::new(filter));
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// 按链序编码到线路字节
    pub fn encode(&self, session: &SessionHandle, message: Message) -> Result<Bytes, TransportError> {
        let mut current = message;
        for filter in &self.filters {
            current = filter.encode(session, current).ok_or_else(|| {
                TransportError::protocol(format!("filter '{}' aborted encode", filter.name()))
            })?;
        }
        current
            .into_bytes()
            .ok_or_else(|| TransportError::protocol("encode did not produce wire bytes"))
    }

    /// 按逆序解码线路帧
    pub fn decode(&self, session: &SessionHandle, frame: Bytes) -> Result<Message, TransportError> {
        let mut current = Message::Bytes(frame);
        for filter in self.filters.iter().rev() {
            current = filter.decode(session, current).ok_or_else(|| {
                TransportError::protocol(format!("filter '{}' aborted decode", filter.name()))
            })?;
        }
        Ok(current)
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.filters.iter().map(|filter| filter.name()).collect();
        f.debug_tuple("FilterChain").field(&names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> FilterChain {
        // 编码方向: Json -> Text -> Bytes
        FilterChain::new().with(JsonFilter).with(StringFilter)
    }

    #[test]
    fn test_round_trip_law() {
        let session = SessionHandle::detached();
        let chain = chain();
        let original = Message::Json(serde_json::json!({"cmd": "ping", "seq": 42}));

        let wire = chain.encode(&session, original.clone()).unwrap();
        let decoded = chain.decode(&session, wire).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_text_round_trip_through_string_filter() {
        let session = SessionHandle::detached();
        let chain = FilterChain::new().with(StringFilter);
        let original = Message::text("你好, evsock");

        let wire = chain.encode(&session, original.clone()).unwrap();
        let decoded = chain.decode(&session, wire).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_abort_surfaces_protocol_violation() {
        let session = SessionHandle::detached();
        let chain = FilterChain::new().with(StringFilter);
        // 非法 UTF-8 让 StringFilter 中止解码
        let err = chain
            .decode(&session, Bytes::from_static(&[0xff, 0xfe, 0xfd]))
            .unwrap_err();
        assert_eq!(err.error_code(), "PROTOCOL_VIOLATION");
    }

    #[test]
    fn test_empty_chain_passes_bytes_through() {
        let session = SessionHandle::detached();
        let chain = FilterChain::new();
        let wire = chain
            .encode(&session, Message::bytes(&b"raw"[..]))
            .unwrap();
        assert_eq!(&wire[..], b"raw");
        let decoded = chain.decode(&session, wire).unwrap();
        assert_eq!(decoded, Message::bytes(&b"raw"[..]));
    }
}
