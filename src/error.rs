use std::io;

/// 连接关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 正常关闭
    Normal,
    /// 空闲或握手超时
    Timeout,
    /// 错误导致的关闭
    Error(String),
    /// 被强制关闭
    Forced,
}

/// 统一传输错误类型
///
/// 所有会话级错误在会话进入 Closed 之前都会经过 `Handler::on_exception`,
/// 对端正常断开 (`RemoteDisconnect`) 不算错误, 只触发正常关闭流程。
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    /// 对端关闭了连接
    #[error("remote peer closed the connection")]
    RemoteDisconnect,

    /// 协议违规: 分割器返回 Invalid 或过滤器拒绝了报文
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// 帧未完成前缓冲区已超过上限
    #[error("oversized frame: {buffered} bytes buffered, limit {limit}")]
    OversizedFrame { buffered: usize, limit: usize },

    /// TLS 握手失败
    #[error("TLS handshake failure: {reason}")]
    HandshakeFailure { reason: String },

    /// 工作线程池饱和, 提交被拒绝
    #[error("worker pool saturated: {queued} tasks queued, limit {limit}")]
    PoolSaturation { queued: usize, limit: usize },

    /// 底层 I/O 错误, 与协议内容无关
    #[error("transport failure: {reason}")]
    TransportFailure { reason: String },

    /// 配置错误
    #[error("configuration error in field '{field}': {reason}")]
    Configuration { field: String, reason: String },
}

impl TransportError {
    /// 创建协议违规错误
    pub fn protocol(reason: impl Into<String>) -> Self {
        TransportError::ProtocolViolation { reason: reason.into() }
    }

    /// 创建底层传输错误
    pub fn transport(reason: impl Into<String>) -> Self {
        TransportError::TransportFailure { reason: reason.into() }
    }

    /// 创建握手失败错误
    pub fn handshake(reason: impl Into<String>) -> Self {
        TransportError::HandshakeFailure { reason: reason.into() }
    }

    /// 创建配置错误
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        TransportError::Configuration { field: field.into(), reason: reason.into() }
    }

    /// 根据 io::Error 分类: 对端断开归为 RemoteDisconnect, 其余是 TransportFailure
    pub fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportError::RemoteDisconnect,
            _ => TransportError::TransportFailure { reason: error.to_string() },
        }
    }

    /// 是否是对端正常断开
    pub fn is_remote_disconnect(&self) -> bool {
        matches!(self, TransportError::RemoteDisconnect)
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::RemoteDisconnect => "REMOTE_DISCONNECT",
            TransportError::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            TransportError::OversizedFrame { .. } => "OVERSIZED_FRAME",
            TransportError::HandshakeFailure { .. } => "HANDSHAKE_FAILURE",
            TransportError::PoolSaturation { .. } => "POOL_SATURATION",
            TransportError::TransportFailure { .. } => "TRANSPORT_FAILURE",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
        }
    }

    /// 映射为会话关闭原因
    pub fn close_reason(&self) -> CloseReason {
        match self {
            TransportError::RemoteDisconnect => CloseReason::Normal,
            other => CloseReason::Error(other.to_string()),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        TransportError::from_io(&error)
    }
}
