use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::TransportError;

/// TLS 配置
///
/// 证书与私钥使用 PEM 文件; `trust_store_path` 在服务端表示要求并校验
/// 客户端证书 (双向认证), 在客户端表示信任的根证书。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// 协议名标签, 仅用于日志; 具体版本协商交给 rustls
    pub protocol: String,
    pub trust_store_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
            protocol: "TLS".to_string(),
            trust_store_path: None,
        }
    }

    /// 仅配置信任根的客户端形态
    pub fn trust_only(trust_store_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: None,
            key_path: None,
            protocol: "TLS".to_string(),
            trust_store_path: Some(trust_store_path.into()),
        }
    }

    pub fn with_trust_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_store_path = Some(path.into());
        self
    }
}

/// 握手状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// 尚未交换任何握手记录
    NeedHandshake,
    /// 握手中, 引擎有待发出的记录
    Wrap,
    /// 握手中, 等待对端的记录
    Unwrap,
    /// 握手完成, 双向加解密就绪
    Complete,
    /// 收到或发出了 close_notify
    Closed,
}

/// TLS 握手引擎
///
/// 让加密传输在会话看来与明文完全一致: 入站密文在进入分割器之前解包,
/// 出站明文在入队写之前封包; 握手期间的记录缓冲与应用帧同样按部分读处理
/// (由 rustls 内部完成)。
pub struct TlsEngine {
    conn: Connection,
    started: bool,
    closed: bool,
}

impl TlsEngine {
    /// 服务端引擎
    pub fn server(config: &TlsConfig) -> Result<Self, TransportError> {
        let cert_path = config
            .cert_path
            .as_deref()
            .ok_or_else(|| TransportError::configuration("cert_path", "required for server TLS"))?;
        let key_path = config
            .key_path
            .as_deref()
            .ok_or_else(|| TransportError::configuration("key_path", "required for server TLS"))?;
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let server_config = match &config.trust_store_path {
            Some(trust) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(trust)? {
                    roots
                        .add(cert)
                        .map_err(|error| TransportError::configuration("trust_store_path", error.to_string()))?;
                }
                let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|error| TransportError::configuration("trust_store_path", error.to_string()))?;
                ServerConfig::builder()
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
            None => ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key),
        }
        .map_err(|error| TransportError::configuration("cert_path", error.to_string()))?;

        let conn = ServerConnection::new(Arc::new(server_config))
            .map_err(|error| TransportError::handshake(error.to_string()))?;
        Ok(Self { conn: Connection::Server(conn), started: false, closed: false })
    }

    /// 客户端引擎, `server_name` 用于 SNI 与证书校验
    pub fn client(config: &TlsConfig, server_name: &str) -> Result<Self, TransportError> {
        let mut roots = RootCertStore::empty();
        if let Some(trust) = &config.trust_store_path {
            for cert in load_certs(trust)? {
                roots
                    .add(cert)
                    .map_err(|error| TransportError::configuration("trust_store_path", error.to_string()))?;
            }
        }
        let builder = ClientConfig::builder().with_root_certificates(roots);
        let client_config = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|error| TransportError::configuration("cert_path", error.to_string()))?,
            _ => builder.with_no_client_auth(),
        };

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|error| TransportError::configuration("server_name", error.to_string()))?;
        let conn = ClientConnection::new(Arc::new(client_config), name)
            .map_err(|error| TransportError::handshake(error.to_string()))?;
        Ok(Self { conn: Connection::Client(conn), started: false, closed: false })
    }

    pub fn state(&self) -> HandshakeState {
        if self.closed {
            return HandshakeState::Closed;
        }
        if self.conn.is_handshaking() {
            if !self.started {
                return HandshakeState::NeedHandshake;
            }
            if self.conn.wants_write() {
                return HandshakeState::Wrap;
            }
            return HandshakeState::Unwrap;
        }
        HandshakeState::Complete
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// 喂入入站密文, 返回当前可读的明文
    ///
    /// 握手期间明文为空, 引擎自产的握手记录通过 `take_outbound` 取出。
    pub fn unwrap_inbound(&mut self, mut data: &[u8]) -> Result<Bytes, TransportError> {
        self.started = true;
        while !data.is_empty() {
            let consumed = self
                .conn
                .read_tls(&mut data)
                .map_err(|error| TransportError::transport(error.to_string()))?;
            if consumed == 0 {
                break;
            }
            let handshaking = self.conn.is_handshaking();
            self.conn.process_new_packets().map_err(|error| {
                if handshaking {
                    TransportError::handshake(error.to_string())
                } else {
                    TransportError::protocol(format!("TLS record error: {}", error))
                }
            })?;
        }

        let mut plain = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => plain.extend_from_slice(&chunk[..n]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(TransportError::transport(error.to_string())),
            }
        }
        Ok(Bytes::from(plain))
    }

    /// 封包出站明文, 返回要写到传输上的密文
    ///
    /// 握手未完成时明文由 rustls 暂存, 握手完成后随首批记录发出。
    pub fn wrap_outbound(&mut self, plain: &[u8]) -> Result<Bytes, TransportError> {
        use std::io::Write;
        self.conn
            .writer()
            .write_all(plain)
            .map_err(|error| TransportError::transport(error.to_string()))?;
        self.take_outbound()
    }

    /// 取出引擎积压的全部出站记录 (握手或应用数据)
    pub fn take_outbound(&mut self) -> Result<Bytes, TransportError> {
        self.started = true;
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut out)
                .map_err(|error| TransportError::transport(error.to_string()))?;
        }
        Ok(Bytes::from(out))
    }

    /// 发送 close_notify, 之后引擎进入 Closed
    pub fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
        self.closed = true;
    }
}

// rustls 的 Connection 不带 Debug, 只打印握手状态
impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("state", &self.state())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|error| TransportError::configuration("cert_path", format!("{}: {}", path.display(), error)))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|error| TransportError::configuration("cert_path", error.to_string()))?;
    if certs.is_empty() {
        return Err(TransportError::configuration(
            "cert_path",
            format!("no certificate found in {}", path.display()),
        ));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|error| TransportError::configuration("key_path", format!("{}: {}", path.display(), error)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|error| TransportError::configuration("key_path", error.to_string()))?
        .ok_or_else(|| {
            TransportError::configuration("key_path", format!("no private key found in {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    /// 生成自签证书并落盘, 返回 (证书路径, 私钥路径)
    fn write_self_signed(tag: &str) -> (PathBuf, PathBuf) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("evsock-test-{}-{}.crt", tag, std::process::id()));
        let key_path = dir.join(format!("evsock-test-{}-{}.key", tag, std::process::id()));
        File::create(&cert_path)
            .unwrap()
            .write_all(certified.cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();
        (cert_path, key_path)
    }

    /// 在内存里互相泵送记录直到双方握手完成
    fn pump_handshake(client: &mut TlsEngine, server: &mut TlsEngine) {
        for _ in 0..16 {
            if !client.is_handshaking() && !server.is_handshaking() {
                return;
            }
            let to_server = client.take_outbound().unwrap();
            if !to_server.is_empty() {
                server.unwrap_inbound(&to_server).unwrap();
            }
            let to_client = server.take_outbound().unwrap();
            if !to_client.is_empty() {
                client.unwrap_inbound(&to_client).unwrap();
            }
        }
        panic!("handshake did not converge");
    }

    #[test]
    fn test_handshake_then_both_directions() {
        let (cert_path, key_path) = write_self_signed("hs");
        let server_config = TlsConfig::new(&cert_path, &key_path);
        let client_config = TlsConfig::trust_only(&cert_path);

        let mut server = TlsEngine::server(&server_config).unwrap();
        let mut client = TlsEngine::client(&client_config, "localhost").unwrap();
        assert_eq!(client.state(), HandshakeState::NeedHandshake);

        pump_handshake(&mut client, &mut server);
        assert_eq!(client.state(), HandshakeState::Complete);
        assert_eq!(server.state(), HandshakeState::Complete);

        let to_server = client.wrap_outbound(b"ping over tls").unwrap();
        let plain = server.unwrap_inbound(&to_server).unwrap();
        assert_eq!(&plain[..], b"ping over tls");

        let to_client = server.wrap_outbound(b"pong over tls").unwrap();
        let plain = client.unwrap_inbound(&to_client).unwrap();
        assert_eq!(&plain[..], b"pong over tls");
    }

    #[test]
    fn test_untrusted_server_fails_handshake() {
        let (cert_path, key_path) = write_self_signed("bad");
        let server_config = TlsConfig::new(&cert_path, &key_path);
        // 客户端不信任任何根证书
        let client_config = TlsConfig {
            cert_path: None,
            key_path: None,
            protocol: "TLS".to_string(),
            trust_store_path: None,
        };

        let mut server = TlsEngine::server(&server_config).unwrap();
        let mut client = TlsEngine::client(&client_config, "localhost").unwrap();

        let hello = client.take_outbound().unwrap();
        server.unwrap_inbound(&hello).unwrap();
        let reply = server.take_outbound().unwrap();
        let err = client.unwrap_inbound(&reply).unwrap_err();
        assert_eq!(err.error_code(), "HANDSHAKE_FAILURE");
    }

    #[test]
    fn test_missing_cert_is_configuration_error() {
        let config = TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        let err = TlsEngine::server(&config).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }
}
