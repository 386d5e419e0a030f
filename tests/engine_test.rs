//! 端到端回环测试
//!
//! 同一组场景分别跑在就绪式和完成式驱动上, 验证两者对外的
//! 事件序列一致; 另覆盖粘包拆分、关闭折叠、空闲检测和 TLS 会话。

use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use evsock::handler::Handler;
use evsock::session::SessionHandle;
use evsock::{
    EngineConfig, EngineContext, FilterChain, LineSplitter, Message, ReactorModel, SocketClient,
    SocketServer, StringFilter, TlsConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// 回显服务端
struct Echo;

impl Handler for Echo {
    fn on_receive(&self, _session: &SessionHandle, message: Message) -> Option<Message> {
        Some(message)
    }
}

/// 把生命周期事件串成字符串流水
struct Collector {
    tx: mpsc::UnboundedSender<String>,
}

impl Handler for Collector {
    fn on_connect(&self, _session: &SessionHandle) -> Option<Message> {
        let _ = self.tx.send("connect".to_string());
        None
    }

    fn on_receive(&self, _session: &SessionHandle, message: Message) -> Option<Message> {
        let text = match &message {
            Message::Text(text) => text.trim_end().to_string(),
            Message::Bytes(bytes) => String::from_utf8_lossy(bytes).trim_end().to_string(),
            Message::Json(value) => value.to_string(),
        };
        let _ = self.tx.send(format!("recv:{}", text));
        None
    }

    fn on_disconnect(&self, _session: &SessionHandle) {
        let _ = self.tx.send("disconnect".to_string());
    }

    fn on_idle(&self, _session: &SessionHandle) {
        let _ = self.tx.send("idle".to_string());
    }
}

async fn wait_addr(server: &SocketServer) -> std::net::SocketAddr {
    for _ in 0..200 {
        if let Some(addr) = server.local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not bind in time");
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended early")
}

fn spawn_echo_server(model: ReactorModel, tls: Option<TlsConfig>) -> Arc<SocketServer> {
    let mut config = EngineConfig::default()
        .with_reactor(model)
        .with_tick(16, Duration::from_millis(20));
    if let Some(tls) = tls {
        config = config.with_tls(tls);
    }
    let server = Arc::new(
        SocketServer::builder()
            .bind("127.0.0.1:0")
            .context(EngineContext::new(config))
            .handler(Echo)
            .filter_chain(FilterChain::new().with(StringFilter))
            .splitter(|| LineSplitter)
            .build()
            .unwrap(),
    );
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    server
}

/// 完整的回显流水: 连接, 发两帧, 收两帧, 关闭
async fn run_echo(model: ReactorModel, tls: Option<(TlsConfig, TlsConfig)>) -> Vec<String> {
    let (server_tls, client_tls) = match tls {
        Some((server_tls, client_tls)) => (Some(server_tls), Some(client_tls)),
        None => (None, None),
    };
    let server = spawn_echo_server(model, server_tls);
    let addr = wait_addr(&server).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client_config = EngineConfig::default().with_reactor(model);
    if let Some(tls) = client_tls {
        client_config = client_config.with_tls(tls);
    }
    let client = SocketClient::builder()
        .context(EngineContext::new(client_config))
        .handler(Collector { tx })
        .filter_chain(FilterChain::new().with(StringFilter))
        .splitter(|| LineSplitter)
        .server_name("localhost")
        .build()
        .unwrap();
    let session = client.connect(&addr.to_string()).await.unwrap();

    session.send(Message::text("alpha\n")).unwrap();
    session.send(Message::text("beta\n")).unwrap();

    let mut events: Vec<String> = Vec::new();
    while events.iter().filter(|event| event.starts_with("recv")).count() < 2 {
        events.push(next_event(&mut rx).await);
    }
    session.close();
    while events.last().map(String::as_str) != Some("disconnect") {
        events.push(next_event(&mut rx).await);
    }
    server.shutdown();
    events
}

#[tokio::test]
async fn test_echo_roundtrip_readiness() {
    init_tracing();
    let events = run_echo(ReactorModel::Readiness, None).await;
    assert_eq!(events, vec!["connect", "recv:alpha", "recv:beta", "disconnect"]);
}

#[tokio::test]
async fn test_echo_roundtrip_completion() {
    init_tracing();
    let events = run_echo(ReactorModel::Completion, None).await;
    assert_eq!(events, vec!["connect", "recv:alpha", "recv:beta", "disconnect"]);
}

/// 两种驱动对同一场景必须产出相同的事件序列
#[tokio::test]
async fn test_reactor_models_emit_identical_sequences() {
    init_tracing();
    let readiness = run_echo(ReactorModel::Readiness, None).await;
    let completion = run_echo(ReactorModel::Completion, None).await;
    assert_eq!(readiness, completion);
}

/// 单次写入带来两帧, 必须按顺序触发两次 on_receive
#[tokio::test]
async fn test_two_frames_in_one_write() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Arc::new(
        SocketServer::builder()
            .bind("127.0.0.1:0")
            .context(EngineContext::new(
                EngineConfig::default().with_tick(16, Duration::from_millis(20)),
            ))
            .handler(Collector { tx })
            .splitter(|| LineSplitter)
            .build()
            .unwrap(),
    );
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    let addr = wait_addr(&server).await;

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    raw.write_all(b"a\nb\n").await.unwrap();

    assert_eq!(next_event(&mut rx).await, "connect");
    assert_eq!(next_event(&mut rx).await, "recv:a");
    assert_eq!(next_event(&mut rx).await, "recv:b");
    server.shutdown();
}

/// 双方同时发起关闭, on_disconnect 仍然恰好一次
#[tokio::test]
async fn test_concurrent_close_collapses_to_one_disconnect() {
    init_tracing();

    struct ClosingEcho {
        disconnects: Arc<AtomicUsize>,
    }

    impl Handler for ClosingEcho {
        fn on_receive(&self, session: &SessionHandle, _message: Message) -> Option<Message> {
            session.close();
            None
        }

        fn on_disconnect(&self, _session: &SessionHandle) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    let disconnects = Arc::new(AtomicUsize::new(0));
    let server = Arc::new(
        SocketServer::builder()
            .bind("127.0.0.1:0")
            .context(EngineContext::new(
                EngineConfig::default().with_tick(16, Duration::from_millis(20)),
            ))
            .handler(ClosingEcho { disconnects: disconnects.clone() })
            .splitter(|| LineSplitter)
            .build()
            .unwrap(),
    );
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    let addr = wait_addr(&server).await;

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    raw.write_all(b"bye\n").await.unwrap();
    // 服务端 Handler 关闭的同时对端也断开
    drop(raw);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while disconnects.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // 留出重复派发的窗口再断言
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    server.shutdown();
}

/// 静默连接触发 on_idle
#[tokio::test]
async fn test_idle_probe_fires_for_silent_session() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Arc::new(
        SocketServer::builder()
            .bind("127.0.0.1:0")
            .context(EngineContext::new(
                EngineConfig::default()
                    .with_tick(16, Duration::from_millis(20))
                    .with_idle_interval(Duration::from_millis(80)),
            ))
            .handler(Collector { tx })
            .splitter(|| LineSplitter)
            .build()
            .unwrap(),
    );
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    let addr = wait_addr(&server).await;

    let _raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    assert_eq!(next_event(&mut rx).await, "connect");
    assert_eq!(next_event(&mut rx).await, "idle");
    server.shutdown();
}

/// 生成自签证书并落盘, 返回 (证书路径, 私钥路径)
fn write_self_signed(tag: &str) -> (PathBuf, PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("evsock-e2e-{}-{}.crt", tag, std::process::id()));
    let key_path = dir.join(format!("evsock-e2e-{}-{}.key", tag, std::process::id()));
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

/// TLS 会话: Connected 在握手完成后触发, 之后的收发与明文一致
#[tokio::test]
async fn test_tls_echo_roundtrip() {
    init_tracing();
    let (cert_path, key_path) = write_self_signed("echo");
    let server_tls = TlsConfig::new(&cert_path, &key_path);
    let client_tls = TlsConfig::trust_only(&cert_path);
    let events = run_echo(ReactorModel::Readiness, Some((server_tls, client_tls))).await;
    assert_eq!(events, vec!["connect", "recv:alpha", "recv:beta", "disconnect"]);
}

#[tokio::test]
async fn test_tls_echo_roundtrip_completion() {
    init_tracing();
    let (cert_path, key_path) = write_self_signed("echo-c");
    let server_tls = TlsConfig::new(&cert_path, &key_path);
    let client_tls = TlsConfig::trust_only(&cert_path);
    let events = run_echo(ReactorModel::Completion, Some((server_tls, client_tls))).await;
    assert_eq!(events, vec!["connect", "recv:alpha", "recv:beta", "disconnect"]);
}
