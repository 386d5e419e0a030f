//! 完成式驱动
//!
//! 连接拆成读写两半: 读循环每次完成后立即重新发起下一次读,
//! 写执行器逐个消费写队列, 一次 write_all 即一次完成事件。
//! 事件序列与就绪式驱动完全一致。

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{finish, flush_close_notify, prepare_write, IoDriver, SessionParts};
use crate::dispatcher::{EventDispatcher, SessionEvent};
use crate::error::TransportError;
use crate::session::{SessionHandle, WriteItem};
use crate::tls::TlsEngine;

pub(crate) struct CompletionDriver;

#[async_trait]
impl IoDriver for CompletionDriver {
    async fn drive(&self, stream: TcpStream, parts: SessionParts) {
        let SessionParts {
            session,
            writes,
            mut pipeline,
            tls,
            dispatcher,
            read_buffer_size,
        } = parts;
        let (mut reader, writer) = stream.into_split();

        if let Err(error) = pipeline.begin() {
            finish(&session, &dispatcher, Some(error));
            return;
        }

        let writer_task = tokio::spawn(write_executor(
            writer,
            writes,
            tls.clone(),
            session.clone(),
            dispatcher.clone(),
        ));

        let mut read_failure: Option<TransportError> = None;
        let mut buffer = BytesMut::with_capacity(read_buffer_size);
        loop {
            tokio::select! {
                _ = session.close_requested() => break,
                completed = reader.read_buf(&mut buffer) => {
                    match completed {
                        Ok(0) => {
                            read_failure = Some(TransportError::RemoteDisconnect);
                            break;
                        }
                        Ok(_) => {
                            let data = buffer.split().freeze();
                            if let Err(error) = pipeline.ingest(&data) {
                                read_failure = Some(error);
                                break;
                            }
                        }
                        Err(error) => {
                            read_failure = Some(TransportError::from_io(&error));
                            break;
                        }
                    }
                }
            }
        }

        // 叫停写执行器并等它退出, 避免关闭后还有在途写
        session.begin_close();
        let write_failure = writer_task.await.ok().flatten();
        finish(&session, &dispatcher, read_failure.or(write_failure));
    }
}

/// 写执行器: 完成一个写操作才发起下一个, 发送顺序即入队顺序
async fn write_executor(
    mut writer: OwnedWriteHalf,
    mut writes: mpsc::UnboundedReceiver<WriteItem>,
    tls: Option<Arc<Mutex<TlsEngine>>>,
    session: SessionHandle,
    dispatcher: EventDispatcher,
) -> Option<TransportError> {
    let failure = loop {
        tokio::select! {
            _ = session.close_requested() => break None,
            item = writes.recv() => {
                let Some(item) = item else { break None };
                let (bytes, origin) = match prepare_write(&tls, item) {
                    Ok(prepared) => prepared,
                    Err(error) => break Some(error),
                };
                if bytes.is_empty() {
                    if let Some(origin) = origin {
                        dispatcher.dispatch(&session, SessionEvent::Sent(origin));
                    }
                    continue;
                }
                if let Err(error) = writer.write_all(&bytes).await {
                    break Some(TransportError::from_io(&error));
                }
                session.touch();
                if let Some(origin) = origin {
                    dispatcher.dispatch(&session, SessionEvent::Sent(origin));
                }
            }
        }
    };

    if failure.is_none() {
        if let Some(notify) = flush_close_notify(&tls) {
            let _ = writer.write_all(&notify).await;
        }
        let _ = writer.shutdown().await;
    } else {
        // 写路径失败要把整条会话拉下来, 读循环靠关闭请求退出
        session.begin_close();
    }
    failure
}
