//! 就绪式驱动
//!
//! 单任务状态机: 等待套接字就绪后用非阻塞 try_read/try_write 搬运字节。
//! 写侧维护显式待写队列, 同一时刻只有一个在途写, 部分写通过偏移续写。

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::Interest;
use tokio::net::TcpStream;

use super::{finish, flush_close_notify, prepare_write, IoDriver, SessionParts};
use crate::dispatcher::SessionEvent;
use crate::error::TransportError;
use crate::filter::Message;
use crate::session::WriteItem;
use crate::tls::TlsEngine;

/// 在途写: 字节、已写偏移、写完后要宣告的应用对象
struct InFlight {
    bytes: Bytes,
    offset: usize,
    origin: Option<Message>,
}

pub(crate) struct ReadinessDriver;

#[async_trait]
impl IoDriver for ReadinessDriver {
    async fn drive(&self, stream: TcpStream, parts: SessionParts) {
        let SessionParts {
            session,
            mut writes,
            mut pipeline,
            tls,
            dispatcher,
            read_buffer_size,
        } = parts;
        let mut scratch = vec![0u8; read_buffer_size];
        let mut queue: VecDeque<WriteItem> = VecDeque::new();
        let mut in_flight: Option<InFlight> = None;
        let mut failure: Option<TransportError> = None;

        if let Err(error) = pipeline.begin() {
            finish(&session, &dispatcher, Some(error));
            return;
        }

        loop {
            let wants_write = in_flight.is_some() || !queue.is_empty();
            let interest = if wants_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            tokio::select! {
                _ = session.close_requested() => break,
                item = writes.recv() => {
                    match item {
                        Some(item) => queue.push_back(item),
                        // 所有发送端消失, 会话已无可写来源
                        None => break,
                    }
                }
                ready = stream.ready(interest) => {
                    let ready = match ready {
                        Ok(ready) => ready,
                        Err(error) => {
                            failure = Some(TransportError::from_io(&error));
                            break;
                        }
                    };
                    if ready.is_readable() {
                        if let Err(error) = pump_reads(&stream, &mut pipeline, &mut scratch) {
                            failure = Some(error);
                            break;
                        }
                    }
                    if ready.is_writable() {
                        if let Err(error) =
                            pump_writes(&stream, &mut in_flight, &mut queue, &tls, &pipeline)
                        {
                            failure = Some(error);
                            break;
                        }
                    }
                }
            }
        }

        if failure.is_none() {
            if let Some(notify) = flush_close_notify(&tls) {
                let _ = stream.try_write(&notify);
            }
        }
        finish(&session, &dispatcher, failure);
    }
}

/// 读到 WouldBlock 为止, 每段字节立即过流水线
fn pump_reads(
    stream: &TcpStream,
    pipeline: &mut super::Pipeline,
    scratch: &mut [u8],
) -> Result<(), TransportError> {
    loop {
        match stream.try_read(scratch) {
            Ok(0) => return Err(TransportError::RemoteDisconnect),
            Ok(read) => pipeline.ingest(&scratch[..read])?,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(error) => return Err(TransportError::from_io(&error)),
        }
    }
}

/// 续写在途条目, 写完一个再装填下一个, 直到 WouldBlock 或队列排空
fn pump_writes(
    stream: &TcpStream,
    in_flight: &mut Option<InFlight>,
    queue: &mut VecDeque<WriteItem>,
    tls: &Option<Arc<Mutex<TlsEngine>>>,
    pipeline: &super::Pipeline,
) -> Result<(), TransportError> {
    loop {
        if in_flight.is_none() {
            let Some(item) = queue.pop_front() else {
                return Ok(());
            };
            let (bytes, origin) = prepare_write(tls, item)?;
            if bytes.is_empty() {
                if let Some(origin) = origin {
                    pipeline
                        .dispatcher
                        .dispatch(&pipeline.session, SessionEvent::Sent(origin));
                }
                continue;
            }
            *in_flight = Some(InFlight { bytes, offset: 0, origin });
        }

        let Some(current) = in_flight.as_mut() else {
            return Ok(());
        };
        match stream.try_write(&current.bytes[current.offset..]) {
            Ok(written) => {
                current.offset += written;
                if current.offset == current.bytes.len() {
                    pipeline.session.touch();
                    if let Some(done) = in_flight.take() {
                        if let Some(origin) = done.origin {
                            pipeline
                                .dispatcher
                                .dispatch(&pipeline.session, SessionEvent::Sent(origin));
                        }
                    }
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(error) => return Err(TransportError::from_io(&error)),
        }
    }
}
