use super::{MessageSplitter, SplitResult};
use crate::buffer::ByteAccumulator;
use crate::session::SessionHandle;

/// WebSocket 帧分割器
///
/// 只解析头部字段计算期望帧长, 位布局与 RFC 6455 一致:
/// 2 个必选头字节, 7 位长度字段为 126 时再读 2 字节、127 时再读 8 字节,
/// mask 位置位时加 4 字节掩码, 期望总长 = 头部 + 掩码 + 载荷。
pub struct WebSocketSplitter;

/// 控制帧 opcode: close(8) / ping(9) / pong(10)
fn is_control_opcode(opcode: u8) -> bool {
    (0x8..=0xA).contains(&opcode)
}

/// 计算缓冲区头部一个 WebSocket 帧的期望长度
pub fn frame_length(buf: &[u8]) -> SplitResult {
    if buf.len() < 2 {
        return SplitResult::Incomplete;
    }

    let fin = buf[0] & 0x80 != 0;
    let rsv = (buf[0] >> 4) & 0x07;
    let opcode = buf[0] & 0x0F;
    let masked = buf[1] & 0x80 != 0;
    let length_marker = buf[1] & 0x7F;

    if rsv != 0 {
        return SplitResult::Invalid;
    }
    if opcode > 0xA {
        return SplitResult::Invalid;
    }
    // 控制帧不允许分片
    if !fin && is_control_opcode(opcode) {
        return SplitResult::Invalid;
    }

    let mut header = 2usize;
    let payload = match length_marker {
        126 => {
            // 控制帧载荷不允许超过 125 字节
            if is_control_opcode(opcode) {
                return SplitResult::Invalid;
            }
            if buf.len() < header + 2 {
                return SplitResult::Incomplete;
            }
            header += 2;
            u16::from_be_bytes([buf[2], buf[3]]) as u64
        }
        127 => {
            if is_control_opcode(opcode) {
                return SplitResult::Invalid;
            }
            if buf.len() < header + 8 {
                return SplitResult::Incomplete;
            }
            header += 8;
            u64::from_be_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ])
        }
        n => n as u64,
    };

    let mask = if masked { 4 } else { 0 };
    let expected = header as u64 + mask as u64 + payload;
    if expected > usize::MAX as u64 {
        return SplitResult::Invalid;
    }
    let expected = expected as usize;

    if buf.len() < expected {
        SplitResult::Incomplete
    } else {
        SplitResult::Frame(expected)
    }
}

impl MessageSplitter for WebSocketSplitter {
    fn can_split(&self, _session: &SessionHandle, accumulated: &ByteAccumulator) -> SplitResult {
        frame_length(accumulated.peek())
    }
}
