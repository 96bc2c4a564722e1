//! AWS event-stream 二进制分帧解码（Bedrock `converse-stream` 使用）
//!
//! 帧结构：总长度(4) | 头部长度(4) | 前导CRC(4) | 头部 | 负载 | 消息CRC(4)，均为大端序。

use bytes::{Buf, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
/// 单帧上限16MB
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// 一条完整消息，只保留字符串类型的头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub headers: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl EventMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// `:event-type`，异常消息则返回 `:exception-type`
    pub fn event_type(&self) -> Option<&str> {
        self.header(":event-type")
            .or_else(|| self.header(":exception-type"))
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.header(":message-type"), Some("exception") | Some("error"))
    }
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<EventMessage>> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// 流结束时缓冲区应该为空，否则说明最后一帧被截断
    pub fn finish(&self) -> Result<()> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "event stream ended with {} trailing bytes",
                self.buffer.len()
            )))
        }
    }

    fn next_message(&mut self) -> Result<Option<EventMessage>> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        let headers_len = u32::from_be_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]]) as usize;
        let prelude_crc = u32::from_be_bytes([self.buffer[8], self.buffer[9], self.buffer[10], self.buffer[11]]);

        if crc32fast::hash(&self.buffer[..8]) != prelude_crc {
            return Err(Error::Protocol("event stream prelude checksum mismatch".into()));
        }
        if total_len < PRELUDE_LEN + CRC_LEN + headers_len || total_len > MAX_MESSAGE_LEN {
            return Err(Error::Protocol(format!(
                "event stream frame has invalid length {}",
                total_len
            )));
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total_len).freeze();
        let message_crc = u32::from_be_bytes([
            frame[total_len - 4],
            frame[total_len - 3],
            frame[total_len - 2],
            frame[total_len - 1],
        ]);
        if crc32fast::hash(&frame[..total_len - CRC_LEN]) != message_crc {
            return Err(Error::Protocol("event stream message checksum mismatch".into()));
        }

        let headers = parse_headers(frame.slice(PRELUDE_LEN..PRELUDE_LEN + headers_len))?;
        let payload = frame.slice(PRELUDE_LEN + headers_len..total_len - CRC_LEN);
        Ok(Some(EventMessage { headers, payload }))
    }
}

fn parse_headers(mut raw: Bytes) -> Result<BTreeMap<String, String>> {
    let truncated = || Error::Protocol("event stream header truncated".into());
    let mut headers = BTreeMap::new();

    while raw.has_remaining() {
        let name_len = raw.get_u8() as usize;
        if raw.remaining() < name_len + 1 {
            return Err(truncated());
        }
        let name = String::from_utf8_lossy(&raw.split_to(name_len)).into_owned();
        let value_type = raw.get_u8();
        let fixed = match value_type {
            0 | 1 => Some(0),
            2 => Some(1),
            3 => Some(2),
            4 => Some(4),
            5 | 8 => Some(8),
            9 => Some(16),
            6 | 7 => None,
            other => {
                return Err(Error::Protocol(format!(
                    "event stream header '{}' has unknown type {}",
                    name, other
                )))
            }
        };
        match fixed {
            Some(len) => {
                if raw.remaining() < len {
                    return Err(truncated());
                }
                raw.advance(len);
            }
            None => {
                if raw.remaining() < 2 {
                    return Err(truncated());
                }
                let len = raw.get_u16() as usize;
                if raw.remaining() < len {
                    return Err(truncated());
                }
                let value = raw.split_to(len);
                if value_type == 7 {
                    headers.insert(name, String::from_utf8_lossy(&value).into_owned());
                }
            }
        }
    }
    Ok(headers)
}
