//! Server-Sent Events 解码
//!
//! 缓冲跨多个网络分片的事件，按空行切分后解析 `event:` / `data:` 字段。

use bytes::Bytes;
use futures::StreamExt;
use reqwest::Response;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::ChatChunk;
use crate::pool::InFlight;
use crate::provider::ChatStream;

/// 缓冲区上限（1MB），超过说明上游没有按SSE格式分帧
const MAX_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个分片，返回其中所有完整的事件
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some((end, sep_len)) = find_boundary(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + sep_len).collect();
            if let Some(event) = parse_frame(&frame[..end]) {
                events.push(event);
            }
        }
        if self.buffer.len() > MAX_BUFFER {
            self.buffer.clear();
            return Err(Error::Protocol("SSE event exceeds buffer limit".into()));
        }
        Ok(events)
    }

    /// 流结束时处理缓冲区中剩余的半个事件
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_frame(&rest)
    }
}

/// 查找事件分隔符（`\n\n` 或 `\r\n\r\n`）
fn find_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(frame: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(frame);
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    // SSE允许多行data
    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

/// 把SSE响应包装为规范化增量流
///
/// `translate` 持有每个连接器自己的解码状态，一个事件可以产生零个或多个增量。
/// 连接池守卫随流一起释放；中途出错会标记为失败。
pub(crate) fn chunk_stream<F>(response: Response, guard: InFlight, mut translate: F) -> ChatStream
where
    F: FnMut(SseEvent) -> Result<Vec<ChatChunk>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut guard = guard;
        let mut decoder = SseDecoder::new();
        let mut bytes = response.bytes_stream();
        let mut finished = false;

        'outer: while let Some(next) = bytes.next().await {
            let chunk: Bytes = match next {
                Ok(chunk) => chunk,
                Err(e) => {
                    guard.mark_failed();
                    yield Err(Error::Transport(e));
                    break;
                }
            };
            let events = match decoder.push(&chunk) {
                Ok(events) => events,
                Err(e) => {
                    guard.mark_failed();
                    yield Err(e);
                    break;
                }
            };
            for event in events {
                if event.is_done() {
                    debug!("SSE stream reached [DONE]");
                    finished = true;
                    break 'outer;
                }
                match translate(event) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        guard.mark_failed();
                        yield Err(e);
                        break 'outer;
                    }
                }
            }
        }

        if !finished {
            if let Some(event) = decoder.finish() {
                if !event.is_done() {
                    match translate(event) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                yield Ok(chunk);
                            }
                        }
                        Err(e) => yield Err(e),
                    }
                }
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: message_start\nda").unwrap().is_empty());
        let events = decoder.push(b"ta: {\"a\":1}\n\ndata: [DONE]\n\n").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn crlf_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let events = decoder
            .push(b": keep-alive\r\n\r\ndata: line1\r\ndata: line2\r\n\r\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn trailing_event_without_separator() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap().data, "tail");
    }
}
