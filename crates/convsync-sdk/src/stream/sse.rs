//! SSE（text/event-stream）推送通道

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use tracing::info;

use super::frame::RawFrame;
use super::{EventSource, FrameStream};
use crate::config::SyncConfig;
use crate::error::{ConvSyncError, Result};
use crate::http_client::ensure_success;

/// 增量 SSE 解码器
///
/// 按行解析 `data:` / `event:` 字段，空行结束一个事件；多行 data 以 `\n` 拼接。
/// 以 `:` 开头的注释行、`id:` / `retry:` 字段被忽略。兼容 CRLF 换行。
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一段字节，返回其中完整的事件
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// 尚未处理完的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn process_line(&mut self, line: &str) -> Option<RawFrame> {
        if line.is_empty() {
            let event = self.event.take();
            if self.data.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(RawFrame { event, data });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

/// 基于 reqwest 的 SSE 事件源：`GET {base}/conversations/{id}/events`
pub struct SseEventSource {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl SseEventSource {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        // 长连接，只设置连接超时
        let mut builder = Client::builder();
        if let Some(timeout) = config.http_client_config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| ConvSyncError::Config(format!("创建 SSE 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            auth_token: config.current_user.auth_token.clone(),
        })
    }

    fn events_url(&self, conversation_id: &str) -> String {
        format!("{}/conversations/{}/events", self.base_url, conversation_id)
    }
}

#[async_trait]
impl EventSource for SseEventSource {
    async fn connect(&self, conversation_id: &str) -> Result<FrameStream> {
        let url = self.events_url(conversation_id);
        info!("📡 打开推送通道: {}", url);

        let mut request = self.client.get(&url).header(ACCEPT, "text/event-stream");
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = ensure_success(request.send().await?, "打开推送通道").await?;

        let mut decoder = SseDecoder::new();
        let frames = response
            .bytes_stream()
            .map(move |chunk| -> Vec<Result<RawFrame>> {
                match chunk {
                    Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(ConvSyncError::Transport(format!("推送通道读取失败: {}", e)))],
                }
            })
            .flat_map(futures_util::stream::iter);

        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: message.created\ndata: {\"a\":\ndata: 1}\n\n");
        assert_eq!(
            frames,
            vec![RawFrame {
                event: Some("message.created".to_string()),
                data: "{\"a\":\n1}".to_string(),
            }]
        );
    }

    #[test]
    fn test_decoder_handles_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":").is_empty());
        assert!(decoder.push(b"\"ping\"}\r\n").is_empty());
        assert!(decoder.buffered() == 0);

        let frames = decoder.push(b"\r\n");
        assert_eq!(frames, vec![RawFrame::new("{\"type\":\"ping\"}")]);
    }

    #[test]
    fn test_decoder_ignores_comments_and_empty_events() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\n\nid: 7\nretry: 1000\n\ndata:x\n\ndata: y\n\n");
        assert_eq!(frames, vec![RawFrame::new("x"), RawFrame::new("y")]);
    }

    #[test]
    fn test_event_name_does_not_leak_into_next_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: typing.started\ndata: a\n\ndata: b\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("typing.started"));
        assert_eq!(frames[1].event, None);
    }

    #[tokio::test]
    async fn test_sse_source_reads_frames() {
        use crate::storage::entities::CurrentUser;
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/wf-1/events"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"type\":\"connected\"}\n\n: hb\n\ndata: {\"type\":\"ping\"}\n\n"),
            )
            .mount(&server)
            .await;

        let config = SyncConfig::builder()
            .base_url(server.uri())
            .conversation_id("wf-1")
            .current_user(CurrentUser::new("u1", "Ann"))
            .build()
            .unwrap();
        let source = SseEventSource::new(&config).unwrap();
        let frames: Vec<RawFrame> = source
            .connect("wf-1")
            .await
            .unwrap()
            .map(|frame| frame.unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"type\":\"connected\"}");
    }
}
