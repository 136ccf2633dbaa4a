//! OpenAI-compatible Chat Completions provider (SSE streaming).

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use toolflow_commons::{LLMError, LLMErrorMetadata};

use crate::provider::{ChatProvider, ProviderChunk, ProviderStream};
use crate::types::{ChatOptions, DeltaChunk, Message, ToolCallDelta};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const PROVIDER: &str = "openai";

#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAIProvider {
    pub fn new(api_key: Option<String>, model: Option<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, messages: &[Message], options: &ChatOptions) -> Value {
        let mut body = json!({
            "model": options.model.as_deref().unwrap_or(&self.model),
            "messages": messages.iter().map(message_json).collect::<Vec<_>>(),
            "stream": true,
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !options.tools.is_empty() {
            body["tools"] = options
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

fn message_json(message: &Message) -> Value {
    let mut value = json!({
        "role": message.role,
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn get_chat_completion(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ProviderStream, LLMError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&self.request_body(messages, options));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|err| LLMError::Network {
            message: format!("request to {url} failed: {err}"),
            metadata: Some(LLMErrorMetadata::new(PROVIDER, None, None)),
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &body, retry_after));
        }

        Ok(Box::pin(sse_stream(response.bytes_stream())))
    }
}

/// Map a non-success HTTP status to the provider error taxonomy.
pub fn map_status(status: u16, body: &str, retry_after: Option<String>) -> LLMError {
    let message = error_message(body).unwrap_or_else(|| format!("HTTP {status}"));
    let metadata = Some(LLMErrorMetadata::new(PROVIDER, Some(status), retry_after));
    match status {
        401 | 403 => LLMError::Authentication { message, metadata },
        429 => LLMError::RateLimit { metadata },
        400..=499 => LLMError::InvalidRequest { message, metadata },
        _ => LLMError::Provider { message, metadata },
    }
}

fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Decode an SSE body. Bytes are buffered raw and only complete events are
/// decoded, so a multi-byte character split across network chunks survives.
fn sse_stream<S, B, E>(body: S) -> impl Stream<Item = Result<ProviderChunk, LLMError>>
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    try_stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|err| LLMError::network(format!("stream interrupted: {err}")))?;
            buffer.extend_from_slice(bytes.as_ref());

            while let Some((split, delimiter)) = find_sse_boundary(&buffer) {
                let event = String::from_utf8_lossy(&buffer[..split]).into_owned();
                buffer.drain(..split + delimiter);

                let Some(payload) = extract_data_payload(&event) else {
                    continue;
                };
                let payload = payload.trim();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }
                let value: Value = serde_json::from_str(payload)
                    .map_err(|err| LLMError::provider(format!("invalid stream payload: {err}")))?;
                if let Some(chunk) = parse_chunk(&value) {
                    yield ProviderChunk::Delta(chunk);
                }
            }
        }
    }
}

/// Extract the canonical delta from one `chat.completion.chunk` payload.
pub fn parse_chunk(payload: &Value) -> Option<DeltaChunk> {
    let delta = payload.pointer("/choices/0/delta")?;
    let text = delta
        .get("content")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string);
    let tool_calls: Vec<ToolCallDelta> = delta
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(position, call)| ToolCallDelta {
                    index: call
                        .get("index")
                        .and_then(Value::as_u64)
                        .and_then(|index| usize::try_from(index).ok())
                        .unwrap_or(position),
                    id: call.get("id").and_then(Value::as_str).map(str::to_string),
                    name: call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    arguments: call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default();

    let chunk = DeltaChunk { text, tool_calls };
    (!chunk.is_empty()).then_some(chunk)
}

pub fn extract_data_payload(event: &str) -> Option<String> {
    let data_lines: Vec<&str> = event
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty() && !line.starts_with(':'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Earliest event boundary in `buffer` as `(index, delimiter_len)`.
pub fn find_sse_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let find = |needle: &[u8]| buffer.windows(needle.len()).position(|window| window == needle);
    let newline = find(&b"\n\n"[..]).map(|idx| (idx, 2));
    let carriage = find(&b"\r\n\r\n"[..]).map(|idx| (idx, 4));
    match (newline, carriage) {
        (Some(n), Some(c)) => Some(if n.0 <= c.0 { n } else { c }),
        (boundary, None) | (None, boundary) => boundary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, ToolCall, ToolDefinition};
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_content_and_tool_call_fragments() {
        let payload = json!({
            "choices": [{
                "delta": {
                    "content": "hi",
                    "tool_calls": [
                        {"index": 1, "id": "call_1", "function": {"name": "read", "arguments": "{\"pa"}}
                    ]
                }
            }]
        });
        let chunk = parse_chunk(&payload).unwrap();
        assert_eq!(chunk.text.as_deref(), Some("hi"));
        assert_eq!(
            chunk.tool_calls,
            vec![ToolCallDelta::new(1).with_id("call_1").with_name("read").with_arguments("{\"pa")]
        );
    }

    #[test]
    fn role_only_delta_is_skipped() {
        let payload = json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]});
        assert_eq!(parse_chunk(&payload), None);
    }

    #[test]
    fn sse_helpers_split_events() {
        let event = ": keep-alive\ndata: {\"a\":1}\ndata: {\"b\":2}\n";
        assert_eq!(
            extract_data_payload(event).as_deref(),
            Some("{\"a\":1}\n{\"b\":2}")
        );
        assert_eq!(find_sse_boundary(b"data: foo\n\nrest"), Some((9, 2)));
        assert_eq!(find_sse_boundary(b"data: foo\r\n\r\n"), Some((9, 4)));
        assert_eq!(find_sse_boundary(b"data: partial"), None);
    }

    #[tokio::test]
    async fn multibyte_character_split_across_body_chunks_is_preserved() {
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n\ndata: [DONE]\n\n";
        let bytes = event.as_bytes();
        let split = event.find('é').unwrap() + 1;
        let body = futures::stream::iter(vec![
            Ok::<_, std::convert::Infallible>(bytes[..split].to_vec()),
            Ok(bytes[split..].to_vec()),
        ]);

        let chunks: Vec<ProviderChunk> = sse_stream(body)
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(chunks, vec![ProviderChunk::Delta(DeltaChunk::text("café"))]);
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        let body = r#"{"error":{"message":"bad key"}}"#;
        assert!(matches!(
            map_status(401, body, None),
            LLMError::Authentication { ref message, .. } if message == "bad key"
        ));
        let limited = map_status(429, "", Some("3".into()));
        assert_eq!(limited.status(), Some(429));
        assert!(matches!(limited, LLMError::RateLimit { .. }));
        assert!(matches!(map_status(422, "", None), LLMError::InvalidRequest { .. }));
        assert!(matches!(map_status(503, "", None), LLMError::Provider { .. }));
    }

    #[test]
    fn request_body_includes_tools_and_history() {
        let provider = OpenAIProvider::new(None, Some("test-model".into()), None);
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(ToolCall::new("c1", "read_file", "{}"));
        let messages = vec![Message::user("hi"), assistant, Message::tool("c1", "contents")];
        let options = ChatOptions {
            tools: vec![ToolDefinition {
                name: "read_file".into(),
                description: "Read a file".into(),
                parameters: json!({"type": "object"}),
            }],
            ..ChatOptions::default()
        };
        let body = provider.request_body(&messages, &options);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(body["messages"][2]["tool_call_id"], "c1");
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
        assert_eq!(json!(Role::Tool), json!("tool"));
    }
}
