//! Backend abstraction so extractors can run against a scripted mock.

use crate::client::{ChatClient, ChatOptions, ChatOutcome, ClientResult, ResponseFormatMeta};
use async_trait::async_trait;
use std::sync::Mutex;

/// The two ways the pipeline talks to a model.
#[async_trait]
pub trait LmBackend: Send + Sync {
    async fn chat(&self, system: &str, user: &str, options: &ChatOptions)
        -> ClientResult<ChatOutcome>;

    async fn complete(&self, prompt: &str, options: &ChatOptions) -> ClientResult<ChatOutcome>;
}

#[async_trait]
impl LmBackend for ChatClient {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        options: &ChatOptions,
    ) -> ClientResult<ChatOutcome> {
        ChatClient::chat(self, system, user, options).await
    }

    async fn complete(&self, prompt: &str, options: &ChatOptions) -> ClientResult<ChatOutcome> {
        ChatClient::complete(self, prompt, options).await
    }
}

/// Scripted backend for tests: returns queued responses in order, then
/// empty strings. Records every prompt it received.
#[derive(Default)]
pub struct MockBackend {
    responses: Mutex<Vec<String>>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn next_response(&self) -> String {
        let mut q = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        if q.is_empty() {
            String::new()
        } else {
            q.remove(0)
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LmBackend for MockBackend {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        _options: &ChatOptions,
    ) -> ClientResult<ChatOutcome> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((system.to_string(), user.to_string()));
        Ok(ChatOutcome {
            text: self.next_response(),
            meta: ResponseFormatMeta::default(),
            latency_ms: 0,
        })
    }

    async fn complete(&self, prompt: &str, _options: &ChatOptions) -> ClientResult<ChatOutcome> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((String::new(), prompt.to_string()));
        Ok(ChatOutcome {
            text: self.next_response(),
            meta: ResponseFormatMeta::default(),
            latency_ms: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_returns_scripted_responses() {
        let backend = MockBackend::with_responses(vec!["first".into(), "second".into()]);
        let opts = ChatOptions::default();
        assert_eq!(backend.chat("s", "u", &opts).await.unwrap().text, "first");
        assert_eq!(backend.chat("s", "u", &opts).await.unwrap().text, "second");
        assert_eq!(backend.chat("s", "u", &opts).await.unwrap().text, "");
        assert_eq!(backend.call_count(), 3);
    }
}
