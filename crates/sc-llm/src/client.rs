//! OpenAI-compatible chat-completions client.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Backend error payload: {0}")]
    Server(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Requested model id is not available on the backend: {requested} (available: {})", available.join(", "))]
    ModelUnavailable {
        requested: String,
        available: Vec<String>,
    },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Derive `(root_url, v1_url)` from whatever the operator passed.
///
/// Accepts a root backend URL (`http://127.0.0.1:1245`), a `/v1` URL, or a
/// full endpoint URL (`.../v1/chat/completions`), trimming the path back to
/// the `/v1` root. The `/v1` trim only happens at a real segment boundary so
/// `/v1beta` survives. Scheme-less inputs get `http://`. This is intentionally
/// permissive: local backends often sit behind reverse proxies or UI tools
/// that expose a full path rather than a base URL.
pub fn normalize_urls(url: &str) -> (String, String) {
    let u = url.trim();
    if u.is_empty() {
        return (String::new(), "/v1".to_string());
    }
    let u = if u.contains("://") {
        u.to_string()
    } else {
        format!("http://{u}")
    };
    let (scheme, rest) = match u.split_once("://") {
        Some(pair) => pair,
        None => ("http", u.as_str()),
    };
    let (authority, raw_path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let mut path = raw_path.trim_end_matches('/').to_string();
    if let Some(idx) = path.find("/v1") {
        let after = &path[idx + 3..];
        if after.is_empty() || after.starts_with('/') {
            path.truncate(idx);
        }
    }
    let root = format!("{scheme}://{authority}{path}");
    let root = root.trim_end_matches('/').to_string();
    let v1 = format!("{root}/v1");
    (root, v1)
}

/// Generation options for one chat or completion call.
#[derive(Debug, Clone, Serialize)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typical_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip)]
    pub response_format: Option<Value>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 768,
            temperature: 0.0,
            repetition_penalty: None,
            top_p: None,
            min_p: None,
            typical_p: None,
            stop: Vec::new(),
            response_format: None,
        }
    }
}

impl ChatOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: Option<f64>) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_response_format(mut self, rf: Option<Value>) -> Self {
        self.response_format = rf;
        self
    }
}

/// Which `response_format` variants were attempted and which one stuck.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseFormatMeta {
    pub attempts: Vec<String>,
    pub final_format: String,
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// One model response plus call metadata.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub meta: ResponseFormatMeta,
    pub latency_ms: u64,
}

fn rf_type(rf: &Option<Value>) -> String {
    match rf {
        None => "none".to_string(),
        Some(v) => v
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
    }
}

/// Minimal OpenAI-compatible chat client. One HTTP call at a time; no
/// session state lives on the backend between calls.
pub struct ChatClient {
    http: reqwest::Client,
    root_url: String,
    v1_url: String,
    model: String,
}

impl ChatClient {
    /// Build a client for a backend URL and model id. The request timeout
    /// comes from `OPENAI_COMPAT_TIMEOUT_S` (default 180 s — quantized
    /// local backends can be slow).
    pub fn new(url: &str, model: impl Into<String>) -> ClientResult<Self> {
        let timeout_s = std::env::var("OPENAI_COMPAT_TIMEOUT_S")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(180);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()?;
        let (root_url, v1_url) = normalize_urls(url);
        Ok(Self {
            http,
            root_url,
            v1_url,
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    pub fn v1_url(&self) -> &str {
        &self.v1_url
    }

    /// `GET /v1/models` → available model ids.
    pub async fn list_models(&self) -> ClientResult<Vec<String>> {
        let url = format!("{}/models", self.v1_url);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let body: Value = resp.json().await?;
        let mut ids = Vec::new();
        if let Some(items) = body.get("data").and_then(Value::as_array) {
            for item in items {
                if let Some(id) = item.get("id").and_then(Value::as_str) {
                    let id = id.trim();
                    if !id.is_empty() {
                        ids.push(id.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Poll `/v1/models` until the configured model shows up or the deadline
    /// passes. During llama-server startup the endpoint returns 503 until
    /// the weights are loaded.
    pub async fn ensure_model_available(&self) -> ClientResult<()> {
        let ready_timeout_s = std::env::var("OPENAI_COMPAT_MODEL_READY_TIMEOUT_S")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(180)
            .max(10);
        let deadline = Instant::now() + Duration::from_secs(ready_timeout_s);

        let mut last_ids: Option<Vec<String>> = None;
        while Instant::now() < deadline {
            match self.list_models().await {
                Ok(ids) => {
                    if ids.iter().any(|id| id == &self.model) {
                        return Ok(());
                    }
                    last_ids = Some(ids);
                    break;
                }
                Err(err) => {
                    tracing::debug!("model availability probe failed: {err}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        let mut available = last_ids.unwrap_or_default();
        available.truncate(12);
        Err(ClientError::ModelUnavailable {
            requested: self.model.clone(),
            available,
        })
    }

    async fn post_chat(&self, payload: &Value) -> ClientResult<String> {
        let url = format!("{}/chat/completions", self.v1_url);
        tracing::debug!(
            "POST {url} model={} response_format={}",
            self.model,
            payload
                .get("response_format")
                .and_then(|v| v.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("none")
        );
        let resp = self.http.post(&url).json(payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let body: Value = resp.json().await?;
        if let Some(err) = body.get("error") {
            if !err.is_null() {
                return Err(ClientError::Server(err.to_string()));
            }
        }
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ClientError::InvalidResponse("missing message content".into()))?;
        Ok(text.to_string())
    }

    fn chat_payload(&self, system: &str, user: &str, options: &ChatOptions) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if !system.is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": user}));

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": false,
        });
        if let Some(rp) = options.repetition_penalty {
            // llama.cpp historically reads "repeat_penalty" and may ignore
            // "repetition_penalty". Unknown fields are ignored, so send both.
            payload["repetition_penalty"] = json!(rp);
            payload["repeat_penalty"] = json!(rp);
        }
        if let Some(v) = options.top_p {
            payload["top_p"] = json!(v);
        }
        if let Some(v) = options.min_p {
            payload["min_p"] = json!(v);
        }
        if let Some(v) = options.typical_p {
            payload["typical_p"] = json!(v);
        }
        if !options.stop.is_empty() {
            payload["stop"] = json!(options.stop);
        }
        payload
    }

    /// `POST /v1/chat/completions` with the response-format fallback cascade:
    /// as-given → `json_object` → omitted. The attempted formats are recorded
    /// in the outcome metadata.
    pub async fn chat(
        &self,
        system: &str,
        user: &str,
        options: &ChatOptions,
    ) -> ClientResult<ChatOutcome> {
        let start = Instant::now();
        let mut payload = self.chat_payload(system, user, options);
        if let Some(rf) = &options.response_format {
            payload["response_format"] = rf.clone();
        }

        let mut attempts: Vec<String> = vec![rf_type(&options.response_format)];
        let first = self.post_chat(&payload).await;
        match first {
            Ok(text) => Ok(ChatOutcome {
                text,
                meta: ResponseFormatMeta {
                    final_format: attempts.last().cloned().unwrap_or_default(),
                    attempts,
                    used_fallback: false,
                    fallback_reason: None,
                },
                latency_ms: start.elapsed().as_millis() as u64,
            }),
            Err(err) if options.response_format.is_some() => {
                // Some servers reject response_format outright. Retry with
                // the widely-supported json_object, then with none at all.
                let reason = err.to_string();
                payload["response_format"] = json!({"type": "json_object"});
                attempts.push("json_object".to_string());
                match self.post_chat(&payload).await {
                    Ok(text) => Ok(ChatOutcome {
                        text,
                        meta: ResponseFormatMeta {
                            final_format: "json_object".to_string(),
                            attempts,
                            used_fallback: true,
                            fallback_reason: Some(reason),
                        },
                        latency_ms: start.elapsed().as_millis() as u64,
                    }),
                    Err(_) => {
                        if let Some(map) = payload.as_object_mut() {
                            map.remove("response_format");
                        }
                        attempts.push("none".to_string());
                        let text = self.post_chat(&payload).await?;
                        Ok(ChatOutcome {
                            text,
                            meta: ResponseFormatMeta {
                                final_format: "none".to_string(),
                                attempts,
                                used_fallback: true,
                                fallback_reason: Some(reason),
                            },
                            latency_ms: start.elapsed().as_millis() as u64,
                        })
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Raw text continuation via `POST {root}/completion` (no chat template).
    /// Used for adapters fine-tuned on raw text rather than chat format.
    pub async fn complete(&self, prompt: &str, options: &ChatOptions) -> ClientResult<ChatOutcome> {
        let start = Instant::now();
        let mut payload = json!({
            "prompt": prompt,
            "temperature": options.temperature,
            "n_predict": options.max_tokens,
            "stream": false,
        });
        if let Some(rp) = options.repetition_penalty {
            payload["repeat_penalty"] = json!(rp);
        }
        if let Some(v) = options.top_p {
            payload["top_p"] = json!(v);
        }
        if let Some(v) = options.min_p {
            payload["min_p"] = json!(v);
        }
        if let Some(v) = options.typical_p {
            payload["typical_p"] = json!(v);
        }
        if !options.stop.is_empty() {
            payload["stop"] = json!(options.stop);
        }

        let url = format!("{}/completion", self.root_url);
        tracing::debug!("POST {url} prompt_len={}", prompt.len());
        let resp = self.http.post(&url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let body: Value = resp.json().await?;
        let text = body
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ChatOutcome {
            text,
            meta: ResponseFormatMeta {
                attempts: vec!["none".to_string()],
                final_format: "none".to_string(),
                used_fallback: false,
                fallback_reason: None,
            },
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// One LoRA adapter activation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdapterScale {
    pub id: i64,
    pub scale: f64,
}

/// Best-effort llama-server LoRA control for single-backend runs.
/// POSTs `[]` to disable all adapters, or `[{id, scale}]` to enable one.
#[derive(Debug, Clone)]
pub struct LoraControl {
    url: String,
    http: reqwest::Client,
}

impl LoraControl {
    pub fn new(url: &str) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.url.is_empty()
    }

    /// Apply an adapter scale. No-op when the control URL is empty; scale 0
    /// (or below) disables all adapters.
    pub async fn set_scale(&self, adapter_id: i64, scale: f64) -> ClientResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let body: Vec<AdapterScale> = if scale <= 0.0 {
            Vec::new()
        } else {
            vec![AdapterScale {
                id: adapter_id,
                scale,
            }]
        };
        let url = format!("{}/lora-adapters", self.url);
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_accepts_root_and_v1() {
        let (root, v1) = normalize_urls("http://127.0.0.1:1245");
        assert_eq!(root, "http://127.0.0.1:1245");
        assert_eq!(v1, "http://127.0.0.1:1245/v1");

        let (root, v1) = normalize_urls("http://127.0.0.1:1245/v1");
        assert_eq!(root, "http://127.0.0.1:1245");
        assert_eq!(v1, "http://127.0.0.1:1245/v1");
    }

    #[test]
    fn test_normalize_trims_full_endpoint_paths() {
        let (root, v1) = normalize_urls("http://127.0.0.1:1245/v1/chat/completions");
        assert_eq!(root, "http://127.0.0.1:1245");
        assert_eq!(v1, "http://127.0.0.1:1245/v1");

        let (root, v1) = normalize_urls("127.0.0.1:1245/v1/models");
        assert_eq!(root, "http://127.0.0.1:1245");
        assert_eq!(v1, "http://127.0.0.1:1245/v1");
    }

    #[test]
    fn test_normalize_keeps_api_prefix() {
        let (root, v1) = normalize_urls("http://localhost:8080/api/v1/chat/completions");
        assert_eq!(root, "http://localhost:8080/api");
        assert_eq!(v1, "http://localhost:8080/api/v1");
    }

    #[test]
    fn test_normalize_does_not_trim_v1beta() {
        let (root, v1) = normalize_urls("http://localhost:8080/v1beta");
        assert_eq!(root, "http://localhost:8080/v1beta");
        assert_eq!(v1, "http://localhost:8080/v1beta/v1");
    }

    #[test]
    fn test_normalize_empty() {
        let (root, v1) = normalize_urls("");
        assert_eq!(root, "");
        assert_eq!(v1, "/v1");
    }

    #[test]
    fn test_chat_payload_sends_both_penalty_spellings() {
        let client = ChatClient::new("http://127.0.0.1:1234", "m").unwrap();
        let options = ChatOptions::default().with_repetition_penalty(Some(1.1));
        let payload = client.chat_payload("sys", "user", &options);
        assert_eq!(payload["repetition_penalty"], json!(1.1));
        assert_eq!(payload["repeat_penalty"], json!(1.1));
        assert_eq!(payload["stream"], json!(false));
    }

    #[test]
    fn test_rf_type_labels() {
        assert_eq!(rf_type(&None), "none");
        assert_eq!(rf_type(&Some(json!({"type": "json_schema"}))), "json_schema");
        assert_eq!(rf_type(&Some(json!({}))), "unknown");
    }
}
