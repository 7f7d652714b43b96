// ── Viking Bridge: Store Client ────────────────────────────────────────────
//
// Thin typed transport over the OpenViking HTTP API.
//
// Contract for every call:
//   • per-request timeout from the resolved config
//   • deterministic URL construction (trailing slashes stripped at build)
//   • header precedence: X-API-Key < static config headers < per-call headers
//   • envelope decode: {status: "ok"|"error", result?, error?{code?, message?}}
//     on non-2xx or status != "ok" the call fails with one well-formed
//     message preferring error.message, then the raw body, then the HTTP
//     status text. An empty 2xx body is success with a null result.
//
// Error classes: reqwest failures and HTTP 5xx are retriable transport
// errors; everything else (bad envelope, 4xx) is a protocol error.

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{RelationEntry, ResolvedMemoryConfig, SearchResponse, SessionEvent};

// ── Trait seam ─────────────────────────────────────────────────────────────
// The subset of store operations the write bridge and read pipeline consume.
// Production uses `VikingClient`; tests substitute in-memory fakes.

#[async_trait]
pub trait VikingStore: Send + Sync {
    async fn create_session(&self) -> EngineResult<String>;
    async fn add_events_batch(&self, session_id: &str, events: &[SessionEvent])
        -> EngineResult<u64>;
    async fn commit_session(&self, session_id: &str, cause: &str) -> EngineResult<()>;
    async fn search(
        &self,
        query: &str,
        target_uri: &str,
        session_id: Option<&str>,
        limit: usize,
        score_threshold: Option<f64>,
    ) -> EngineResult<SearchResponse>;
    async fn find(
        &self,
        query: &str,
        target_uri: &str,
        session_id: Option<&str>,
        limit: usize,
        score_threshold: Option<f64>,
    ) -> EngineResult<SearchResponse>;
    async fn relations(&self, uri: &str) -> EngineResult<Vec<RelationEntry>>;
    async fn read_content(&self, uri: &str) -> EngineResult<String>;
    async fn abstract_of(&self, uri: &str) -> EngineResult<String>;
    async fn overview_of(&self, uri: &str) -> EngineResult<String>;
    async fn observer_health(&self, component: &str) -> EngineResult<ObserverComponentHealth>;
}

// ── Typed results for supplementary endpoints ──────────────────────────────

/// Result of ingesting a resource.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AddResourceResult {
    pub uri: String,
    #[serde(default)]
    pub enqueued: bool,
    #[serde(default)]
    pub waited: bool,
}

/// Health detail for a single observed component.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ObserverComponentHealth {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_healthy: bool,
    #[serde(default)]
    pub has_errors: bool,
}

/// Aggregate health across the store's processing components.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ObserverSystemHealth {
    #[serde(default)]
    pub is_healthy: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub components: HashMap<String, ObserverComponentHealth>,
}

// ── Client ─────────────────────────────────────────────────────────────────

pub struct VikingClient {
    http: Client,
    endpoint: String,
    timeout: Duration,
    headers: HashMap<String, String>,
    api_key: Option<String>,
}

impl VikingClient {
    pub fn new(config: &ResolvedMemoryConfig) -> Self {
        Self {
            http: Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.effective_timeout_ms()),
            headers: config.headers.clone(),
            api_key: config.api_key.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    // ── Request core ───────────────────────────────────────────────────────

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        call_headers: Option<&HashMap<String, String>>,
    ) -> EngineResult<Value> {
        let url = format!("{}{}", self.endpoint, path);
        let mut req = self.http.request(method, &url).timeout(self.timeout);

        if !query.is_empty() {
            req = req.query(query);
        }

        // Resolved up front: emitting a colliding name twice would make
        // reqwest append both values instead of letting the caller win.
        for (name, value) in self.merged_headers(call_headers) {
            req = req.header(name.as_str(), value.as_str());
        }

        if let Some(body) = body {
            req = req.json(&body);
        }

        debug!("[viking] {} {}", path, if query.is_empty() { "" } else { "?" });

        let resp = req.send().await?;
        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(envelope_failure(status, &raw));
        }

        if raw.trim().is_empty() {
            return Ok(Value::Null);
        }

        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Protocol(format!("non-JSON response from store: {e}")))?;

        match parsed.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(parsed.get("result").cloned().unwrap_or(Value::Null)),
            Some(_) => Err(EngineError::Protocol(extract_error_message(&parsed, &raw, status))),
            None => Err(EngineError::Protocol(format!(
                "response missing envelope status: {}",
                preview(&raw)
            ))),
        }
    }

    /// Header precedence, one value per name: the configured api key, then
    /// static config headers, then per-call headers, each later layer
    /// replacing the earlier one. Names merge case-insensitively the way
    /// the wire treats them.
    fn merged_headers(
        &self,
        call_headers: Option<&HashMap<String, String>>,
    ) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        if let Some(key) = &self.api_key {
            merged.insert("x-api-key".to_string(), key.clone());
        }
        for (name, value) in &self.headers {
            merged.insert(name.to_ascii_lowercase(), value.clone());
        }
        if let Some(extra) = call_headers {
            for (name, value) in extra {
                merged.insert(name.to_ascii_lowercase(), value.clone());
            }
        }
        merged
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> EngineResult<Value> {
        self.request(Method::GET, path, query, None, None).await
    }

    async fn post(&self, path: &str, body: Value) -> EngineResult<Value> {
        self.request(Method::POST, path, &[], Some(body), None).await
    }

    // ── Liveness & sessions ────────────────────────────────────────────────

    pub async fn health(&self) -> EngineResult<Value> {
        self.get("/health", &[]).await
    }

    pub async fn list_sessions(&self) -> EngineResult<Value> {
        self.get("/api/v1/sessions", &[]).await
    }

    pub async fn get_session(&self, session_id: &str) -> EngineResult<Value> {
        self.get(&format!("/api/v1/sessions/{session_id}"), &[]).await
    }

    pub async fn delete_session(&self, session_id: &str) -> EngineResult<Value> {
        self.request(Method::DELETE, &format!("/api/v1/sessions/{session_id}"), &[], None, None)
            .await
    }

    pub async fn extract_session(&self, session_id: &str) -> EngineResult<Value> {
        self.post(&format!("/api/v1/sessions/{session_id}/extract"), json!({})).await
    }

    pub async fn add_session_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> EngineResult<Value> {
        let role = crate::atoms::types::EventRole::parse(role).ok_or_else(|| {
            EngineError::Validation(format!(
                "invalid message role '{role}' (expected user or assistant)"
            ))
        })?;
        self.post(
            &format!("/api/v1/sessions/{session_id}/messages"),
            json!({ "role": role.as_str(), "content": content }),
        )
        .await
    }

    /// Escape hatch for host tooling: issue an arbitrary store call with
    /// per-call headers layered over the configured ones.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        headers: Option<&HashMap<String, String>>,
    ) -> EngineResult<Value> {
        self.request(method, path, &[], body, headers).await
    }

    // ── Search & content ───────────────────────────────────────────────────

    async fn search_like(
        &self,
        path: &str,
        query: &str,
        target_uri: &str,
        session_id: Option<&str>,
        limit: usize,
        score_threshold: Option<f64>,
    ) -> EngineResult<SearchResponse> {
        let mut body = json!({
            "query": query,
            "target_uri": target_uri,
            "limit": limit,
        });
        if let Some(sid) = session_id {
            body["session_id"] = json!(sid);
        }
        if let Some(t) = score_threshold {
            body["score_threshold"] = json!(t);
        }
        let result = self.post(path, body).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn grep(
        &self,
        uri: &str,
        pattern: &str,
        case_insensitive: bool,
    ) -> EngineResult<Value> {
        self.post(
            "/api/v1/search/grep",
            json!({ "uri": uri, "pattern": pattern, "case_insensitive": case_insensitive }),
        )
        .await
    }

    pub async fn glob(&self, pattern: &str, uri: &str) -> EngineResult<Value> {
        self.post("/api/v1/search/glob", json!({ "pattern": pattern, "uri": uri })).await
    }

    async fn content_layer(&self, layer: &str, uri: &str) -> EngineResult<String> {
        let result =
            self.get(&format!("/api/v1/content/{layer}"), &[("uri", uri.to_string())]).await?;
        Ok(value_to_text(&result))
    }

    // ── Ingestion ──────────────────────────────────────────────────────────

    pub async fn add_resource(
        &self,
        path: &str,
        target: Option<&str>,
        reason: &str,
        instruction: &str,
        wait: bool,
        timeout_secs: Option<u64>,
    ) -> EngineResult<AddResourceResult> {
        let mut body = json!({
            "path": path,
            "reason": reason,
            "instruction": instruction,
            "wait": wait,
        });
        if let Some(target) = target {
            body["target"] = json!(target);
        }
        if let Some(t) = timeout_secs {
            body["timeout"] = json!(t);
        }
        let result = self.post("/api/v1/resources", body).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Ingest a skill. When `data` carries a message transcript, every role
    /// must be `user` or `assistant`; anything else is refused before the
    /// request is built.
    pub async fn add_skill(
        &self,
        data: Value,
        wait: bool,
        timeout_secs: Option<u64>,
    ) -> EngineResult<Value> {
        if let Some(messages) = data.get("messages").and_then(Value::as_array) {
            for message in messages {
                let role = message.get("role").and_then(Value::as_str).unwrap_or("");
                if crate::atoms::types::EventRole::parse(role).is_none() {
                    return Err(EngineError::Validation(format!(
                        "invalid skill message role '{role}' (expected user or assistant)"
                    )));
                }
            }
        }
        let mut body = json!({ "data": data, "wait": wait });
        if let Some(t) = timeout_secs {
            body["timeout"] = json!(t);
        }
        self.post("/api/v1/skills", body).await
    }

    pub async fn wait_processed(&self, timeout_secs: Option<u64>) -> EngineResult<Value> {
        let body = match timeout_secs {
            Some(t) => json!({ "timeout": t }),
            None => json!({}),
        };
        self.post("/api/v1/system/wait", body).await
    }

    // ── Filesystem (reads unrestricted; writes policy-gated by the caller) ─

    pub async fn fs_ls(&self, uri: &str) -> EngineResult<Value> {
        self.get("/api/v1/fs/ls", &[("uri", uri.to_string())]).await
    }

    pub async fn fs_tree(&self, uri: &str) -> EngineResult<Value> {
        self.get("/api/v1/fs/tree", &[("uri", uri.to_string())]).await
    }

    pub async fn fs_stat(&self, uri: &str) -> EngineResult<Value> {
        self.get("/api/v1/fs/stat", &[("uri", uri.to_string())]).await
    }

    pub async fn fs_mkdir(&self, uri: &str) -> EngineResult<Value> {
        self.post("/api/v1/fs/mkdir", json!({ "uri": uri })).await
    }

    pub async fn fs_rm(&self, uri: &str, recursive: bool) -> EngineResult<Value> {
        self.request(
            Method::DELETE,
            "/api/v1/fs",
            &[("uri", uri.to_string()), ("recursive", recursive.to_string())],
            None,
            None,
        )
        .await
    }

    pub async fn fs_mv(&self, from_uri: &str, to_uri: &str) -> EngineResult<Value> {
        self.post("/api/v1/fs/mv", json!({ "from_uri": from_uri, "to_uri": to_uri })).await
    }

    // ── Relations ──────────────────────────────────────────────────────────

    pub async fn link_relation(
        &self,
        from_uri: &str,
        to_uri: &str,
        reason: Option<&str>,
    ) -> EngineResult<Value> {
        let mut body = json!({ "from_uri": from_uri, "to_uri": to_uri });
        if let Some(reason) = reason {
            body["reason"] = json!(reason);
        }
        self.post("/api/v1/relations/link", body).await
    }

    pub async fn unlink_relation(&self, from_uri: &str, to_uri: &str) -> EngineResult<Value> {
        self.request(
            Method::DELETE,
            "/api/v1/relations/link",
            &[],
            Some(json!({ "from_uri": from_uri, "to_uri": to_uri })),
            None,
        )
        .await
    }

    // ── Observer health ────────────────────────────────────────────────────

    pub async fn observer_queue(&self) -> EngineResult<ObserverComponentHealth> {
        self.observer_component("queue").await
    }

    pub async fn observer_vikingdb(&self) -> EngineResult<ObserverComponentHealth> {
        self.observer_component("vikingdb").await
    }

    pub async fn observer_vlm(&self) -> EngineResult<ObserverComponentHealth> {
        self.observer_component("vlm").await
    }

    pub async fn observer_transaction(&self) -> EngineResult<ObserverComponentHealth> {
        self.observer_component("transaction").await
    }

    async fn observer_component(&self, name: &str) -> EngineResult<ObserverComponentHealth> {
        let result = self.get(&format!("/api/v1/observer/{name}"), &[]).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn observer_system(&self) -> EngineResult<ObserverSystemHealth> {
        let result = self.get("/api/v1/observer/system", &[]).await?;
        Ok(serde_json::from_value(result)?)
    }

    // ── Portability ────────────────────────────────────────────────────────

    pub async fn pack_export(&self, body: Value) -> EngineResult<Value> {
        self.post("/api/v1/pack/export", body).await
    }

    pub async fn pack_import(&self, body: Value) -> EngineResult<Value> {
        self.post("/api/v1/pack/import", body).await
    }
}

// ── Trait impl ─────────────────────────────────────────────────────────────

#[async_trait]
impl VikingStore for VikingClient {
    async fn create_session(&self) -> EngineResult<String> {
        let result = self.post("/api/v1/sessions", json!({})).await?;
        result
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Protocol("create_session: no session_id in result".into()))
    }

    async fn add_events_batch(
        &self,
        session_id: &str,
        events: &[SessionEvent],
    ) -> EngineResult<u64> {
        let result = self
            .post(
                &format!("/api/v1/sessions/{session_id}/events/batch"),
                json!({ "events": events }),
            )
            .await?;
        Ok(result.get("inserted").and_then(Value::as_u64).unwrap_or(events.len() as u64))
    }

    async fn commit_session(&self, session_id: &str, cause: &str) -> EngineResult<()> {
        self.post(&format!("/api/v1/sessions/{session_id}/commit"), json!({ "cause": cause }))
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        target_uri: &str,
        session_id: Option<&str>,
        limit: usize,
        score_threshold: Option<f64>,
    ) -> EngineResult<SearchResponse> {
        self.search_like("/api/v1/search/search", query, target_uri, session_id, limit, score_threshold)
            .await
    }

    async fn find(
        &self,
        query: &str,
        target_uri: &str,
        session_id: Option<&str>,
        limit: usize,
        score_threshold: Option<f64>,
    ) -> EngineResult<SearchResponse> {
        self.search_like("/api/v1/search/find", query, target_uri, session_id, limit, score_threshold)
            .await
    }

    async fn relations(&self, uri: &str) -> EngineResult<Vec<RelationEntry>> {
        let result = self.get("/api/v1/relations", &[("uri", uri.to_string())]).await?;
        Ok(serde_json::from_value(result).unwrap_or_default())
    }

    async fn read_content(&self, uri: &str) -> EngineResult<String> {
        self.content_layer("read", uri).await
    }

    async fn abstract_of(&self, uri: &str) -> EngineResult<String> {
        self.content_layer("abstract", uri).await
    }

    async fn overview_of(&self, uri: &str) -> EngineResult<String> {
        self.content_layer("overview", uri).await
    }

    async fn observer_health(&self, component: &str) -> EngineResult<ObserverComponentHealth> {
        self.observer_component(component).await
    }
}

// ── Envelope helpers ───────────────────────────────────────────────────────

/// Content endpoints answer either a bare string result or an object with a
/// text-ish field; normalize both to a plain string.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(map) => map
            .get("content")
            .or_else(|| map.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

fn envelope_failure(status: StatusCode, raw: &str) -> EngineError {
    let message = serde_json::from_str::<Value>(raw)
        .ok()
        .map(|v| extract_error_message(&v, raw, status))
        .unwrap_or_else(|| {
            if raw.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                preview(raw)
            }
        });
    if status.is_server_error() {
        EngineError::Transport(message)
    } else {
        EngineError::Protocol(message)
    }
}

/// Single well-formed error message: error.message, then raw body, then the
/// HTTP status text.
fn extract_error_message(envelope: &Value, raw: &str, status: StatusCode) -> String {
    if let Some(msg) = envelope
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
    {
        return msg.to_string();
    }
    if !raw.trim().is_empty() {
        return preview(raw);
    }
    format!("HTTP {}", status)
}

fn preview(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() > 300 {
        let cut: String = trimmed.chars().take(300).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_trailing_slash_is_stripped() {
        let mut cfg = ResolvedMemoryConfig::default();
        cfg.endpoint = "http://127.0.0.1:1933///".into();
        let client = VikingClient::new(&cfg);
        assert_eq!(client.endpoint(), "http://127.0.0.1:1933");
    }

    #[test]
    fn caller_headers_replace_static_config_headers() {
        let mut cfg = ResolvedMemoryConfig::default();
        cfg.endpoint = "http://127.0.0.1:1933".into();
        cfg.api_key = Some("config-key".into());
        cfg.headers.insert("X-Trace".into(), "static".into());
        cfg.headers.insert("X-Only-Static".into(), "kept".into());
        let client = VikingClient::new(&cfg);

        let mut call = HashMap::new();
        call.insert("x-trace".to_string(), "per-call".to_string());
        call.insert("X-Extra".to_string(), "added".to_string());

        let merged = client.merged_headers(Some(&call));
        // One value per name, caller's value winning on collision.
        assert_eq!(merged.get("x-trace").map(String::as_str), Some("per-call"));
        assert_eq!(merged.get("x-only-static").map(String::as_str), Some("kept"));
        assert_eq!(merged.get("x-extra").map(String::as_str), Some("added"));
        assert_eq!(merged.get("x-api-key").map(String::as_str), Some("config-key"));
        assert_eq!(merged.len(), 4);

        // Config headers can override the api key header itself.
        cfg.headers.insert("X-API-Key".into(), "rotated".into());
        let client = VikingClient::new(&cfg);
        let merged = client.merged_headers(None);
        assert_eq!(merged.get("x-api-key").map(String::as_str), Some("rotated"));
    }

    #[test]
    fn error_message_prefers_envelope_then_body_then_status() {
        let envelope = serde_json::json!({
            "status": "error",
            "error": { "code": "E_NOPE", "message": "uri not found" }
        });
        let raw = envelope.to_string();
        assert_eq!(
            extract_error_message(&envelope, &raw, StatusCode::NOT_FOUND),
            "uri not found"
        );

        let bare = serde_json::json!({ "status": "error" });
        assert_eq!(
            extract_error_message(&bare, r#"{"status":"error"}"#, StatusCode::NOT_FOUND),
            r#"{"status":"error"}"#
        );
        assert_eq!(extract_error_message(&bare, "  ", StatusCode::NOT_FOUND), "HTTP 404 Not Found");
    }

    #[test]
    fn server_errors_are_transport_client_errors_are_protocol() {
        assert!(matches!(
            envelope_failure(StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
            EngineError::Transport(_)
        ));
        assert!(matches!(
            envelope_failure(StatusCode::BAD_REQUEST, "nope"),
            EngineError::Protocol(_)
        ));
    }

    #[test]
    fn value_to_text_handles_string_object_and_null() {
        assert_eq!(value_to_text(&Value::String("abc".into())), "abc");
        assert_eq!(value_to_text(&Value::Null), "");
        assert_eq!(value_to_text(&serde_json::json!({"content": "xyz"})), "xyz");
        assert_eq!(value_to_text(&serde_json::json!({"text": "t"})), "t");
    }

    #[tokio::test]
    async fn skill_role_validation_refuses_bad_roles() {
        let mut cfg = ResolvedMemoryConfig::default();
        cfg.endpoint = "http://127.0.0.1:9".into();
        let client = VikingClient::new(&cfg);
        let err = client
            .add_skill(
                serde_json::json!({ "messages": [{ "role": "system", "content": "x" }] }),
                false,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("invalid skill message role"));
    }
}
