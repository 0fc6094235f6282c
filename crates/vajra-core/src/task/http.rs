use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::VajraError;
use crate::task::{Task, TaskError, TaskFactory, TaskOutput};

/// Per-request timeout bounds and default (ms).
const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Outer client timeout; individual requests use the per-request timeout.
const CLIENT_TIMEOUT_SECS: u64 = 30;

/// Resolved, validated description of one HTTP request shape.
struct HttpSpec {
    method: reqwest::Method,
    url: reqwest::Url,
    headers: Vec<(String, String)>,
    body: Option<String>,
    content_type: String,
    timeout: Duration,
}

/// Factory for the `HTTP`, `HTTP_GET` and `HTTP_POST` task types.
///
/// Holds one pooled [`reqwest::Client`] shared by every invocation of the
/// test; the client is internally reference-counted and safe for concurrent
/// use from all virtual users.
pub struct HttpTaskFactory {
    task_type: String,
    client: reqwest::Client,
    spec: Arc<HttpSpec>,
}

impl HttpTaskFactory {
    /// Build a factory from the task parameter bag, validating every field.
    pub fn from_parameters(
        task_type: &str,
        params: &HashMap<String, String>,
    ) -> Result<Self, VajraError> {
        let url_raw = params
            .get("url")
            .ok_or_else(|| VajraError::Configuration("HTTP task requires a url parameter".to_string()))?;
        let url = reqwest::Url::parse(url_raw).map_err(|e| {
            VajraError::Configuration(format!("invalid url '{url_raw}': {e}"))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(VajraError::Configuration(format!(
                "url must use http or https (got {})",
                url.scheme()
            )));
        }

        let method = resolve_method(task_type, params)?;

        let timeout_ms = match params.get("timeout") {
            Some(raw) => {
                let ms: u64 = raw.parse().map_err(|_| {
                    VajraError::Configuration(format!("timeout must be an integer (got '{raw}')"))
                })?;
                if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&ms) {
                    return Err(VajraError::Configuration(format!(
                        "timeout must be in {MIN_TIMEOUT_MS}..={MAX_TIMEOUT_MS} ms"
                    )));
                }
                ms
            }
            None => DEFAULT_TIMEOUT_MS,
        };

        let headers = match params.get("headers") {
            Some(raw) => parse_headers(raw)?,
            None => Vec::new(),
        };

        let body = params.get("body").cloned();
        let content_type = params
            .get("contentType")
            .cloned()
            .unwrap_or_else(|| "application/json".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CLIENT_TIMEOUT_SECS))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(format!("vajraedge/{}", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            task_type: task_type.to_uppercase(),
            client,
            spec: Arc::new(HttpSpec {
                method,
                url,
                headers,
                body,
                content_type,
                timeout: Duration::from_millis(timeout_ms),
            }),
        })
    }
}

impl TaskFactory for HttpTaskFactory {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn create_task(&self) -> Box<dyn Task> {
        Box::new(HttpTask {
            client: self.client.clone(),
            spec: Arc::clone(&self.spec),
        })
    }
}

/// The method comes from the task-type suffix for `HTTP_GET`/`HTTP_POST`;
/// the generic `HTTP` type reads it from the parameter bag (default GET).
fn resolve_method(
    task_type: &str,
    params: &HashMap<String, String>,
) -> Result<reqwest::Method, VajraError> {
    match task_type.to_uppercase().as_str() {
        "HTTP_GET" => Ok(reqwest::Method::GET),
        "HTTP_POST" => Ok(reqwest::Method::POST),
        _ => match params.get("method") {
            None => Ok(reqwest::Method::GET),
            Some(raw) => match raw.to_uppercase().as_str() {
                "GET" => Ok(reqwest::Method::GET),
                "POST" => Ok(reqwest::Method::POST),
                "PUT" => Ok(reqwest::Method::PUT),
                "DELETE" => Ok(reqwest::Method::DELETE),
                other => Err(VajraError::Configuration(format!(
                    "unsupported HTTP method: {other}"
                ))),
            },
        },
    }
}

/// Headers arrive as a JSON object of string values.
fn parse_headers(raw: &str) -> Result<Vec<(String, String)>, VajraError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| VajraError::Configuration(format!("headers must be a JSON object: {e}")))?;
    let object = value.as_object().ok_or_else(|| {
        VajraError::Configuration("headers must be a JSON object of strings".to_string())
    })?;
    let mut headers = Vec::with_capacity(object.len());
    for (name, v) in object {
        let text = v.as_str().ok_or_else(|| {
            VajraError::Configuration(format!("header '{name}' must have a string value"))
        })?;
        headers.push((name.clone(), text.to_string()));
    }
    Ok(headers)
}

struct HttpTask {
    client: reqwest::Client,
    spec: Arc<HttpSpec>,
}

#[async_trait]
impl Task for HttpTask {
    async fn execute(&self) -> Result<TaskOutput, TaskError> {
        let spec = &self.spec;
        let mut builder = self
            .client
            .request(spec.method.clone(), spec.url.clone())
            .timeout(spec.timeout);

        for (name, value) in &spec.headers {
            builder = builder.header(name, value);
        }

        if let Some(body) = &spec.body {
            builder = builder
                .header("Content-Type", spec.content_type.as_str())
                .body(body.clone());
        }

        let response = builder.send().await.map_err(classify_send_error)?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(TaskError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TaskError::InvalidResponse(e.to_string()))?;

        Ok(TaskOutput {
            bytes_processed: body.len() as u64,
        })
    }
}

/// Bucket reqwest network errors into the stable error kinds.
fn classify_send_error(err: reqwest::Error) -> TaskError {
    if err.is_timeout() {
        TaskError::Timeout
    } else if err.is_connect() {
        TaskError::Refused
    } else {
        TaskError::Other(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
