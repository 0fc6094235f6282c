use std::time::Duration;

use async_trait::async_trait;

use crate::config::TestConfig;
use crate::error::VajraError;
use crate::preflight::{CheckResult, PreflightCheck};
#[cfg(test)]
use crate::preflight::CheckStatus;

/// Budget for the target-service probe.
const SERVICE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget for DNS resolution plus TCP connect.
const NETWORK_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Below this much available memory the resource check warns.
const LOW_MEMORY_BYTES: u64 = 500 * 1024 * 1024;
/// Tests longer than this warn.
const LONG_DURATION_SECONDS: u64 = 3_600;

fn is_http_task(config: &TestConfig) -> bool {
    config.task_type.trim().to_uppercase().starts_with("HTTP")
}

fn target_url(config: &TestConfig) -> Option<&str> {
    config.task_parameters.get("url").map(String::as_str)
}

// ---------------------------------------------------------------------------
// ServiceHealthCheck
// ---------------------------------------------------------------------------

/// Probes the target service with a single GET before the load starts.
/// Skipped for non-HTTP task types.
pub struct ServiceHealthCheck {
    client: reqwest::Client,
}

impl ServiceHealthCheck {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(SERVICE_PROBE_TIMEOUT)
            .build()
            .expect("default reqwest client construction cannot fail");
        Self { client }
    }
}

impl Default for ServiceHealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreflightCheck for ServiceHealthCheck {
    fn name(&self) -> &'static str {
        "ServiceHealthCheck"
    }

    async fn run(&self, config: &TestConfig) -> CheckResult {
        if !is_http_task(config) {
            return CheckResult::skip(self.name(), "not an HTTP task");
        }
        let Some(url) = target_url(config) else {
            return CheckResult::fail(self.name(), "HTTP task has no url parameter");
        };

        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                let result = if status.is_success() {
                    CheckResult::pass(self.name(), "target service is reachable")
                } else {
                    CheckResult::warn(
                        self.name(),
                        format!("target service answered with status {status}"),
                    )
                };
                result.with_metadata("status_code", status.as_u16().to_string())
            }
            Err(e) => CheckResult::fail(self.name(), "target service is unreachable")
                .with_detail(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigurationCheck
// ---------------------------------------------------------------------------

/// Enforces the numeric limit table plus HTTP URL sanity.
pub struct ConfigurationCheck;

#[async_trait]
impl PreflightCheck for ConfigurationCheck {
    fn name(&self) -> &'static str {
        "ConfigurationCheck"
    }

    async fn run(&self, config: &TestConfig) -> CheckResult {
        let mut fail_details: Vec<String> = config
            .validate()
            .into_iter()
            .map(|e| match e {
                VajraError::Configuration(msg) => msg,
                other => other.to_string(),
            })
            .collect();
        let mut warn_details: Vec<String> = Vec::new();

        if config.test_duration_seconds > LONG_DURATION_SECONDS {
            warn_details.push(format!(
                "test duration exceeds one hour ({} s)",
                config.test_duration_seconds
            ));
        }

        if is_http_task(config) {
            match target_url(config) {
                None => fail_details.push("HTTP task requires a url parameter".to_string()),
                Some(url) => match reqwest::Url::parse(url) {
                    Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {}
                    Ok(parsed) => fail_details
                        .push(format!("url must use http or https (got {})", parsed.scheme())),
                    Err(e) => fail_details.push(format!("malformed url '{url}': {e}")),
                },
            }
        }

        if !fail_details.is_empty() {
            let mut result = CheckResult::fail(self.name(), "invalid configuration");
            for detail in fail_details.into_iter().chain(warn_details) {
                result = result.with_detail(detail);
            }
            result
        } else if !warn_details.is_empty() {
            let mut result = CheckResult::warn(self.name(), "configuration warnings");
            for detail in warn_details {
                result = result.with_detail(detail);
            }
            result
        } else {
            CheckResult::pass(self.name(), "configuration is within limits")
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceCheck
// ---------------------------------------------------------------------------

/// Inspects available process memory; low memory produces a warning rather
/// than blocking the test outright.
pub struct ResourceCheck {
    low_memory_bytes: u64,
}

impl ResourceCheck {
    pub fn with_threshold(low_memory_bytes: u64) -> Self {
        Self { low_memory_bytes }
    }
}

impl Default for ResourceCheck {
    fn default() -> Self {
        Self {
            low_memory_bytes: LOW_MEMORY_BYTES,
        }
    }
}

#[async_trait]
impl PreflightCheck for ResourceCheck {
    fn name(&self) -> &'static str {
        "ResourceCheck"
    }

    async fn run(&self, _config: &TestConfig) -> CheckResult {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let available = system.available_memory();
        let available_mb = available / (1024 * 1024);

        let result = if available < self.low_memory_bytes {
            CheckResult::warn(
                self.name(),
                format!("low available memory ({available_mb} MB)"),
            )
        } else {
            CheckResult::pass(
                self.name(),
                format!("{available_mb} MB of memory available"),
            )
        };
        result.with_metadata("available_mb", available_mb.to_string())
    }
}

// ---------------------------------------------------------------------------
// NetworkCheck
// ---------------------------------------------------------------------------

/// Resolves the target host and opens one TCP connection. DNS failure is
/// fatal; a failed connect only warns (the service probe covers liveness).
pub struct NetworkCheck;

#[async_trait]
impl PreflightCheck for NetworkCheck {
    fn name(&self) -> &'static str {
        "NetworkCheck"
    }

    async fn run(&self, config: &TestConfig) -> CheckResult {
        if !is_http_task(config) {
            return CheckResult::skip(self.name(), "not an HTTP task");
        }
        let Some(url) = target_url(config) else {
            return CheckResult::fail(self.name(), "HTTP task has no url parameter");
        };
        let parsed = match reqwest::Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                return CheckResult::fail(self.name(), "malformed url").with_detail(e.to_string())
            }
        };
        let Some(host) = parsed.host_str() else {
            return CheckResult::fail(self.name(), "url has no host");
        };
        let port = parsed.port_or_known_default().unwrap_or(80);

        let probe = async {
            let mut addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| (true, e.to_string()))?;
            let addr = addrs
                .next()
                .ok_or_else(|| (true, "no addresses resolved".to_string()))?;
            tokio::net::TcpStream::connect(addr)
                .await
                .map_err(|e| (false, e.to_string()))?;
            Ok::<_, (bool, String)>(addr)
        };

        match tokio::time::timeout(NETWORK_PROBE_TIMEOUT, probe).await {
            Ok(Ok(addr)) => CheckResult::pass(self.name(), format!("connected to {addr}"))
                .with_metadata("address", addr.to_string()),
            // DNS failure blocks; connect failure only warns.
            Ok(Err((true, detail))) => {
                CheckResult::fail(self.name(), format!("DNS resolution failed for {host}"))
                    .with_detail(detail)
            }
            Ok(Err((false, detail))) => {
                CheckResult::warn(self.name(), format!("TCP connect to {host}:{port} failed"))
                    .with_detail(detail)
            }
            Err(_) => CheckResult::warn(
                self.name(),
                format!("network probe to {host}:{port} timed out"),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sleep_config() -> TestConfig {
        let mut config = TestConfig::new("check-test", "SLEEP");
        config.task_parameters = HashMap::from([("duration".to_string(), "10".to_string())]);
        config
    }

    fn http_config(url: &str) -> TestConfig {
        let mut config = TestConfig::new("check-test", "HTTP_GET");
        config.task_parameters = HashMap::from([("url".to_string(), url.to_string())]);
        config
    }

    // -----------------------------------------------------------------------
    // ConfigurationCheck
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn configuration_check_passes_valid_config() {
        let result = ConfigurationCheck.run(&sleep_config()).await;
        assert_eq!(result.status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn configuration_check_fails_oversized_concurrency() {
        let mut config = sleep_config();
        config.starting_concurrency = 60_000;
        config.max_concurrency = 60_000;
        let result = ConfigurationCheck.run(&config).await;
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result
            .details
            .iter()
            .any(|d| d.contains("concurrency exceeds limit 50000")));
    }

    #[tokio::test]
    async fn configuration_check_warns_on_long_duration() {
        let mut config = sleep_config();
        config.test_duration_seconds = 7_200;
        let result = ConfigurationCheck.run(&config).await;
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(result.details.iter().any(|d| d.contains("one hour")));
    }

    #[tokio::test]
    async fn configuration_check_fails_ramp_longer_than_duration() {
        let mut config = sleep_config();
        config.ramp_duration_seconds = 600;
        config.test_duration_seconds = 60;
        let result = ConfigurationCheck.run(&config).await;
        assert_eq!(result.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn configuration_check_fails_http_without_url() {
        let mut config = sleep_config();
        config.task_type = "HTTP_GET".to_string();
        config.task_parameters.clear();
        let result = ConfigurationCheck.run(&config).await;
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.details.iter().any(|d| d.contains("url")));
    }

    #[tokio::test]
    async fn configuration_check_fails_malformed_url() {
        let result = ConfigurationCheck.run(&http_config("not-a-url")).await;
        assert_eq!(result.status, CheckStatus::Fail);
    }

    // -----------------------------------------------------------------------
    // ServiceHealthCheck / NetworkCheck skip behaviour
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn service_health_skipped_for_non_http() {
        let result = ServiceHealthCheck::new().run(&sleep_config()).await;
        assert_eq!(result.status, CheckStatus::Skip);
    }

    #[tokio::test]
    async fn network_check_skipped_for_non_http() {
        let result = NetworkCheck.run(&sleep_config()).await;
        assert_eq!(result.status, CheckStatus::Skip);
    }

    #[tokio::test]
    async fn service_health_fails_for_unreachable_service() {
        // Port 9 on loopback is not listening.
        let result = ServiceHealthCheck::new()
            .run(&http_config("http://127.0.0.1:9/health"))
            .await;
        assert_eq!(result.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn network_check_warns_on_refused_connect() {
        let result = NetworkCheck.run(&http_config("http://127.0.0.1:9/")).await;
        assert_eq!(result.status, CheckStatus::Warn);
    }

    #[tokio::test]
    async fn network_check_fails_on_dns_error() {
        let result = NetworkCheck
            .run(&http_config("http://host.invalid./"))
            .await;
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.message.contains("DNS"));
    }

    // -----------------------------------------------------------------------
    // ResourceCheck
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn resource_check_reports_memory() {
        let result = ResourceCheck::default().run(&sleep_config()).await;
        assert!(matches!(result.status, CheckStatus::Pass | CheckStatus::Warn));
        assert!(result.metadata.contains_key("available_mb"));
    }

    #[tokio::test]
    async fn resource_check_warns_below_threshold() {
        // An absurdly high threshold forces the warn path deterministically.
        let result = ResourceCheck::with_threshold(u64::MAX)
            .run(&sleep_config())
            .await;
        assert_eq!(result.status, CheckStatus::Warn);
    }
}
