//! # Request Executor
//!
//! Drives the four-phase pipeline for a single request: pre-request script,
//! variable resolution, HTTP call, test script. Scripts run against
//! immutable snapshots; their staged variable writes are merged into the
//! scope chain between phases, so a pre-request write is visible to
//! resolution and a test write is visible to every later request of the run.
//! Nothing in the pipeline throws: transport and script failures are
//! captured into the returned [`RunResult`].

use std::time::Duration;

use tracing::{debug, warn};

use crate::collections::{FlatRequest, RequestDefinition};
use crate::environment::{ScopeChain, encode_query_preserving_tokens, unresolved_tokens};
use crate::error::TransportError;
use crate::history::{HistoryEntry, HistorySink};
use crate::http::client::{Transport, parse_key_value_lines};
use crate::http::request::ResolvedRequest;
use crate::report::{RequestStatus, RunResult, TestResult, TestSummary, now_ms};
use crate::script::{RequestView, Sandbox, ScriptInput, ScriptPhase};

/// Tunables shared by every request of a run.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionSettings {
    pub request_timeout_ms: u64,
    pub script_timeout_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            script_timeout_ms: 5_000,
        }
    }
}

pub struct RequestExecutor<'a> {
    transport: &'a dyn Transport,
    history: Option<&'a dyn HistorySink>,
    sandbox: Sandbox,
    request_timeout_ms: u64,
}

impl<'a> RequestExecutor<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        history: Option<&'a dyn HistorySink>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            transport,
            history,
            sandbox: Sandbox::new(Duration::from_millis(settings.script_timeout_ms)),
            request_timeout_ms: settings.request_timeout_ms,
        }
    }

    /// Execute one request. Binds the request's collection variable chain to
    /// `scopes` and leaves any staged script writes merged for callers.
    pub async fn execute(&self, flat: &FlatRequest, scopes: &mut ScopeChain) -> RunResult {
        scopes.set_collection_chain(flat.variable_chain.clone());
        let request = &flat.request;
        let timestamp = now_ms();
        let mut tests: Vec<TestResult> = Vec::new();

        // Phase 1: pre-request script against the raw, unresolved request.
        let pre = self.sandbox.run(
            &request.pre_request_script,
            &ScriptInput {
                phase: ScriptPhase::PreRequest,
                request: RequestView {
                    name: &request.name,
                    method: request.method,
                    url: &request.url,
                    body: &request.body,
                },
                response: None,
                scopes,
            },
        );
        log_console(&request.name, "pre-request", &pre.console);
        tests.extend(pre.tests);
        if let Some(err) = pre.error {
            tests.push(TestResult {
                name: "pre-request script".to_string(),
                passed: false,
                error: Some(err.to_string()),
            });
        }
        scopes.merge_staged(pre.staged);

        // Phase 2: resolve against the updated chain, not the pre-script one.
        let resolved = match self.build_resolved(request, scopes) {
            Ok(resolved) => resolved,
            Err(err) => {
                return self.finish(request, request.url.clone(), None, Some(err.to_string()), tests, timestamp);
            }
        };

        let leftover = unresolved_tokens(&resolved.url);
        if !leftover.is_empty() {
            debug!(request = %request.name, tokens = ?leftover, "blocking send: unresolved variables");
            return RunResult {
                request_id: request.id,
                request_name: request.name.clone(),
                method: request.method,
                url: resolved.url,
                status: RequestStatus::Skipped,
                status_code: None,
                response_time_ms: None,
                tests: summarize(tests),
                error: Some(format!(
                    "Unresolved variables in URL: {}",
                    leftover.join(", ")
                )),
                timestamp,
            };
        }

        // Phase 3: transport. Failures are captured, never thrown.
        let (response, error) = match self.transport.send(&resolved).await {
            Ok(response) => (Some(response), None),
            Err(err) => (None, Some(err.to_string())),
        };

        if let Some(sink) = self.history {
            let entry = HistoryEntry {
                timestamp,
                method: resolved.method,
                url: resolved.url.clone(),
                status: response
                    .as_ref()
                    .map(|r| format!("{} {}", r.status_code, r.status_text)),
                duration_ms: response.as_ref().map(|r| r.timing.total_ms),
            };
            if let Err(err) = sink.record(entry) {
                warn!(request = %request.name, error = %err, "history write failed");
            }
        }

        // Phase 4: test script against the resolved request and response.
        let post = self.sandbox.run(
            &request.test_script,
            &ScriptInput {
                phase: ScriptPhase::Test,
                request: RequestView {
                    name: &resolved.name,
                    method: resolved.method,
                    url: &resolved.url,
                    body: &resolved.body,
                },
                response: response.as_ref(),
                scopes,
            },
        );
        log_console(&request.name, "test", &post.console);
        tests.extend(post.tests);
        if let Some(err) = post.error {
            tests.push(TestResult {
                name: "test script".to_string(),
                passed: false,
                error: Some(err.to_string()),
            });
        }
        scopes.merge_staged(post.staged);

        self.finish(
            request,
            resolved.url,
            response.as_ref().map(|r| (r.status_code, r.timing.total_ms)),
            error,
            tests,
            timestamp,
        )
    }

    fn build_resolved(
        &self,
        request: &RequestDefinition,
        scopes: &ScopeChain,
    ) -> Result<ResolvedRequest, TransportError> {
        let mut url = scopes.resolve(&request.url);
        let params = scopes.resolve(&request.params);
        let pairs = parse_key_value_lines(&params, '=')?;
        if !pairs.is_empty() {
            let query: Vec<String> = pairs
                .iter()
                .map(|(key, value)| {
                    format!(
                        "{}={}",
                        encode_query_preserving_tokens(key),
                        encode_query_preserving_tokens(value)
                    )
                })
                .collect();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query.join("&"));
        }

        Ok(ResolvedRequest {
            name: request.name.clone(),
            method: request.method,
            url,
            headers: scopes.resolve(&request.headers),
            body: scopes.resolve(&request.body),
            auth: request.auth.resolve(scopes),
            timeout_ms: self.request_timeout_ms,
        })
    }

    /// Derive the final status: passed unless a registered test failed, or
    /// no tests were registered and the HTTP status is >= 400 or the
    /// transport failed.
    fn finish(
        &self,
        request: &RequestDefinition,
        url: String,
        response: Option<(u16, u64)>,
        error: Option<String>,
        tests: Vec<TestResult>,
        timestamp: u64,
    ) -> RunResult {
        let any_failed = tests.iter().any(|test| !test.passed);
        let status = if any_failed {
            RequestStatus::Failed
        } else if tests.is_empty() {
            match response {
                Some((code, _)) if code >= 400 => RequestStatus::Failed,
                Some(_) => RequestStatus::Passed,
                None => RequestStatus::Failed,
            }
        } else {
            RequestStatus::Passed
        };

        RunResult {
            request_id: request.id,
            request_name: request.name.clone(),
            method: request.method,
            url,
            status,
            status_code: response.map(|(code, _)| code),
            response_time_ms: response.map(|(_, time)| time),
            tests: summarize(tests),
            error,
            timestamp,
        }
    }
}

fn summarize(tests: Vec<TestResult>) -> Option<TestSummary> {
    if tests.is_empty() {
        None
    } else {
        Some(TestSummary::from_tests(tests))
    }
}

fn log_console(request: &str, phase: &str, lines: &[String]) {
    for line in lines {
        debug!(request = %request, phase = %phase, "script: {line}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::auth::AuthMethod;
    use crate::environment::{Environment, Variable};
    use crate::history::MemoryHistory;
    use crate::http::method::HttpMethod;
    use crate::http::response::{HttpResponse, TimingBreakdown};

    struct StubTransport {
        status: u16,
        fail: Option<&'static str>,
        seen: Mutex<Vec<ResolvedRequest>>,
    }

    impl StubTransport {
        fn ok(status: u16) -> Self {
            Self {
                status,
                fail: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &'static str) -> Self {
            Self {
                status: 0,
                fail: Some(message),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<ResolvedRequest> {
            self.seen.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn send(&self, request: &ResolvedRequest) -> Result<HttpResponse, TransportError> {
            self.seen.lock().expect("lock").push(request.clone());
            if let Some(message) = self.fail {
                return Err(TransportError::Send(message.to_string()));
            }
            Ok(HttpResponse {
                status_code: self.status,
                status_text: "Stub".to_string(),
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                body: r#"{"id":7}"#.to_string(),
                timing: TimingBreakdown {
                    headers_ms: 3,
                    body_ms: 1,
                    total_ms: 4,
                },
                size_bytes: 8,
            })
        }
    }

    fn flat(request: RequestDefinition) -> FlatRequest {
        FlatRequest {
            request,
            variable_chain: Vec::new(),
        }
    }

    fn request(url: &str) -> RequestDefinition {
        RequestDefinition {
            id: 1,
            name: "req".to_string(),
            method: HttpMethod::Get,
            url: url.to_string(),
            params: String::new(),
            headers: String::new(),
            body: String::new(),
            auth: AuthMethod::None,
            pre_request_script: String::new(),
            test_script: String::new(),
        }
    }

    fn scopes_with(env: &[(&str, &str)]) -> ScopeChain {
        let environment = Environment {
            name: "dev".to_string(),
            variables: env.iter().map(|(k, v)| Variable::new(k, v)).collect(),
        };
        ScopeChain::new(Some(environment), Vec::new())
    }

    #[tokio::test]
    async fn pre_request_writes_are_visible_to_resolution() {
        let transport = StubTransport::ok(200);
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut request = request("https://{{host}}/users");
        request.pre_request_script = "set env host = staged.example.com".to_string();
        let mut scopes = scopes_with(&[]);

        let result = executor.execute(&flat(request), &mut scopes).await;

        assert_eq!(result.status, RequestStatus::Passed);
        assert_eq!(transport.sent()[0].url, "https://staged.example.com/users");
        // Merged for the rest of the run as well.
        assert_eq!(scopes.lookup("host").as_deref(), Some("staged.example.com"));
    }

    #[tokio::test]
    async fn params_are_encoded_and_appended() {
        let transport = StubTransport::ok(200);
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut request = request("https://api.example.com/search");
        request.params = "q = two words\nlang={{lang}}".to_string();
        let mut scopes = scopes_with(&[("lang", "en")]);

        executor.execute(&flat(request), &mut scopes).await;

        assert_eq!(
            transport.sent()[0].url,
            "https://api.example.com/search?q=two+words&lang=en"
        );
    }

    #[tokio::test]
    async fn no_tests_and_error_status_fails() {
        let transport = StubTransport::ok(404);
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut scopes = scopes_with(&[]);

        let result = executor
            .execute(&flat(request("https://api.example.com")), &mut scopes)
            .await;

        assert_eq!(result.status, RequestStatus::Failed);
        assert_eq!(result.status_code, Some(404));
    }

    #[tokio::test]
    async fn no_tests_and_redirect_status_passes() {
        let transport = StubTransport::ok(303);
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut scopes = scopes_with(&[]);

        let result = executor
            .execute(&flat(request("https://api.example.com")), &mut scopes)
            .await;

        assert_eq!(result.status, RequestStatus::Passed);
    }

    #[tokio::test]
    async fn passing_tests_override_the_status_code_rule() {
        let transport = StubTransport::ok(500);
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut request = request("https://api.example.com");
        request.test_script = "test \"server broke as expected\" status == 500".to_string();
        let mut scopes = scopes_with(&[]);

        let result = executor.execute(&flat(request), &mut scopes).await;

        assert_eq!(result.status, RequestStatus::Passed);
        let tests = result.tests.expect("tests");
        assert_eq!(tests.passed, 1);
        assert_eq!(tests.failed, 0);
    }

    #[tokio::test]
    async fn failing_test_fails_the_request() {
        let transport = StubTransport::ok(200);
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut request = request("https://api.example.com");
        request.test_script = "test \"created\" status == 201".to_string();
        let mut scopes = scopes_with(&[]);

        let result = executor.execute(&flat(request), &mut scopes).await;

        assert_eq!(result.status, RequestStatus::Failed);
        assert_eq!(result.status_code, Some(200));
    }

    #[tokio::test]
    async fn transport_failure_is_captured_not_thrown() {
        let transport = StubTransport::failing("connection refused");
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut scopes = scopes_with(&[]);

        let result = executor
            .execute(&flat(request("https://api.example.com")), &mut scopes)
            .await;

        assert_eq!(result.status, RequestStatus::Failed);
        assert_eq!(result.status_code, None);
        assert!(result.error.as_deref().unwrap_or("").contains("connection refused"));
    }

    #[tokio::test]
    async fn script_error_becomes_a_failed_test_entry() {
        let transport = StubTransport::ok(200);
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut request = request("https://api.example.com");
        request.test_script = "frobnicate".to_string();
        let mut scopes = scopes_with(&[]);

        let result = executor.execute(&flat(request), &mut scopes).await;

        assert_eq!(result.status, RequestStatus::Failed);
        let tests = result.tests.expect("tests");
        assert_eq!(tests.failed, 1);
        assert_eq!(tests.tests[0].name, "test script");
    }

    #[tokio::test]
    async fn unresolved_url_blocks_the_send() {
        let transport = StubTransport::ok(200);
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut scopes = scopes_with(&[]);

        let result = executor
            .execute(&flat(request("https://{{host}}/users")), &mut scopes)
            .await;

        assert_eq!(result.status, RequestStatus::Skipped);
        assert!(result.error.as_deref().unwrap_or("").contains("{{host}}"));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn history_receives_one_entry_per_sent_request() {
        let transport = StubTransport::ok(200);
        let history = MemoryHistory::new();
        let executor =
            RequestExecutor::new(&transport, Some(&history), ExecutionSettings::default());
        let mut scopes = scopes_with(&[]);

        executor
            .execute(&flat(request("https://api.example.com")), &mut scopes)
            .await;

        let entries = history.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status.as_deref(), Some("200 Stub"));
        assert_eq!(entries[0].duration_ms, Some(4));
    }

    #[tokio::test]
    async fn test_script_can_read_headers_and_body() {
        let transport = StubTransport::ok(200);
        let executor = RequestExecutor::new(&transport, None, ExecutionSettings::default());
        let mut request = request("https://api.example.com");
        request.test_script = concat!(
            "test \"json\" header Content-Type contains json\n",
            "test \"id\" body contains \"\"id\":7\"\n",
            "set env created_id = 7\n",
        )
        .to_string();
        let mut scopes = scopes_with(&[]);

        let result = executor.execute(&flat(request), &mut scopes).await;

        assert_eq!(result.status, RequestStatus::Passed);
        // Test-script writes are merged for subsequent requests.
        assert_eq!(scopes.lookup("created_id").as_deref(), Some("7"));
    }
}
