//! # Collection Runner
//!
//! Flattens a collection (or folder) subtree into an ordered request list
//! and drives N iterations over it, applying the inter-request delay,
//! stop-on-error, and cooperative cancellation. Execution within one run is
//! strictly sequential: each request's full pipeline, including any delay,
//! completes before the next request begins, so later requests can rely on
//! variables a prior request's scripts staged. Two runs for different
//! collections share no mutable state; concurrent runs for the *same*
//! collection are intentionally not coordinated here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info};

use crate::collections::{NodeId, TreeReader, flatten};
use crate::datafile::DataFileReader;
use crate::environment::{EnvironmentReader, ScopeChain, VariableWriter};
use crate::error::ValidationError;
use crate::executor::{ExecutionSettings, RequestExecutor};
use crate::history::HistorySink;
use crate::http::client::Transport;
use crate::report::{
    CollectionRunResult, IterationResult, RequestStatus, RunStatus, now_ms,
};

pub const MIN_ITERATIONS: u32 = 1;
pub const MAX_ITERATIONS: u32 = 100;

/// Options for one collection run. Iterations are validated by the caller
/// and defensively revalidated by [`CollectionRunner::run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub environment: Option<String>,
    pub iterations: u32,
    pub delay_ms: u64,
    pub stop_on_error: bool,
    pub folder_id: Option<NodeId>,
    pub data_file: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            environment: None,
            iterations: 1,
            delay_ms: 0,
            stop_on_error: false,
            folder_id: None,
            data_file: None,
        }
    }
}

/// Cooperative cancellation flag. Setting it does not interrupt an in-flight
/// HTTP call or script; it is observed before each request execution (which
/// also covers the gap between iterations). Sticky once set.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Executes collection runs. One runner instance drives one run at a time;
/// the run result it produces is never shared with another run.
pub struct CollectionRunner {
    tree: Arc<dyn TreeReader>,
    environments: Arc<dyn EnvironmentReader>,
    data_files: Arc<dyn DataFileReader>,
    transport: Arc<dyn Transport>,
    history: Option<Arc<dyn HistorySink>>,
    variables_out: Option<Arc<dyn VariableWriter>>,
    settings: ExecutionSettings,
    cancel: CancelHandle,
}

impl CollectionRunner {
    pub fn new(
        tree: Arc<dyn TreeReader>,
        environments: Arc<dyn EnvironmentReader>,
        data_files: Arc<dyn DataFileReader>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            tree,
            environments,
            data_files,
            transport,
            history: None,
            variables_out: None,
            settings: ExecutionSettings::default(),
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_variable_writer(mut self, writer: Arc<dyn VariableWriter>) -> Self {
        self.variables_out = Some(writer);
        self
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// A handle callers may use to cancel this runner's run from another
    /// task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the collection (or the folder selected by `options.folder_id`).
    ///
    /// Only [`ValidationError`] is returned as an error, and only before any
    /// result object exists; every later condition is captured into the
    /// returned report.
    pub async fn run(
        &self,
        collection: NodeId,
        options: RunOptions,
    ) -> Result<CollectionRunResult, ValidationError> {
        if options.iterations < MIN_ITERATIONS || options.iterations > MAX_ITERATIONS {
            return Err(ValidationError::IterationsOutOfRange {
                min: MIN_ITERATIONS,
                max: MAX_ITERATIONS,
                got: options.iterations,
            });
        }

        let subtree = self.tree.subtree(collection, options.folder_id)?;
        let requests = flatten(&subtree);
        if requests.is_empty() {
            return Err(ValidationError::EmptyRequestList);
        }

        let environment = match &options.environment {
            Some(name) => Some(
                self.environments
                    .environment(name)
                    .ok_or_else(|| ValidationError::EnvironmentNotFound(name.clone()))?,
            ),
            None => None,
        };
        let data_file = match &options.data_file {
            Some(id) => Some(
                self.data_files
                    .data_file(id)
                    .ok_or_else(|| ValidationError::DataFileNotFound(id.clone()))?,
            ),
            None => None,
        };
        let iteration_count = match &data_file {
            Some(file) => (options.iterations as usize).min(file.row_count()),
            None => options.iterations as usize,
        };

        info!(
            collection = %subtree.name,
            requests = requests.len(),
            iterations = iteration_count,
            "starting run"
        );

        let mut scopes = ScopeChain::new(environment, self.environments.globals());
        let executor = RequestExecutor::new(
            self.transport.as_ref(),
            self.history.as_deref(),
            self.settings,
        );
        let mut result = CollectionRunResult::new(collection, &subtree.name);
        let last_index = requests.len() - 1;

        for iteration_index in 0..iteration_count {
            let data_row = data_file
                .as_ref()
                .and_then(|file| file.row(iteration_index))
                .cloned();
            scopes.set_data_row(data_row.clone());
            let mut iteration = IterationResult::new(iteration_index, data_row);
            let iteration_started = Instant::now();

            for (index, flat) in requests.iter().enumerate() {
                // Cancellation checkpoint: before each request, which also
                // covers the boundary between iterations.
                if self.cancel.is_cancelled() {
                    debug!(iteration = iteration_index, "cancel observed at checkpoint");
                    close_iteration(&mut result, iteration, iteration_started);
                    self.finalize(&mut result, RunStatus::Cancelled, &scopes, &options);
                    return Ok(result);
                }

                let run_result = executor.execute(flat, &mut scopes).await;
                result.total_requests += 1;
                match run_result.status {
                    RequestStatus::Passed => {
                        iteration.passed += 1;
                        result.total_passed += 1;
                    }
                    RequestStatus::Failed => {
                        iteration.failed += 1;
                        result.total_failed += 1;
                    }
                    RequestStatus::Skipped => {}
                }
                let failed = run_result.status == RequestStatus::Failed;
                iteration.results.push(run_result);

                if options.stop_on_error && failed {
                    debug!(iteration = iteration_index, request = index, "stop-on-error");
                    close_iteration(&mut result, iteration, iteration_started);
                    self.finalize(&mut result, RunStatus::Failed, &scopes, &options);
                    return Ok(result);
                }

                // Delay applies between requests, never after the last one.
                if options.delay_ms > 0 && index != last_index {
                    sleep(Duration::from_millis(options.delay_ms)).await;
                }
            }

            close_iteration(&mut result, iteration, iteration_started);
        }

        self.finalize(&mut result, RunStatus::Completed, &scopes, &options);
        Ok(result)
    }

    /// Terminal bookkeeping, applied exactly once per run: status, end time,
    /// and the deferred persistence of staged variable writes.
    fn finalize(
        &self,
        result: &mut CollectionRunResult,
        status: RunStatus,
        scopes: &ScopeChain,
        options: &RunOptions,
    ) {
        result.status = status;
        result.ended_at = Some(now_ms());
        if let Some(writer) = &self.variables_out {
            writer.persist(
                options.environment.as_deref(),
                scopes.env_overlay(),
                scopes.collection_overlay(),
            );
        }
        info!(
            status = ?status,
            requests = result.total_requests,
            passed = result.total_passed,
            failed = result.total_failed,
            "run finished"
        );
    }
}

/// Fold a finished (or partially executed) iteration into the overall
/// result. Partial iterations with no results are dropped so a cancel
/// between iterations leaves exactly the completed ones.
fn close_iteration(
    result: &mut CollectionRunResult,
    mut iteration: IterationResult,
    started: Instant,
) {
    iteration.total_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if iteration.results.is_empty() {
        return;
    }
    result.total_time_ms += iteration.total_time_ms;
    result.iterations.push(iteration);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::auth::AuthMethod;
    use crate::collections::{
        Collection, CollectionItem, ROOT_COLLECTION_ID, RequestDefinition, Subtree,
    };
    use crate::datafile::DataFile;
    use crate::environment::{Environment, Variable};
    use crate::error::TransportError;
    use crate::http::method::HttpMethod;
    use crate::http::request::ResolvedRequest;
    use crate::http::response::{HttpResponse, TimingBreakdown};

    struct StubTree(Collection);

    impl TreeReader for StubTree {
        fn subtree(
            &self,
            collection: NodeId,
            folder: Option<NodeId>,
        ) -> Result<Subtree, ValidationError> {
            if collection != ROOT_COLLECTION_ID {
                return Err(ValidationError::CollectionNotFound(collection));
            }
            self.0.subtree(folder).ok_or_else(|| {
                ValidationError::FolderNotFound(
                    folder.map(|id| id.to_string()).unwrap_or_default(),
                )
            })
        }
    }

    #[derive(Default)]
    struct StubEnv {
        environments: Vec<Environment>,
        globals: Vec<Variable>,
    }

    impl EnvironmentReader for StubEnv {
        fn environment(&self, name: &str) -> Option<Environment> {
            self.environments.iter().find(|env| env.name == name).cloned()
        }

        fn globals(&self) -> Vec<Variable> {
            self.globals.clone()
        }
    }

    #[derive(Default)]
    struct StubData {
        files: HashMap<String, DataFile>,
    }

    impl DataFileReader for StubData {
        fn data_file(&self, id: &str) -> Option<DataFile> {
            self.files.get(id).cloned()
        }
    }

    #[derive(Default)]
    struct CaptureWriter {
        calls: Mutex<Vec<(Option<String>, HashMap<String, String>)>>,
    }

    impl VariableWriter for CaptureWriter {
        fn persist(
            &self,
            environment: Option<&str>,
            env_overlay: &HashMap<String, String>,
            _collection_overlay: &HashMap<String, String>,
        ) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((environment.map(str::to_string), env_overlay.clone()));
            }
        }
    }

    /// Responds 200 to every URL except those containing `/fail`, which get
    /// a 500. Optionally trips a cancel handle after N sends.
    #[derive(Default)]
    struct StubTransport {
        sent: Mutex<Vec<String>>,
        cancel_after: Option<(usize, CancelHandle)>,
    }

    impl StubTransport {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn send(&self, request: &ResolvedRequest) -> Result<HttpResponse, TransportError> {
            let count = {
                let mut sent = self.sent.lock().unwrap();
                sent.push(request.url.clone());
                sent.len()
            };
            if let Some((after, handle)) = &self.cancel_after {
                if count >= *after {
                    handle.cancel();
                }
            }
            let (status_code, status_text) = if request.url.contains("/fail") {
                (500, "Internal Server Error")
            } else {
                (200, "OK")
            };
            Ok(HttpResponse {
                status_code,
                status_text: status_text.to_string(),
                headers: Vec::new(),
                body: "{}".to_string(),
                timing: TimingBreakdown {
                    headers_ms: 1,
                    body_ms: 1,
                    total_ms: 2,
                },
                size_bytes: 2,
            })
        }
    }

    fn request_item(name: &str, url: &str, test_script: &str) -> CollectionItem {
        CollectionItem::Request(RequestDefinition {
            id: 0,
            name: name.to_string(),
            method: HttpMethod::Get,
            url: url.to_string(),
            params: String::new(),
            headers: String::new(),
            body: String::new(),
            auth: AuthMethod::None,
            pre_request_script: String::new(),
            test_script: test_script.to_string(),
        })
    }

    fn collection(items: Vec<CollectionItem>) -> Collection {
        let mut collection = Collection {
            name: "api".to_string(),
            variables: HashMap::new(),
            items,
        };
        collection.assign_ids();
        collection
    }

    fn runner(collection: Collection, transport: Arc<StubTransport>) -> CollectionRunner {
        CollectionRunner::new(
            Arc::new(StubTree(collection)),
            Arc::new(StubEnv::default()),
            Arc::new(StubData::default()),
            transport,
        )
    }

    fn two_requests() -> Collection {
        collection(vec![
            request_item("first", "https://example.com/a", ""),
            request_item("second", "https://example.com/b", ""),
        ])
    }

    #[tokio::test]
    async fn totals_cover_requests_times_iterations() {
        let transport = Arc::new(StubTransport::default());
        let runner = runner(two_requests(), transport.clone());

        let options = RunOptions {
            iterations: 3,
            ..RunOptions::default()
        };
        let result = runner.run(ROOT_COLLECTION_ID, options).await.expect("run");

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.iterations.len(), 3);
        assert_eq!(result.total_requests, 6);
        assert_eq!(result.total_passed, 6);
        assert_eq!(result.total_failed, 0);
        assert!(result.ended_at.is_some());
        assert_eq!(transport.sent().len(), 6);
    }

    #[tokio::test]
    async fn stop_on_error_truncates_at_the_failure() {
        let transport = Arc::new(StubTransport::default());
        let runner = runner(
            collection(vec![
                request_item("ok", "https://example.com/a", ""),
                request_item("broken", "https://example.com/fail", ""),
                request_item("never", "https://example.com/b", ""),
            ]),
            transport.clone(),
        );

        let options = RunOptions {
            iterations: 2,
            stop_on_error: true,
            ..RunOptions::default()
        };
        let result = runner.run(ROOT_COLLECTION_ID, options).await.expect("run");

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.iterations.len(), 1);
        assert_eq!(result.iterations[0].results.len(), 2);
        assert_eq!(result.total_requests, 2);
        assert_eq!(result.total_failed, 1);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn failures_without_stop_on_error_run_to_completion() {
        let transport = Arc::new(StubTransport::default());
        let runner = runner(
            collection(vec![
                request_item("broken", "https://example.com/fail", ""),
                request_item("ok", "https://example.com/a", ""),
            ]),
            transport.clone(),
        );

        let result = runner
            .run(ROOT_COLLECTION_ID, RunOptions::default())
            .await
            .expect("run");

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.total_failed, 1);
        assert_eq!(result.total_passed, 1);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn cancel_keeps_only_completed_iterations() {
        let mut transport = StubTransport::default();
        let cancel = CancelHandle::default();
        // Trip the flag during the last request of iteration one; the
        // checkpoint before iteration two's first request observes it.
        transport.cancel_after = Some((2, cancel.clone()));
        let transport = Arc::new(transport);

        let mut runner = runner(two_requests(), transport.clone());
        runner.cancel = cancel;

        let options = RunOptions {
            iterations: 3,
            ..RunOptions::default()
        };
        let result = runner.run(ROOT_COLLECTION_ID, options).await.expect("run");

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.iterations.len(), 1);
        assert_eq!(result.iterations[0].results.len(), 2);
        assert_eq!(result.total_requests, 2);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn delay_applies_between_requests_only() {
        let transport = Arc::new(StubTransport::default());
        let runner = runner(
            collection(vec![
                request_item("a", "https://example.com/a", ""),
                request_item("b", "https://example.com/b", ""),
                request_item("c", "https://example.com/c", ""),
            ]),
            transport,
        );

        let options = RunOptions {
            delay_ms: 20,
            ..RunOptions::default()
        };
        let started = Instant::now();
        let result = runner.run(ROOT_COLLECTION_ID, options).await.expect("run");

        // Two gaps of 20ms between three requests.
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(result.total_requests, 3);
    }

    #[tokio::test]
    async fn data_file_caps_iterations_and_binds_rows() {
        let transport = Arc::new(StubTransport::default());
        let mut data = StubData::default();
        data.files.insert(
            "users".to_string(),
            DataFile {
                rows: vec![
                    [("host".to_string(), "one.example.com".to_string())].into(),
                    [("host".to_string(), "two.example.com".to_string())].into(),
                ],
            },
        );
        let runner = CollectionRunner::new(
            Arc::new(StubTree(collection(vec![request_item(
                "get",
                "https://{{host}}/x",
                "",
            )]))),
            Arc::new(StubEnv::default()),
            Arc::new(data),
            transport.clone(),
        );

        let options = RunOptions {
            iterations: 5,
            data_file: Some("users".to_string()),
            ..RunOptions::default()
        };
        let result = runner.run(ROOT_COLLECTION_ID, options).await.expect("run");

        assert_eq!(result.iterations.len(), 2);
        assert_eq!(
            transport.sent(),
            vec![
                "https://one.example.com/x".to_string(),
                "https://two.example.com/x".to_string(),
            ]
        );
        assert!(result.iterations[0].data_row.is_some());
    }

    #[tokio::test]
    async fn environment_supplies_variables() {
        let transport = Arc::new(StubTransport::default());
        let runner = CollectionRunner::new(
            Arc::new(StubTree(collection(vec![request_item(
                "get",
                "https://{{host}}/x",
                "",
            )]))),
            Arc::new(StubEnv {
                environments: vec![Environment {
                    name: "dev".to_string(),
                    variables: vec![Variable::new("host", "dev.example.com")],
                }],
                globals: Vec::new(),
            }),
            Arc::new(StubData::default()),
            transport.clone(),
        );

        let options = RunOptions {
            environment: Some("dev".to_string()),
            ..RunOptions::default()
        };
        runner.run(ROOT_COLLECTION_ID, options).await.expect("run");

        assert_eq!(transport.sent(), vec!["https://dev.example.com/x".to_string()]);
    }

    #[tokio::test]
    async fn staged_writes_carry_across_requests_and_persist() {
        let transport = Arc::new(StubTransport::default());
        let writer = Arc::new(CaptureWriter::default());
        let runner = CollectionRunner::new(
            Arc::new(StubTree(collection(vec![
                request_item(
                    "login",
                    "https://example.com/login",
                    "set env token = abc123",
                ),
                request_item("me", "https://example.com/me/{{token}}", ""),
            ]))),
            Arc::new(StubEnv {
                environments: vec![Environment {
                    name: "dev".to_string(),
                    variables: Vec::new(),
                }],
                globals: Vec::new(),
            }),
            Arc::new(StubData::default()),
            transport.clone(),
        )
        .with_variable_writer(writer.clone());

        let options = RunOptions {
            environment: Some("dev".to_string()),
            ..RunOptions::default()
        };
        let result = runner.run(ROOT_COLLECTION_ID, options).await.expect("run");

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            transport.sent()[1],
            "https://example.com/me/abc123".to_string()
        );
        let calls = writer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_deref(), Some("dev"));
        assert_eq!(calls[0].1.get("token").map(String::as_str), Some("abc123"));
    }

    #[tokio::test]
    async fn rejects_out_of_range_iterations() {
        let transport = Arc::new(StubTransport::default());
        let runner = runner(two_requests(), transport);

        for iterations in [0, 101] {
            let options = RunOptions {
                iterations,
                ..RunOptions::default()
            };
            let err = runner
                .run(ROOT_COLLECTION_ID, options)
                .await
                .expect_err("out of range");
            assert!(matches!(
                err,
                ValidationError::IterationsOutOfRange { got, .. } if got == iterations
            ));
        }
    }

    #[tokio::test]
    async fn rejects_empty_request_lists() {
        let transport = Arc::new(StubTransport::default());
        let runner = runner(collection(Vec::new()), transport);

        let err = runner
            .run(ROOT_COLLECTION_ID, RunOptions::default())
            .await
            .expect_err("empty");
        assert!(matches!(err, ValidationError::EmptyRequestList));
    }

    #[tokio::test]
    async fn rejects_unknown_environment_and_data_file() {
        let transport = Arc::new(StubTransport::default());
        let runner = runner(two_requests(), transport);

        let err = runner
            .run(
                ROOT_COLLECTION_ID,
                RunOptions {
                    environment: Some("missing".to_string()),
                    ..RunOptions::default()
                },
            )
            .await
            .expect_err("unknown environment");
        assert!(matches!(err, ValidationError::EnvironmentNotFound(name) if name == "missing"));

        let err = runner
            .run(
                ROOT_COLLECTION_ID,
                RunOptions {
                    data_file: Some("missing".to_string()),
                    ..RunOptions::default()
                },
            )
            .await
            .expect_err("unknown data file");
        assert!(matches!(err, ValidationError::DataFileNotFound(name) if name == "missing"));
    }
}
