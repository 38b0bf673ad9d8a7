//! # Run Reports
//!
//! The result model of a collection run and its two export forms: a verbatim
//! JSON dump (round-trippable) and a human-readable text report grouping
//! iterations and requests with pass/fail coloring. Both are derived purely
//! from the in-memory result; rendering never issues network calls.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::collections::NodeId;
use crate::http::method::HttpMethod;

/// One registered test assertion and how it fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// All test results of one request execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub passed: usize,
    pub failed: usize,
    pub tests: Vec<TestResult>,
}

impl TestSummary {
    pub fn from_tests(tests: Vec<TestResult>) -> Self {
        let passed = tests.iter().filter(|test| test.passed).count();
        Self {
            passed,
            failed: tests.len() - passed,
            tests,
        }
    }
}

/// Outcome of one request execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Passed,
    Failed,
    /// Blocked before sending (unresolved variables); neither passed nor
    /// failed.
    Skipped,
}

/// The record of one executed (or blocked) request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub request_id: NodeId,
    pub request_name: String,
    pub method: HttpMethod,
    pub url: String,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Epoch milliseconds at which execution of this request began.
    pub timestamp: u64,
}

/// All request results of one iteration, plus its data row when the run is
/// data-driven.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: usize,
    pub results: Vec<RunResult>,
    pub passed: usize,
    pub failed: usize,
    pub total_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_row: Option<HashMap<String, String>>,
}

impl IterationResult {
    pub fn new(iteration: usize, data_row: Option<HashMap<String, String>>) -> Self {
        Self {
            iteration,
            results: Vec::new(),
            passed: 0,
            failed: 0,
            total_time_ms: 0,
            data_row,
        }
    }
}

/// Terminal (or in-flight) state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    /// Stop-on-error triggered.
    Failed,
    /// An external cancel signal was observed at a checkpoint.
    Cancelled,
}

/// The one report object a run produces. Created fresh by `run()`, mutated
/// only by the issuing runner, finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRunResult {
    pub collection_id: NodeId,
    pub collection_name: String,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    pub total_requests: usize,
    pub total_passed: usize,
    pub total_failed: usize,
    pub total_time_ms: u64,
    pub iterations: Vec<IterationResult>,
    pub status: RunStatus,
}

impl CollectionRunResult {
    pub fn new(collection_id: NodeId, collection_name: &str) -> Self {
        Self {
            collection_id,
            collection_name: collection_name.to_string(),
            started_at: now_ms(),
            ended_at: None,
            total_requests: 0,
            total_passed: 0,
            total_failed: 0,
            total_time_ms: 0,
            iterations: Vec::new(),
            status: RunStatus::Running,
        }
    }

    /// Verbatim structured dump.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Human-readable report: iterations, requests, and their tests, with
    /// pass/fail coloring when `color` is set.
    pub fn render(&self, color: bool) -> String {
        let paint = Paint::new(color);
        let mut out = String::new();

        let status = match self.status {
            RunStatus::Running => paint.yellow("running"),
            RunStatus::Completed => paint.green("completed"),
            RunStatus::Failed => paint.red("failed"),
            RunStatus::Cancelled => paint.yellow("cancelled"),
        };
        let _ = writeln!(out, "Collection: {} [{status}]", self.collection_name);

        for iteration in &self.iterations {
            let _ = writeln!(
                out,
                "\nIteration {}/{} ({} ms)",
                iteration.iteration + 1,
                self.iterations.len(),
                iteration.total_time_ms
            );
            for result in &iteration.results {
                let mark = match result.status {
                    RequestStatus::Passed => paint.green("✓"),
                    RequestStatus::Failed => paint.red("✗"),
                    RequestStatus::Skipped => paint.yellow("-"),
                };
                let mut line = format!("  {mark} {} {} {}", result.request_name, result.method, result.url);
                if let Some(code) = result.status_code {
                    let _ = write!(line, " [{code}");
                    if let Some(ms) = result.response_time_ms {
                        let _ = write!(line, ", {ms} ms");
                    }
                    line.push(']');
                }
                let _ = writeln!(out, "{line}");
                if let Some(error) = &result.error {
                    let _ = writeln!(out, "      {}", paint.red(error));
                }
                if let Some(tests) = &result.tests {
                    for test in &tests.tests {
                        if test.passed {
                            let _ = writeln!(out, "      {} {}", paint.green("✓"), test.name);
                        } else {
                            let detail = test.error.as_deref().unwrap_or("failed");
                            let _ = writeln!(
                                out,
                                "      {} {}: {}",
                                paint.red("✗"),
                                test.name,
                                paint.red(detail)
                            );
                        }
                    }
                }
            }
        }

        let _ = writeln!(
            out,
            "\nTotals: {} passed, {} failed, {} requests in {} ms",
            paint.green(&self.total_passed.to_string()),
            paint.red(&self.total_failed.to_string()),
            self.total_requests,
            self.total_time_ms
        );
        out
    }
}

/// Epoch milliseconds; the report's timestamp convention.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

struct Paint {
    enabled: bool,
}

impl Paint {
    fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn wrap(&self, code: &str, text: &str) -> String {
        if self.enabled {
            format!("{code}{text}{RESET}")
        } else {
            text.to_string()
        }
    }

    fn green(&self, text: &str) -> String {
        self.wrap(GREEN, text)
    }

    fn red(&self, text: &str) -> String {
        self.wrap(RED, text)
    }

    fn yellow(&self, text: &str) -> String {
        self.wrap(YELLOW, text)
    }
}
