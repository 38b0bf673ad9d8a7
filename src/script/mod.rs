//! # Script Sandbox
//!
//! Executes user-authored pre-request and test scripts in a restricted
//! interpreter. A script sees exactly four capabilities: variable reads via
//! `{{name}}` interpolation, staged variable writes, a snapshot of the
//! pending request (or the captured response in the test phase), and console
//! logging. It has no access to the host process, filesystem, network, other
//! requests, or other runs, and every invocation runs under a wall-clock
//! deadline checked before each statement.
//!
//! Script language, one statement per line (`#` starts a comment):
//!
//! ```text
//! set env token = {{base}}-suffix
//! set collection count = 3
//! log resolved {{token}}
//! test "created" status == 201
//! test "fast enough" time < 500
//! test "has json" header Content-Type contains json
//! test "user id present" var user_id exists
//! repeat 3
//!     set env n = {{n}}x
//! end
//! ```
//!
//! Subjects: `status`, `time`, `size`, `body`, `header NAME`, `var NAME`,
//! `request.method|url|body|name`. Operators: `==`, `!=`, `<`, `<=`, `>`,
//! `>=`, `contains`, `exists`. Response subjects are only available in the
//! test phase and only when a response was captured.
//!
//! Side effects never touch shared state: variable writes come back as
//! [`StagedUpdates`] and the caller decides when to merge them.

use std::time::{Duration, Instant};

use crate::environment::{ScopeChain, StagedUpdates, resolve_tokens};
use crate::error::ScriptError;
use crate::http::method::HttpMethod;
use crate::http::response::HttpResponse;
use crate::report::TestResult;

/// Which pipeline phase is running the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    PreRequest,
    Test,
}

/// Read-only snapshot of the request a script may inspect. Raw fields in the
/// pre-request phase, resolved fields in the test phase.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub name: &'a str,
    pub method: HttpMethod,
    pub url: &'a str,
    pub body: &'a str,
}

/// Everything a script invocation is allowed to observe.
#[derive(Debug, Clone, Copy)]
pub struct ScriptInput<'a> {
    pub phase: ScriptPhase,
    pub request: RequestView<'a>,
    pub response: Option<&'a HttpResponse>,
    pub scopes: &'a ScopeChain,
}

/// The complete result of one script invocation. A script error carries
/// everything accumulated before the failing statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutcome {
    pub tests: Vec<TestResult>,
    pub staged: StagedUpdates,
    pub console: Vec<String>,
    pub error: Option<ScriptError>,
}

/// One sandboxed script evaluator with a fixed per-invocation timeout.
#[derive(Debug, Clone, Copy)]
pub struct Sandbox {
    timeout: Duration,
}

impl Sandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `source` to completion, error, or deadline. Never panics and
    /// never raises: every failure is captured in the outcome.
    pub fn run(&self, source: &str, input: &ScriptInput<'_>) -> ScriptOutcome {
        let mut outcome = ScriptOutcome::default();
        if source.trim().is_empty() {
            return outcome;
        }

        let program = match parse(source) {
            Ok(program) => program,
            Err(err) => {
                outcome.error = Some(err);
                return outcome;
            }
        };

        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let mut exec = Exec {
            input,
            staged: StagedUpdates::default(),
            tests: Vec::new(),
            console: Vec::new(),
            deadline: Instant::now() + self.timeout,
            timeout_ms,
        };
        let result = exec.run_block(&program);

        outcome.tests = exec.tests;
        outcome.staged = exec.staged;
        outcome.console = exec.console;
        if let Err(err) = result {
            outcome.error = Some(err);
        }
        outcome
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Set {
        target: VarTarget,
        key: String,
        value: String,
    },
    Log {
        text: String,
    },
    Test {
        name: String,
        check: Check,
        line: usize,
    },
    Repeat {
        count: u64,
        body: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarTarget {
    Environment,
    Collection,
}

#[derive(Debug, Clone, PartialEq)]
struct Check {
    subject: Subject,
    op: Op,
    operand: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Subject {
    Status,
    Time,
    Size,
    Body,
    Header(String),
    Var(String),
    RequestField(RequestField),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestField {
    Method,
    Url,
    Body,
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    Exists,
}

fn parse(source: &str) -> Result<Vec<Stmt>, ScriptError> {
    let lines: Vec<(usize, &str)> = source
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .collect();
    let mut pos = 0;
    parse_block(&lines, &mut pos, None)
}

fn parse_block(
    lines: &[(usize, &str)],
    pos: &mut usize,
    repeat_opened_at: Option<usize>,
) -> Result<Vec<Stmt>, ScriptError> {
    let mut stmts = Vec::new();

    while *pos < lines.len() {
        let (line_no, line) = lines[*pos];
        *pos += 1;

        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "end" {
            if repeat_opened_at.is_some() {
                return Ok(stmts);
            }
            return Err(parse_err(line_no, "`end` without a matching `repeat`"));
        }

        let (word, rest) = next_token(line);
        match word {
            "set" => stmts.push(parse_set(rest, line_no)?),
            "log" => stmts.push(Stmt::Log {
                text: rest.trim().to_string(),
            }),
            "test" => stmts.push(parse_test(rest, line_no)?),
            "repeat" => {
                let (count_token, trailing) = next_token(rest.trim());
                if !trailing.trim().is_empty() {
                    return Err(parse_err(line_no, "unexpected text after repeat count"));
                }
                let count: u64 = count_token
                    .parse()
                    .map_err(|_| parse_err(line_no, "repeat expects a whole-number count"))?;
                let body = parse_block(lines, pos, Some(line_no))?;
                stmts.push(Stmt::Repeat { count, body });
            }
            other => {
                return Err(parse_err(
                    line_no,
                    &format!("unknown statement `{other}` (expected set, log, test, or repeat)"),
                ));
            }
        }
    }

    if let Some(opened_at) = repeat_opened_at {
        return Err(parse_err(
            opened_at,
            "`repeat` is missing its closing `end`",
        ));
    }
    Ok(stmts)
}

fn parse_set(rest: &str, line_no: usize) -> Result<Stmt, ScriptError> {
    let (lhs, value) = rest
        .split_once('=')
        .ok_or_else(|| parse_err(line_no, "set expects `set env|collection KEY = VALUE`"))?;
    let mut lhs_tokens = lhs.split_whitespace();
    let target = match lhs_tokens.next() {
        Some("env") => VarTarget::Environment,
        Some("collection") => VarTarget::Collection,
        _ => {
            return Err(parse_err(
                line_no,
                "set target must be `env` or `collection`",
            ));
        }
    };
    let key = lhs_tokens
        .next()
        .ok_or_else(|| parse_err(line_no, "set is missing a variable name"))?;
    if lhs_tokens.next().is_some() {
        return Err(parse_err(line_no, "set variable names cannot contain spaces"));
    }

    Ok(Stmt::Set {
        target,
        key: key.to_string(),
        value: value.trim().to_string(),
    })
}

fn parse_test(rest: &str, line_no: usize) -> Result<Stmt, ScriptError> {
    let rest = rest.trim_start();
    let Some(after_open) = rest.strip_prefix('"') else {
        return Err(parse_err(line_no, "test expects a quoted name"));
    };
    let Some(close) = after_open.find('"') else {
        return Err(parse_err(line_no, "test name is missing its closing quote"));
    };
    let name = &after_open[..close];
    if name.is_empty() {
        return Err(parse_err(line_no, "test name cannot be empty"));
    }
    let rest = after_open[close + 1..].trim_start();

    let (subject, rest) = parse_subject(rest, line_no)?;
    let (op_token, rest) = next_token(rest.trim_start());
    let op = match op_token {
        "==" => Op::Eq,
        "!=" => Op::Ne,
        "<" => Op::Lt,
        "<=" => Op::Le,
        ">" => Op::Gt,
        ">=" => Op::Ge,
        "contains" => Op::Contains,
        "exists" => Op::Exists,
        "" => return Err(parse_err(line_no, "test is missing an operator")),
        other => {
            return Err(parse_err(line_no, &format!("unknown operator `{other}`")));
        }
    };

    let operand_raw = rest.trim();
    let operand = match op {
        Op::Exists => {
            if !operand_raw.is_empty() {
                return Err(parse_err(line_no, "`exists` takes no operand"));
            }
            None
        }
        _ => {
            if operand_raw.is_empty() {
                return Err(parse_err(line_no, "comparison is missing its operand"));
            }
            Some(unquote(operand_raw).to_string())
        }
    };

    Ok(Stmt::Test {
        name: name.to_string(),
        check: Check {
            subject,
            op,
            operand,
        },
        line: line_no,
    })
}

fn parse_subject<'a>(rest: &'a str, line_no: usize) -> Result<(Subject, &'a str), ScriptError> {
    let (token, rest) = next_token(rest);
    let subject = match token {
        "status" => Subject::Status,
        "time" => Subject::Time,
        "size" => Subject::Size,
        "body" => Subject::Body,
        "header" => {
            let (name, rest) = next_token(rest.trim_start());
            if name.is_empty() {
                return Err(parse_err(line_no, "`header` needs a header name"));
            }
            return Ok((Subject::Header(name.to_string()), rest));
        }
        "var" => {
            let (name, rest) = next_token(rest.trim_start());
            if name.is_empty() {
                return Err(parse_err(line_no, "`var` needs a variable name"));
            }
            return Ok((Subject::Var(name.to_string()), rest));
        }
        "request.method" => Subject::RequestField(RequestField::Method),
        "request.url" => Subject::RequestField(RequestField::Url),
        "request.body" => Subject::RequestField(RequestField::Body),
        "request.name" => Subject::RequestField(RequestField::Name),
        "" => return Err(parse_err(line_no, "test is missing a subject")),
        other => {
            return Err(parse_err(line_no, &format!("unknown subject `{other}`")));
        }
    };
    Ok((subject, rest))
}

fn next_token(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest),
        None => (text, ""),
    }
}

fn unquote(text: &str) -> &str {
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        &text[1..text.len() - 1]
    } else {
        text
    }
}

fn parse_err(line: usize, message: &str) -> ScriptError {
    ScriptError::Parse {
        line,
        message: message.to_string(),
    }
}

fn runtime_err(line: usize, message: String) -> ScriptError {
    ScriptError::Runtime { line, message }
}

struct Exec<'a> {
    input: &'a ScriptInput<'a>,
    staged: StagedUpdates,
    tests: Vec<TestResult>,
    console: Vec<String>,
    deadline: Instant,
    timeout_ms: u64,
}

impl Exec<'_> {
    fn run_block(&mut self, stmts: &[Stmt]) -> Result<(), ScriptError> {
        for stmt in stmts {
            self.check_deadline()?;
            match stmt {
                Stmt::Set { target, key, value } => {
                    let value = self.interpolate(value);
                    let map = match target {
                        VarTarget::Environment => &mut self.staged.environment,
                        VarTarget::Collection => &mut self.staged.collection,
                    };
                    map.insert(key.clone(), value);
                }
                Stmt::Log { text } => {
                    let text = self.interpolate(text);
                    self.console.push(text);
                }
                Stmt::Test { name, check, line } => {
                    let (passed, error) = self.evaluate(check, *line)?;
                    self.tests.push(TestResult {
                        name: name.clone(),
                        passed,
                        error,
                    });
                }
                Stmt::Repeat { count, body } => {
                    for _ in 0..*count {
                        self.check_deadline()?;
                        self.run_block(body)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_deadline(&self) -> Result<(), ScriptError> {
        if Instant::now() >= self.deadline {
            return Err(ScriptError::Timeout(self.timeout_ms));
        }
        Ok(())
    }

    /// Script-local staged writes shadow the run's scope chain.
    fn lookup(&self, key: &str) -> Option<String> {
        self.staged
            .environment
            .get(key)
            .or_else(|| self.staged.collection.get(key))
            .cloned()
            .or_else(|| self.input.scopes.lookup(key))
    }

    fn interpolate(&self, text: &str) -> String {
        resolve_tokens(text, |key| self.lookup(key))
    }

    fn response(&self, subject: &str, line: usize) -> Result<&HttpResponse, ScriptError> {
        if self.input.phase != ScriptPhase::Test {
            return Err(runtime_err(
                line,
                format!("`{subject}` is only available in test scripts"),
            ));
        }
        self.input
            .response
            .ok_or_else(|| runtime_err(line, "no response was captured".to_string()))
    }

    /// Evaluate one check. `Err` means the script itself is broken (wrong
    /// phase, non-numeric comparison); a plain failed assertion comes back
    /// as `Ok((false, message))`.
    fn evaluate(&self, check: &Check, line: usize) -> Result<(bool, Option<String>), ScriptError> {
        let actual: Option<String> = match &check.subject {
            Subject::Status => Some(self.response("status", line)?.status_code.to_string()),
            Subject::Time => Some(self.response("time", line)?.timing.total_ms.to_string()),
            Subject::Size => Some(self.response("size", line)?.size_bytes.to_string()),
            Subject::Body => Some(self.response("body", line)?.body.clone()),
            Subject::Header(name) => self
                .response("header", line)?
                .header(name)
                .map(str::to_string),
            Subject::Var(name) => self.lookup(name),
            Subject::RequestField(field) => Some(match field {
                RequestField::Method => self.input.request.method.to_string(),
                RequestField::Url => self.input.request.url.to_string(),
                RequestField::Body => self.input.request.body.to_string(),
                RequestField::Name => self.input.request.name.to_string(),
            }),
        };
        let subject_desc = describe_subject(&check.subject);

        if check.op == Op::Exists {
            return Ok(match actual {
                Some(_) => (true, None),
                None => (false, Some(format!("{subject_desc} does not exist"))),
            });
        }

        // Operand is required for every non-exists operator by the parser.
        let operand = self.interpolate(check.operand.as_deref().unwrap_or_default());
        let Some(actual) = actual else {
            return Ok((false, Some(format!("{subject_desc} does not exist"))));
        };

        let passed = match check.op {
            Op::Eq => actual == operand,
            Op::Ne => actual != operand,
            Op::Contains => actual.contains(&operand),
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let lhs: f64 = actual.trim().parse().map_err(|_| {
                    runtime_err(line, format!("{subject_desc} value `{actual}` is not a number"))
                })?;
                let rhs: f64 = operand.trim().parse().map_err(|_| {
                    runtime_err(line, format!("operand `{operand}` is not a number"))
                })?;
                match check.op {
                    Op::Lt => lhs < rhs,
                    Op::Le => lhs <= rhs,
                    Op::Gt => lhs > rhs,
                    _ => lhs >= rhs,
                }
            }
            Op::Exists => unreachable!("handled above"),
        };

        if passed {
            Ok((true, None))
        } else {
            let shown = preview(&actual);
            Ok((
                false,
                Some(format!(
                    "expected {subject_desc} {} {operand}, got {shown}",
                    op_label(check.op)
                )),
            ))
        }
    }
}

fn describe_subject(subject: &Subject) -> String {
    match subject {
        Subject::Status => "status".to_string(),
        Subject::Time => "time".to_string(),
        Subject::Size => "size".to_string(),
        Subject::Body => "body".to_string(),
        Subject::Header(name) => format!("header {name}"),
        Subject::Var(name) => format!("var {name}"),
        Subject::RequestField(RequestField::Method) => "request.method".to_string(),
        Subject::RequestField(RequestField::Url) => "request.url".to_string(),
        Subject::RequestField(RequestField::Body) => "request.body".to_string(),
        Subject::RequestField(RequestField::Name) => "request.name".to_string(),
    }
}

fn op_label(op: Op) -> &'static str {
    match op {
        Op::Eq => "==",
        Op::Ne => "!=",
        Op::Lt => "<",
        Op::Le => "<=",
        Op::Gt => ">",
        Op::Ge => ">=",
        Op::Contains => "contains",
        Op::Exists => "exists",
    }
}

/// Bodies can be arbitrarily large; failure messages show a prefix.
fn preview(value: &str) -> String {
    const MAX: usize = 120;
    if value.len() <= MAX {
        value.to_string()
    } else {
        let cut = value
            .char_indices()
            .take_while(|(index, _)| *index < MAX)
            .last()
            .map_or(0, |(index, ch)| index + ch.len_utf8());
        format!("{}…", &value[..cut])
    }
}
