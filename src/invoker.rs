//! Invokable - the single "args in, result out" seam the harness drives
//!
//! Three implementations:
//!
//! - [`ProcessInvoker`]: a child process speaking line-delimited JSON. After a
//!   `{"ready": true}` handshake (or `{"error": "..."}` on load failure) it
//!   answers each `{"args": [...]}` line with `{"ok": value}` or `{"error": "..."}`.
//! - [`FnInvoker`]: an in-process closure run on a blocking thread.
//! - [`RegexInvoker`]: a compiled pattern; invoking it yields `is_match`.

use crate::config::RunnerConfig;
use crate::error::{ForgeError, Result};
use crate::types::ExtractedItem;
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

#[async_trait]
pub trait Invokable: Send + Sync {
    async fn invoke(&self, args: &[Value]) -> Result<Value>;

    /// OS process doing the work, when it is not this one.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Positional arguments for a case input: arrays spread, anything else is one argument.
pub fn as_args(input: &Value) -> Vec<Value> {
    match input {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Everything a factory needs to bring one variant to life
#[derive(Debug, Clone)]
pub struct VariantSource {
    pub id: String,
    pub file: PathBuf,
    pub target: String,
    /// The unit resolved from the variant file
    pub item: ExtractedItem,
}

#[async_trait]
pub trait InvokerFactory: Send + Sync {
    async fn resolve(&self, variant: &VariantSource) -> Result<Box<dyn Invokable>>;
}

/// Spawns one runner process per variant using the configured command table
pub struct ProcessInvokerFactory {
    runner: RunnerConfig,
}

impl ProcessInvokerFactory {
    pub fn new(runner: RunnerConfig) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl InvokerFactory for ProcessInvokerFactory {
    async fn resolve(&self, variant: &VariantSource) -> Result<Box<dyn Invokable>> {
        let argv = self
            .runner
            .command_for(&variant.file, &variant.target)
            .ok_or_else(|| ForgeError::LoadFailure {
                variant: variant.id.clone(),
                reason: format!(
                    "no runner configured for `.{}` files",
                    variant
                        .file
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or("")
                ),
            })?;
        let startup = Duration::from_millis(self.runner.startup_timeout_ms);
        let invoker = ProcessInvoker::spawn(&variant.id, argv, startup).await?;
        Ok(Box::new(invoker))
    }
}

struct Channel {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// Set while a request awaits its response; still set on entry means the
    /// previous call was abandoned and the stream is out of step.
    in_flight: bool,
}

pub struct ProcessInvoker {
    label: String,
    argv: Vec<String>,
    startup: Duration,
    channel: Mutex<Channel>,
    /// Pid of the live child; 0 when unknown
    pid: AtomicU32,
}

impl ProcessInvoker {
    pub async fn spawn(label: &str, argv: Vec<String>, startup: Duration) -> Result<Self> {
        let channel = Self::start(label, &argv, startup).await?;
        log::debug!("runner for `{}` ready", label);
        let pid = channel.child.id().unwrap_or(0);
        Ok(Self {
            label: label.to_string(),
            argv,
            startup,
            channel: Mutex::new(channel),
            pid: AtomicU32::new(pid),
        })
    }

    async fn start(label: &str, argv: &[String], startup: Duration) -> Result<Channel> {
        let load_failure = |reason: String| ForgeError::LoadFailure {
            variant: label.to_string(),
            reason,
        };

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| load_failure("empty runner command".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| load_failure(format!("cannot spawn `{}`: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| load_failure("runner stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| load_failure("runner stdout unavailable".to_string()))?;
        let mut stdout = BufReader::new(stdout).lines();

        let handshake = match tokio::time::timeout(startup, stdout.next_line()).await {
            Err(_) => {
                return Err(load_failure(format!(
                    "runner did not start within {}ms",
                    startup.as_millis()
                )))
            }
            Ok(Err(e)) => return Err(load_failure(format!("runner I/O: {}", e))),
            Ok(Ok(None)) => return Err(load_failure("runner exited before handshake".to_string())),
            Ok(Ok(Some(line))) => line,
        };

        match serde_json::from_str::<Value>(&handshake) {
            Ok(Value::Object(map)) if map.get("ready") == Some(&Value::Bool(true)) => Ok(Channel {
                child,
                stdin,
                stdout,
                in_flight: false,
            }),
            Ok(Value::Object(map)) if map.contains_key("error") => Err(load_failure(
                map.get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown load error")
                    .to_string(),
            )),
            _ => Err(load_failure(format!("unexpected handshake: {}", handshake))),
        }
    }

    async fn exchange(channel: &mut Channel, args: &[Value]) -> Result<Value> {
        let mut request = json!({ "args": args }).to_string();
        request.push('\n');

        channel.in_flight = true;
        channel
            .stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ForgeError::RuntimeFault(format!("runner stdin: {}", e)))?;
        channel
            .stdin
            .flush()
            .await
            .map_err(|e| ForgeError::RuntimeFault(format!("runner stdin: {}", e)))?;

        let line = channel
            .stdout
            .next_line()
            .await
            .map_err(|e| ForgeError::RuntimeFault(format!("runner stdout: {}", e)))?
            .ok_or_else(|| ForgeError::RuntimeFault("runner exited mid-call".to_string()))?;
        channel.in_flight = false;

        parse_response(&line)
    }
}

/// Decode one response line.
pub fn parse_response(line: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| ForgeError::RuntimeFault(format!("malformed runner response: {}", e)))?;
    match value {
        Value::Object(mut map) => {
            if let Some(err) = map.remove("error") {
                let message = match err {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                return Err(ForgeError::RuntimeFault(message));
            }
            map.remove("ok")
                .ok_or_else(|| ForgeError::RuntimeFault(format!("runner response lacks `ok`: {}", line)))
        }
        _ => Err(ForgeError::RuntimeFault(format!(
            "runner response is not an object: {}",
            line
        ))),
    }
}

#[async_trait]
impl Invokable for ProcessInvoker {
    async fn invoke(&self, args: &[Value]) -> Result<Value> {
        let mut channel = self.channel.lock().await;
        if channel.in_flight {
            log::debug!("restarting runner for `{}` after an abandoned call", self.label);
            *channel = Self::start(&self.label, &self.argv, self.startup)
                .await
                .map_err(|e| ForgeError::RuntimeFault(e.to_string()))?;
            self.pid
                .store(channel.child.id().unwrap_or(0), Ordering::Relaxed);
        }
        Self::exchange(&mut channel, args).await
    }

    fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }
}

type HostFn = dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync;

/// In-process callable; a panic inside the closure becomes a runtime fault.
pub struct FnInvoker {
    f: Arc<HostFn>,
}

impl FnInvoker {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl Invokable for FnInvoker {
    async fn invoke(&self, args: &[Value]) -> Result<Value> {
        let f = Arc::clone(&self.f);
        let args = args.to_vec();
        tokio::task::spawn_blocking(move || f(&args))
            .await
            .map_err(|e| ForgeError::RuntimeFault(format!("callable panicked: {}", e)))?
            .map_err(ForgeError::RuntimeFault)
    }
}

/// A compiled pattern target
pub struct RegexInvoker {
    regex: Regex,
}

impl RegexInvoker {
    /// Compile with JS/Python-style flag letters. `g`, `y`, `d`, `u` and `v`
    /// carry no meaning for a single match test and are ignored.
    pub fn compile(pattern: &str, flags: &str) -> std::result::Result<Self, regex::Error> {
        let mut builder = RegexBuilder::new(pattern);
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                _ => {}
            }
        }
        Ok(Self {
            regex: builder.build()?,
        })
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// All non-overlapping matches, as strings.
    pub fn matches(&self, input: &str) -> Vec<String> {
        self.regex
            .find_iter(input)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

#[async_trait]
impl Invokable for RegexInvoker {
    async fn invoke(&self, args: &[Value]) -> Result<Value> {
        match args.first() {
            Some(Value::String(s)) => Ok(Value::Bool(self.regex.is_match(s))),
            Some(other) => Err(ForgeError::RuntimeFault(format!(
                "regex input must be a string, got {}",
                other
            ))),
            None => Err(ForgeError::RuntimeFault("regex input missing".to_string())),
        }
    }
}
