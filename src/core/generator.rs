//! Content generator interface and the external-command adapter.
//!
//! The generator is untrusted and non-deterministic: it may be slow, refuse,
//! return garbage or panic. The engine only ever sees `Result` values from it.

use std::{
    io::{Read, Write},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::instruction::EditInstruction;

/// Generator failure modes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("generator timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed generator output: {0}")]
    Malformed(String),
    #[error("generator refused: {0}")]
    Refused(String),
    #[error("generator failed: {0}")]
    Failed(String),
    #[error("generator panicked")]
    Panicked,
}

/// Successful generator answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    /// Full replacement content for the file
    Updated { content: String, reason: Option<String> },
    /// Nothing to do for this instruction
    NoChange { reason: String },
}

/// Answer to "is this instruction already applied here?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub already_applied: bool,
    pub reason: String,
}

/// External content-generation capability
pub trait EditGenerator: Send + Sync {
    /// Produce new whole-file content for `instruction` applied to `content`.
    fn generate(
        &self,
        content: &str,
        instruction: &EditInstruction,
    ) -> Result<Generation, GenerationError>;

    /// Optional deep check used by the idempotency gate once a marker has
    /// been found. `Ok(None)` means verification is not supported.
    fn verify(
        &self,
        _content: &str,
        _instruction: &EditInstruction,
        _marker: &str,
    ) -> Result<Option<Verdict>, GenerationError> {
        Ok(None)
    }
}

/// Run `f` on a helper thread and wait at most `timeout`.
///
/// On timeout the helper is abandoned (it finishes in the background and its
/// answer is dropped). A panic inside `f` becomes `GenerationError::Panicked`.
pub fn run_with_deadline<T, F>(timeout: Option<Duration>, f: F) -> Result<T, GenerationError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GenerationError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("tagsafe-generator".into())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| GenerationError::Failed(format!("spawn generator thread: {e}")))?;

    let received = match timeout {
        Some(limit) => rx.recv_timeout(limit).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => GenerationError::Timeout(limit),
            mpsc::RecvTimeoutError::Disconnected => GenerationError::Panicked,
        }),
        None => rx.recv().map_err(|_| GenerationError::Panicked),
    };
    received?
}

/// `generate` with an optional deadline
pub fn generate_with_timeout(
    generator: &Arc<dyn EditGenerator>,
    content: &str,
    instruction: &EditInstruction,
    timeout: Option<Duration>,
) -> Result<Generation, GenerationError> {
    let generator = Arc::clone(generator);
    let content = content.to_string();
    let instruction = instruction.clone();
    run_with_deadline(timeout, move || generator.generate(&content, &instruction))
}

/// `verify` with an optional deadline
pub fn verify_with_timeout(
    generator: &Arc<dyn EditGenerator>,
    content: &str,
    instruction: &EditInstruction,
    marker: &str,
    timeout: Option<Duration>,
) -> Result<Option<Verdict>, GenerationError> {
    let generator = Arc::clone(generator);
    let content = content.to_string();
    let instruction = instruction.clone();
    let marker = marker.to_string();
    run_with_deadline(timeout, move || {
        generator.verify(&content, &instruction, &marker)
    })
}

/// Request written to the external command's stdin
#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    mode: &'static str,
    file_path: &'a std::path::Path,
    content: &'a str,
    instruction: &'a EditInstruction,
    #[serde(skip_serializing_if = "Option::is_none")]
    marker: Option<&'a str>,
}

/// Generate response shape (matches what the tagging LLM prompt asks for)
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    applied: bool,
    #[serde(default)]
    updated_file: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    refused: bool,
}

/// Verify response shape
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    already_tagged: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Generator backed by an external program speaking JSON over stdio.
///
/// With a timeout set, the child runs in its own process group and the whole
/// group is killed once the deadline passes.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    /// Kill the child if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn invoke(&self, request: &CommandRequest<'_>) -> Result<String, GenerationError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| GenerationError::Failed(format!("encode request: {e}")))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(|e| {
            GenerationError::Failed(format!("spawn {}: {e}", self.program.display()))
        })?;

        // stdin and both output pipes are serviced off-thread while we poll
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GenerationError::Failed("child stdin unavailable".into()))?;
        let writer = thread::spawn(move || stdin.write_all(&payload));
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let Some(status) = wait_until(&mut child, self.timeout)? else {
            kill_group(&mut child);
            let limit = self.timeout.unwrap_or_default();
            warn!(program = %self.program.display(), ?limit, "generator killed after deadline");
            return Err(GenerationError::Timeout(limit));
        };
        if let Ok(Err(e)) = writer.join() {
            debug!(error = %e, "generator closed stdin early");
        }
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(GenerationError::Failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                status,
                stderr.trim()
            )));
        }
        String::from_utf8(stdout).map_err(|_| GenerationError::Malformed("stdout is not UTF-8".into()))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Exit status, or `None` once `timeout` has elapsed with the child still running.
fn wait_until(child: &mut Child, timeout: Option<Duration>) -> Result<Option<ExitStatus>, GenerationError> {
    let wait_err = |e: std::io::Error| GenerationError::Failed(format!("wait for generator: {e}"));
    let Some(limit) = timeout else {
        return child.wait().map(Some).map_err(wait_err);
    };
    let deadline = Instant::now() + limit;
    loop {
        match child.try_wait().map_err(wait_err)? {
            Some(status) => return Ok(Some(status)),
            None if Instant::now() >= deadline => return Ok(None),
            None => thread::sleep(Duration::from_millis(10)),
        }
    }
}

/// Kill the child and anything it spawned, then reap it.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Ok(pid) = libc::pid_t::try_from(child.id()) {
        // negative pid targets the process group created at spawn
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

impl EditGenerator for CommandGenerator {
    fn generate(
        &self,
        content: &str,
        instruction: &EditInstruction,
    ) -> Result<Generation, GenerationError> {
        let stdout = self.invoke(&CommandRequest {
            mode: "generate",
            file_path: &instruction.file_path,
            content,
            instruction,
            marker: None,
        })?;
        let value = extract_json(&stdout)
            .ok_or_else(|| GenerationError::Malformed("no JSON object in output".into()))?;
        let resp: GenerateResponse =
            serde_json::from_value(value).map_err(|e| GenerationError::Malformed(e.to_string()))?;

        if resp.refused {
            return Err(GenerationError::Refused(
                resp.reason.unwrap_or_else(|| "no reason given".into()),
            ));
        }
        match (resp.applied, resp.updated_file) {
            (true, Some(content)) => Ok(Generation::Updated {
                content,
                reason: resp.reason,
            }),
            (true, None) => Err(GenerationError::Malformed(
                "applied=true without updated_file".into(),
            )),
            (false, _) => Ok(Generation::NoChange {
                reason: resp.reason.unwrap_or_else(|| "no changes".into()),
            }),
        }
    }

    fn verify(
        &self,
        content: &str,
        instruction: &EditInstruction,
        marker: &str,
    ) -> Result<Option<Verdict>, GenerationError> {
        let stdout = self.invoke(&CommandRequest {
            mode: "verify",
            file_path: &instruction.file_path,
            content,
            instruction,
            marker: Some(marker),
        })?;
        let Some(value) = extract_json(&stdout) else {
            warn!("verifier returned no JSON; treating as unsupported");
            return Ok(None);
        };
        let resp: VerifyResponse =
            serde_json::from_value(value).map_err(|e| GenerationError::Malformed(e.to_string()))?;
        Ok(Some(Verdict {
            already_applied: resp.already_tagged,
            reason: resp.reason.unwrap_or_else(|| "verifier decision".into()),
        }))
    }
}

/// Pull a JSON object out of model-ish output: bare JSON, a fenced
/// ```json block, or the outermost `{...}` span inside prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```")
            && let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(body[..end].trim())
        {
            return Some(v);
        }
    }

    let (lo, hi) = (trimmed.find('{')?, trimmed.rfind('}')?);
    if lo >= hi {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[lo..=hi]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::instruction::{InstructionKind, TrackAction};

    struct Sleepy(Duration);

    impl EditGenerator for Sleepy {
        fn generate(&self, content: &str, _: &EditInstruction) -> Result<Generation, GenerationError> {
            thread::sleep(self.0);
            Ok(Generation::Updated {
                content: format!("{content}!"),
                reason: None,
            })
        }
    }

    struct Boom;

    impl EditGenerator for Boom {
        fn generate(&self, _: &str, _: &EditInstruction) -> Result<Generation, GenerationError> {
            panic!("generator bug");
        }
    }

    fn ins() -> EditInstruction {
        EditInstruction::new(
            "a.js",
            "",
            InstructionKind::TrackEvent {
                event: "trackClick".into(),
                action: TrackAction::Click,
                params: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn deadline_turns_slow_calls_into_timeouts() {
        let slow: Arc<dyn EditGenerator> = Arc::new(Sleepy(Duration::from_millis(500)));
        let err = generate_with_timeout(&slow, "x", &ins(), Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, GenerationError::Timeout(_)));

        let fast: Arc<dyn EditGenerator> = Arc::new(Sleepy(Duration::ZERO));
        let ok = generate_with_timeout(&fast, "x", &ins(), Some(Duration::from_secs(5))).unwrap();
        assert_eq!(
            ok,
            Generation::Updated {
                content: "x!".into(),
                reason: None
            }
        );
    }

    #[test]
    fn panics_become_errors() {
        let g: Arc<dyn EditGenerator> = Arc::new(Boom);
        assert_eq!(
            generate_with_timeout(&g, "x", &ins(), None).unwrap_err(),
            GenerationError::Panicked
        );
    }

    #[test]
    fn default_verify_is_unsupported() {
        let g: Arc<dyn EditGenerator> = Arc::new(Sleepy(Duration::ZERO));
        assert_eq!(verify_with_timeout(&g, "x", &ins(), "m", None).unwrap(), None);
    }

    #[test]
    fn extract_json_handles_fences_and_prose() {
        let bare = r#"{"applied": true}"#;
        let fenced = "Sure!\n```json\n{\"applied\": false, \"reason\": \"x\"}\n```\n";
        let prose = "Result: {\"already_tagged\": true} hope this helps";
        assert_eq!(extract_json(bare).unwrap()["applied"], Value::Bool(true));
        assert_eq!(extract_json(fenced).unwrap()["reason"], Value::String("x".into()));
        assert_eq!(extract_json(prose).unwrap()["already_tagged"], Value::Bool(true));
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("[1, 2]").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn command_generator_round_trip_through_sh() {
        // The child ignores stdin and answers with a fixed document
        let script = r#"cat >/dev/null; printf '%s' '{"applied": true, "updated_file": "new body", "reason": "added call"}'"#;
        let g = CommandGenerator::new("sh", vec!["-c".into(), script.into()]);
        let out = g.generate("old body", &ins()).unwrap();
        assert_eq!(
            out,
            Generation::Updated {
                content: "new body".into(),
                reason: Some("added call".into())
            }
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timed_out_command_is_killed_with_its_children() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pid_file = tmp.path().join("sleeper.pid");
        // $0 is the pid file; the sleeper is a grandchild of this process
        let script = r#"cat >/dev/null; sleep 30 & echo $! > "$0"; wait"#;
        let g = CommandGenerator::new(
            "sh",
            vec!["-c".into(), script.into(), pid_file.display().to_string()],
        )
        .with_timeout(Some(Duration::from_secs(1)));

        let started = Instant::now();
        let err = g.generate("x", &ins()).unwrap_err();
        assert!(matches!(err, GenerationError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let stat = std::path::PathBuf::from(format!("/proc/{pid}/stat"));
        // gone, or a zombie waiting to be reaped
        let dead = || match std::fs::read_to_string(&stat) {
            Err(_) => true,
            Ok(s) => s.rsplit_once(')').is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !dead() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(dead(), "sleeper {pid} survived the timeout");
    }

    #[cfg(unix)]
    #[test]
    fn command_generator_reports_failures() {
        let failing = CommandGenerator::new("sh", vec!["-c".into(), "cat >/dev/null; echo nope >&2; exit 3".into()]);
        match failing.generate("x", &ins()).unwrap_err() {
            GenerationError::Failed(msg) => assert!(msg.contains("nope")),
            other => panic!("unexpected {other:?}"),
        }

        let refusing = CommandGenerator::new(
            "sh",
            vec!["-c".into(), r#"cat >/dev/null; echo '{"refused": true, "reason": "policy"}'"#.into()],
        );
        assert_eq!(
            refusing.generate("x", &ins()).unwrap_err(),
            GenerationError::Refused("policy".into())
        );

        let garbage = CommandGenerator::new("sh", vec!["-c".into(), "cat >/dev/null; echo hello".into()]);
        assert!(matches!(
            garbage.generate("x", &ins()).unwrap_err(),
            GenerationError::Malformed(_)
        ));
    }
}
