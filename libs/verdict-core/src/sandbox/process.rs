//! Process sandbox - one local interpreter process per loaded submission.
//!
//! The child runs with a cleared environment and `kill_on_drop`, so that
//! cancelling a grading (dropping the future) always terminates it. Before
//! exec it confines itself (see [`super::confine`]): resource limits and a
//! syscall filter always, plus private namespaces over a read-only root in
//! strict mode. The harness's audit hook inside the interpreter only turns
//! denials into readable errors; it is not what enforces them.

use super::confine::{ConfinePlan, ConfinementSettings};
use super::protocol::{ChannelError, HarnessChannel};
use super::scratch::ScratchAllocator;
use super::{CallOutcome, Invocation, LoadError, LoadRequest, LoadedFunction, Sandbox, PYTHON_HARNESS};
use async_trait::async_trait;
use base64::Engine;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use verdict_common::config::{LanguageConfigManager, ProcessConfinement};

const MINIMAL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const STDERR_CAPTURE_BYTES: usize = 16 * 1024;
const EXIT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    languages: LanguageConfigManager,
    scratch: ScratchAllocator,
    max_response_bytes: usize,
    confinement: ConfinementSettings,
}

impl ProcessSandbox {
    pub fn new(
        languages: LanguageConfigManager,
        scratch: ScratchAllocator,
        max_response_bytes: usize,
        confinement: ConfinementSettings,
    ) -> Self {
        if confinement.mode == ProcessConfinement::Relaxed {
            warn!("Process sandbox runs with relaxed confinement: the host filesystem is readable, do not grade untrusted code");
        }
        Self {
            languages,
            scratch,
            max_response_bytes,
            confinement,
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    #[instrument(skip(self, request), fields(language = %request.language, function = request.function_name))]
    async fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn LoadedFunction>, LoadError> {
        let config = self
            .languages
            .get_config(&request.language)
            .map_err(|e| LoadError::Unavailable(e.to_string()))?;

        let scratch = self
            .scratch
            .allocate()
            .map_err(|e| LoadError::Unavailable(format!("Failed to allocate scratch directory: {}", e)))?;

        let processes = u64::try_from(config.pids_limit).unwrap_or(1);
        let plan = ConfinePlan::new(&self.confinement, &request.limits, processes, scratch.path())
            .map_err(|e| LoadError::Unavailable(format!("Failed to prepare sandbox confinement: {}", e)))?;
        debug!(
            isolated = plan.is_isolated(),
            syscall_filter = plan.filters_syscalls(),
            "Confinement prepared"
        );

        let workdir = plan.workdir().to_path_buf();
        let source = base64::engine::general_purpose::STANDARD.encode(request.source_code);

        let mut command = Command::new(&config.execution.command);
        command
            .args(&config.execution.args)
            .arg("-c")
            .arg(PYTHON_HARNESS)
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", MINIMAL_PATH)
            .env("HOME", &workdir)
            .env("TMPDIR", &workdir)
            .env("LANG", "C.UTF-8")
            .env("VERDICT_FUNCTION", request.function_name)
            .env("VERDICT_SOURCE_B64", source)
            .env("VERDICT_MEMORY_BYTES", request.limits.memory_bytes().to_string())
            .env("VERDICT_SCRATCH", &workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            // SAFETY: the hook only issues syscalls over data prepared above
            unsafe {
                command.pre_exec(move || plan.apply());
            }
        }

        let mut child = command.spawn().map_err(|e| {
            LoadError::Unavailable(format!(
                "Failed to start confined '{}': {}",
                config.execution.command, e
            ))
        })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(LoadError::Unavailable(
                    "Interpreter pipes were not captured".to_string(),
                ))
            }
        };

        let channel = HarnessChannel::new(
            Box::new(BufReader::new(stdout)),
            Box::new(stdin),
            self.max_response_bytes,
        );

        let mut session = ProcessSession {
            child,
            channel,
            stderr: Some(drain_stderr(stderr)),
            usable: true,
            _scratch: scratch,
        };

        let timeout = request.limits.timeout();
        match tokio::time::timeout(timeout, session.channel.startup()).await {
            Ok(Ok(startup)) => match startup.into_result() {
                Ok(()) => {
                    debug!("Submission loaded");
                    Ok(Box::new(session))
                }
                Err(e) => {
                    session.terminate().await;
                    Err(e)
                }
            },
            Ok(Err(e)) => {
                let stderr = session.terminate().await;
                warn!(error = %e, "Interpreter failed while loading submission");
                Err(LoadError::Compile(with_stderr(
                    format!("Interpreter exited while loading the submission ({})", e),
                    &stderr,
                )))
            }
            Err(_) => {
                session.terminate().await;
                warn!(timeout_ms = request.limits.timeout_ms, "Submission load timed out");
                Err(LoadError::Compile(format!(
                    "Loading the submission did not finish within {}ms",
                    request.limits.timeout_ms
                )))
            }
        }
    }
}

struct ProcessSession {
    child: Child,
    channel: HarnessChannel,
    stderr: Option<JoinHandle<String>>,
    usable: bool,
    _scratch: TempDir,
}

impl ProcessSession {
    /// Kill the interpreter and return whatever it wrote to stderr
    async fn terminate(&mut self) -> String {
        self.usable = false;

        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Interpreter already gone");
        }
        if let Err(e) = self.child.wait().await {
            debug!(error = %e, "Failed to reap interpreter");
        }

        self.collect_stderr().await
    }

    async fn collect_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(handle) => match tokio::time::timeout(Duration::from_secs(1), handle).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            },
            None => String::new(),
        }
    }

    /// Interpret a broken channel: the interpreter died or misbehaved
    async fn channel_failure(&mut self, error: ChannelError) -> CallOutcome {
        self.usable = false;

        if let ChannelError::Oversized { limit } = error {
            self.terminate().await;
            return CallOutcome::ResourceExceeded {
                message: format!("Return value exceeded {} bytes", limit),
            };
        }

        let status = match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        };
        let stderr = self.terminate().await;

        debug!(error = %error, status = ?status, "Interpreter channel failed");
        classify_exit(status, &stderr)
    }
}

#[async_trait]
impl LoadedFunction for ProcessSession {
    async fn call(&mut self, invocation: &Invocation, timeout: Duration) -> CallOutcome {
        if !self.usable {
            return CallOutcome::Crashed {
                message: "Sandbox session is no longer usable".to_string(),
            };
        }

        match tokio::time::timeout(timeout, self.channel.call(invocation)).await {
            Ok(Ok(reply)) => reply.into(),
            Ok(Err(e)) => self.channel_failure(e).await,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Call timed out - killing interpreter");
                self.terminate().await;
                CallOutcome::TimedOut
            }
        }
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    async fn shutdown(self: Box<Self>) {
        let mut session = *self;
        session.terminate().await;
    }
}

fn drain_stderr(mut stderr: ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // keep draining past the cap so the child never blocks on a full pipe
                    let room = STDERR_CAPTURE_BYTES.saturating_sub(captured.len());
                    captured.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
        String::from_utf8_lossy(&captured).into_owned()
    })
}

fn with_stderr(message: String, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        message
    } else {
        format!("{}\n{}", message, stderr)
    }
}

fn classify_exit(status: Option<ExitStatus>, stderr: &str) -> CallOutcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        match status.and_then(|s| s.signal()) {
            Some(libc::SIGKILL) => {
                return CallOutcome::ResourceExceeded {
                    message: "Interpreter was killed, most likely for exceeding the memory ceiling".to_string(),
                }
            }
            Some(libc::SIGXCPU) => return CallOutcome::TimedOut,
            Some(libc::SIGXFSZ) => {
                return CallOutcome::ResourceExceeded {
                    message: "Interpreter exceeded the scratch file size limit".to_string(),
                }
            }
            _ => {}
        }
    }

    let message = match status {
        Some(status) => format!("Interpreter exited unexpectedly ({})", status),
        None => "Interpreter stopped responding".to_string(),
    };
    CallOutcome::Crashed {
        message: with_stderr(message, stderr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_stderr() {
        assert_eq!(with_stderr("boom".to_string(), "  \n"), "boom");
        assert_eq!(with_stderr("boom".to_string(), "Fatal\n"), "boom\nFatal");
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_exit() {
        use std::os::unix::process::ExitStatusExt;

        let killed = ExitStatus::from_raw(9);
        assert!(matches!(
            classify_exit(Some(killed), ""),
            CallOutcome::ResourceExceeded { .. }
        ));

        let segfault = ExitStatus::from_raw(11);
        assert!(matches!(
            classify_exit(Some(segfault), "Fatal Python error"),
            CallOutcome::Crashed { ref message } if message.contains("Fatal Python error")
        ));

        assert!(matches!(classify_exit(None, ""), CallOutcome::Crashed { .. }));

        let cpu = ExitStatus::from_raw(libc::SIGXCPU);
        assert!(matches!(classify_exit(Some(cpu), ""), CallOutcome::TimedOut));
        let fsize = ExitStatus::from_raw(libc::SIGXFSZ);
        assert!(matches!(
            classify_exit(Some(fsize), ""),
            CallOutcome::ResourceExceeded { .. }
        ));
    }
}
