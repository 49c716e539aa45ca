//! Docker sandbox - one locked-down container per loaded submission.
//!
//! **Container Rules:**
//! 1. Pulls the language image if not present
//! 2. Creates the container with security constraints:
//!    - Network disabled
//!    - Memory (and swap) ceiling, CPU quota, pids limit
//!    - Read-only root filesystem, tmpfs scratch at /sandbox
//!    - All capabilities dropped, no-new-privileges, unprivileged user
//! 3. Passes the source code base64-encoded through the environment
//! 4. Talks to the harness over attached stdin/stdout
//! 5. Kills the container on timeout, removes it when the session ends

use super::protocol::{ChannelError, HarnessChannel};
use super::{CallOutcome, Invocation, LoadError, LoadRequest, LoadedFunction, Sandbox, PYTHON_HARNESS};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};
use verdict_common::config::LanguageConfigManager;

const SANDBOX_DIR: &str = "/sandbox";
const SANDBOX_USER: &str = "65534:65534";
const SCRATCH_TMPFS: &str = "rw,nosuid,nodev,size=16m,mode=1777";

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if grading panics or is cancelled
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    removed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            removed: false,
        }
    }

    async fn remove(&mut self) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(&self.container_id, Some(options)).await {
            warn!(container_id = %self.container_id, error = %e, "Failed to remove container");
        }
        self.removed = true;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        // Best-effort cleanup - cannot be async in Drop
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.container_id, "No runtime available to remove container");
            return;
        };

        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to cleanup container");
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct DockerSandbox {
    docker: Docker,
    languages: LanguageConfigManager,
    max_response_bytes: usize,
}

impl DockerSandbox {
    /// Create a Docker sandbox with the language config manager
    pub fn new_with_config(languages: &LanguageConfigManager, max_response_bytes: usize) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;

        Ok(Self {
            docker,
            languages: languages.clone(),
            max_response_bytes,
        })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = image, "Image cache hit");
            return Ok(());
        }

        warn!(image = image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image = image, "Image pulled");
        Ok(())
    }

    async fn start_session(&self, request: &LoadRequest<'_>) -> Result<DockerSession> {
        let config = self.languages.get_config(&request.language)?;

        self.ensure_image(&config.image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", config.image))?;

        let memory_limit = request.limits.memory_bytes().min(i64::MAX as u64) as i64;
        let cpu_limit = (f64::from(config.cpu_limit) * 1_000_000_000.0) as i64;

        let mut cmd = vec![config.execution.command.clone()];
        cmd.extend(config.execution.args.iter().cloned());
        cmd.push("-c".to_string());
        cmd.push(PYTHON_HARNESS.to_string());

        let env = vec![
            format!("VERDICT_SOURCE_B64={}", general_purpose::STANDARD.encode(request.source_code)),
            format!("VERDICT_FUNCTION={}", request.function_name),
            format!("VERDICT_MEMORY_BYTES={}", request.limits.memory_bytes()),
            format!("VERDICT_SCRATCH={}", SANDBOX_DIR),
            "LANG=C.UTF-8".to_string(),
        ];

        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(cmd),
            entrypoint: Some(vec![]),
            env: Some(env),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(SANDBOX_DIR.to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true), // SECURITY: No network access
            host_config: Some(HostConfig {
                memory: Some(memory_limit),
                memory_swap: Some(memory_limit),
                nano_cpus: Some(cpu_limit),
                pids_limit: Some(config.pids_limit),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                tmpfs: Some(HashMap::from([(SANDBOX_DIR.to_string(), SCRATCH_TMPFS.to_string())])),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_name = format!("verdict-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), container_config)
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id.clone();

        // CRITICAL: Set up cleanup guard immediately after container creation
        let guard = ContainerGuard::new(self.docker.clone(), container_id.clone());

        // Attach before start so the startup line cannot be missed
        let attach_options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(&container_id, Some(attach_options))
            .await
            .context("Failed to attach to Docker container")?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let stdout = output.filter_map(|frame| async move {
            match frame {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => Some(Ok(message)),
                Ok(_) => None,
                Err(e) => Some(Err(std::io::Error::other(e))),
            }
        });

        let channel = HarnessChannel::new(
            Box::new(StreamReader::new(Box::pin(stdout))),
            Box::new(input),
            self.max_response_bytes,
        );

        Ok(DockerSession {
            docker: self.docker.clone(),
            container_id,
            channel,
            guard,
            usable: true,
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, request), fields(language = %request.language, function = request.function_name))]
    async fn load(&self, request: &LoadRequest<'_>) -> Result<Box<dyn LoadedFunction>, LoadError> {
        let mut session = self
            .start_session(request)
            .await
            .map_err(|e| LoadError::Unavailable(format!("{:#}", e)))?;

        let timeout = request.limits.timeout();
        match tokio::time::timeout(timeout, session.channel.startup()).await {
            Ok(Ok(startup)) => match startup.into_result() {
                Ok(()) => {
                    debug!(container_id = %session.container_id, "Submission loaded");
                    Ok(Box::new(session))
                }
                Err(e) => {
                    session.terminate().await;
                    Err(e)
                }
            },
            Ok(Err(e)) => {
                warn!(container_id = %session.container_id, error = %e, "Container failed while loading submission");
                session.terminate().await;
                Err(LoadError::Compile(format!(
                    "Interpreter exited while loading the submission ({})",
                    e
                )))
            }
            Err(_) => {
                warn!(timeout_ms = request.limits.timeout_ms, "Submission load timed out");
                session.terminate().await;
                Err(LoadError::Compile(format!(
                    "Loading the submission did not finish within {}ms",
                    request.limits.timeout_ms
                )))
            }
        }
    }
}

struct DockerSession {
    docker: Docker,
    container_id: String,
    channel: HarnessChannel,
    guard: ContainerGuard,
    usable: bool,
}

impl DockerSession {
    async fn kill(&mut self) {
        self.usable = false;
        if let Err(e) = self
            .docker
            .kill_container(&self.container_id, None::<KillContainerOptions<String>>)
            .await
        {
            debug!(container_id = %self.container_id, error = %e, "Failed to kill container");
        }
    }

    async fn terminate(&mut self) {
        self.kill().await;
        self.guard.remove().await;
    }

    async fn channel_failure(&mut self, error: ChannelError) -> CallOutcome {
        self.usable = false;

        if let ChannelError::Oversized { limit } = error {
            self.terminate().await;
            return CallOutcome::ResourceExceeded {
                message: format!("Return value exceeded {} bytes", limit),
            };
        }

        let oom = oom_killed(self.docker.clone(), self.container_id.clone()).await;
        self.terminate().await;

        if oom {
            CallOutcome::ResourceExceeded {
                message: "Container was killed for exceeding the memory ceiling".to_string(),
            }
        } else {
            CallOutcome::Crashed {
                message: format!("Interpreter exited unexpectedly ({})", error),
            }
        }
    }
}

#[async_trait]
impl LoadedFunction for DockerSession {
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
                warn!(
                    container_id = %self.container_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Call timed out - killing container"
                );
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

/// Ask the daemon whether the kernel OOM killer stopped the container.
/// Takes owned handles so the session is not borrowed across the await.
async fn oom_killed(docker: Docker, container_id: String) -> bool {
    match docker
        .inspect_container(&container_id, None::<InspectContainerOptions>)
        .await
    {
        Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
        Err(e) => {
            debug!(container_id = %container_id, error = %e, "Failed to inspect container");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use verdict_common::types::{Language, Limits};

    fn assert_send<F: std::future::Future + Send>(_: F) {}

    #[test]
    fn test_oom_lookup_future_is_send() {
        // type-checked only; the session's call future awaits this inside async_trait
        let _check = |docker: Docker, container_id: String| assert_send(oom_killed(docker, container_id));
    }

    /// Requires a running Docker daemon and the python:3.12-slim image
    #[tokio::test]
    #[ignore]
    async fn test_docker_add() {
        let sandbox = DockerSandbox::new_with_config(&LanguageConfigManager::builtin(), 1024 * 1024)
            .expect("Failed to connect to Docker");

        let request = LoadRequest {
            source_code: "def add(a, b):\n    return a + b\n",
            function_name: "add",
            language: Language::Python,
            limits: Limits::default(),
        };

        let mut function = sandbox.load(&request).await.expect("load failed");
        let outcome = function
            .call(&Invocation::from_input(&json!({"a": 2, "b": 3})), Duration::from_secs(5))
            .await;
        function.shutdown().await;

        assert!(matches!(outcome, CallOutcome::Returned { ref value, .. } if *value == json!(5)));
    }

    /// Requires a running Docker daemon
    #[tokio::test]
    #[ignore]
    async fn test_docker_network_denied() {
        let sandbox = DockerSandbox::new_with_config(&LanguageConfigManager::builtin(), 1024 * 1024)
            .expect("Failed to connect to Docker");

        let request = LoadRequest {
            source_code: "import socket\ndef reach_out():\n    socket.create_connection(('1.1.1.1', 53), timeout=1)\n    return 'connected'\n",
            function_name: "reach_out",
            language: Language::Python,
            limits: Limits::default(),
        };

        let mut function = sandbox.load(&request).await.expect("load failed");
        let outcome = function
            .call(&Invocation::Positional(vec![]), Duration::from_secs(5))
            .await;
        function.shutdown().await;

        assert!(matches!(outcome, CallOutcome::Raised { .. }));
    }
}
