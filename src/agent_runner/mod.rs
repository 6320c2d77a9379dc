//! Agent Runner (§4.H) — spawns a short-lived, isolated container per
//! invocation to run one agent turn, then tears it down. Never touches
//! the Warm Container Pool; each run pays container-startup cost in
//! exchange for full isolation.

use crate::config::AgentRunnerConfig;
use crate::docker::{ContainerSpec, DockerRuntime};
use crate::error::{CoreError, Result};
use crate::kit::manifest::Kit;
use crate::module::{AgentStateKind, Module, ModuleRegistry};
use crate::workspace_store::WorkspaceStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{info, warn};

const BOOTSTRAP_LIBRARY: &str = "ling-core-agent-bootstrap";
const WORKSPACE_MOUNT_PATH: &str = "/repo";
const MODULE_MOUNT_PATH: &str = "/module";
const VENV_MOUNT_PATH: &str = "/venv";

/// Inputs to one agent turn (§4.H).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentContext {
    pub module_id: String,
    pub profile: String,
    pub user_input: String,
    pub session_id: String,
}

/// One entry of an agent run's `results` list: a renderable payload
/// tagged with the MIME type the presentation layer should use, drawn
/// from the same catalog `get_supported_content_types` (§4.I) exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultItem {
    pub content_type: String,
    pub payload: Value,
}

/// The driver's normalized return shape (§4.H step 5c). `run_id` is a
/// host-assigned correlator (not something the in-container driver can
/// know ahead of time) threading the Agent Runner's supervisor logs,
/// any Bridge calls made during the run, and the Chat History rows the
/// run wrote together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub response: String,
    #[serde(default)]
    pub results: Vec<ResultItem>,
    #[serde(default)]
    pub run_id: String,
}

pub struct AgentRunner {
    docker: Arc<dyn DockerRuntime>,
    modules: Arc<ModuleRegistry>,
    workspace_store: Arc<WorkspaceStore>,
    venv_base: PathBuf,
    config: AgentRunnerConfig,
    bridge_host: String,
    bridge_port: u16,
    /// §6 `DEV_MODE` — keep containers around after exit for inspection.
    dev_mode: bool,
}

impl AgentRunner {
    pub fn new(
        docker: Arc<dyn DockerRuntime>,
        modules: Arc<ModuleRegistry>,
        workspace_store: Arc<WorkspaceStore>,
        venv_base: PathBuf,
        config: AgentRunnerConfig,
        bridge_host: String,
        bridge_port: u16,
        dev_mode: bool,
    ) -> Self {
        Self { docker, modules, workspace_store, venv_base, config, bridge_host, bridge_port, dev_mode }
    }

    /// Runs one agent turn end-to-end (§4.H steps 1-7). Module state is
    /// always restored to `STANDBY` before returning, on every exit path.
    pub async fn run(&self, ctx: AgentContext, timeout: Option<Duration>) -> Result<AgentRunResult> {
        self.modules.set_agent_state(&ctx.module_id, AgentStateKind::Executing)?;
        let result = self.run_inner(&ctx, timeout).await;
        if let Err(e) = self.modules.set_agent_state(&ctx.module_id, AgentStateKind::Standby) {
            warn!(module_id = %ctx.module_id, error = %e, "failed to restore STANDBY after agent run");
        }
        result
    }

    async fn run_inner(&self, ctx: &AgentContext, timeout: Option<Duration>) -> Result<AgentRunResult> {
        let module = self.modules.get(&ctx.module_id)?;
        let kit = self.modules.get_kit_config(&ctx.module_id)?;
        let class_name = kit.class_for_profile(&ctx.profile)?.to_string();

        let minor = detect_python_minor(self.docker.as_ref(), &kit.base_image).await?;
        let venv_dir = self.ensure_venv(&module, &kit, &minor).await?;

        let workspace_root = self.workspace_store.root(&module.workspace_name);
        let run_id = crate::util::generate_readable_uid("agentrun");
        let result_host_path = std::env::temp_dir().join(format!("ling-core-{run_id}-result.json"));
        std::fs::write(&result_host_path, b"")
            .map_err(|e| CoreError::AgentRunnerError(format!("creating result file: {e}")))?;

        let mut env = vec![
            format!("AGENT_MODULE_ID={}", ctx.module_id),
            format!("AGENT_PROFILE={}", ctx.profile),
            format!("AGENT_USER_INPUT={}", ctx.user_input),
            format!("AGENT_SESSION_ID={}", ctx.session_id),
            format!("AGENT_CLASS_NAME={}", class_name),
            format!("AGENT_RUN_ID={run_id}"),
            format!("BRIDGE_HOST={}", self.bridge_host),
            format!("BRIDGE_PORT={}", self.bridge_port),
            format!("PYTHONPATH={VENV_MOUNT_PATH}/lib/python{minor}/site-packages"),
        ];
        env.extend(env_object_to_vec(&module.env_vars));

        let spec = ContainerSpec {
            name: Some(format!("ling-core-agent-{run_id}")),
            image: kit.base_image.clone(),
            entrypoint: Some(vec!["/bin/sh".into(), "-c".into(), runner_shell_script()]),
            cmd: None,
            env,
            binds: vec![
                format!("{}:{WORKSPACE_MOUNT_PATH}", workspace_root.display()),
                format!("{}:{MODULE_MOUNT_PATH}:ro", kit.kit_dir.display()),
                format!("{}:{VENV_MOUNT_PATH}", venv_dir.display()),
                format!("{}:/result.json", result_host_path.display()),
            ],
            port_bindings: HashMap::new(),
            extra_hosts: vec!["host.docker.internal:host-gateway".into()],
        };

        let container_id = self.docker.create_container(spec).await?;
        self.docker.start_container(&container_id).await?;
        info!(module_id = %ctx.module_id, profile = %ctx.profile, %container_id, "agent run started");

        let deadline = timeout.unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
        let outcome = self.supervise(&container_id, deadline).await;

        let result = self.finish(&container_id, &result_host_path, &run_id, outcome).await;
        let _ = std::fs::remove_file(&result_host_path);

        if !self.dev_mode {
            let _ = self.docker.stop_container(&container_id).await;
            let _ = self.docker.remove_container(&container_id).await;
        }

        result
    }

    /// §4.H step 6: poll container status every `poll_interval_ms` until
    /// exit or `deadline`. On timeout, stop the container.
    async fn supervise(&self, container_id: &str, deadline: Duration) -> Result<SupervisedOutcome> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let started = Instant::now();
        loop {
            let inspect = self.docker.inspect_container(container_id).await?;
            match inspect {
                Some(info) if !info.running => {
                    return Ok(SupervisedOutcome { exit_code: info.exit_code.unwrap_or(-1), timed_out: false });
                }
                None => {
                    return Err(CoreError::AgentRunnerError(format!(
                        "container {container_id} disappeared before exiting"
                    )));
                }
                _ => {}
            }
            if started.elapsed() >= deadline {
                self.docker.stop_container(container_id).await?;
                return Ok(SupervisedOutcome { exit_code: -1, timed_out: true });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn finish(
        &self,
        container_id: &str,
        result_host_path: &Path,
        run_id: &str,
        outcome: Result<SupervisedOutcome>,
    ) -> Result<AgentRunResult> {
        let outcome = outcome?;
        if outcome.timed_out {
            return Err(CoreError::AgentRunnerError(format!(
                "agent run exceeded its deadline and was stopped (container {container_id})"
            )));
        }
        let result = if outcome.exit_code == 0 {
            read_result_file(result_host_path)
        } else {
            match read_result_file(result_host_path) {
                Ok(result) => Ok(result),
                Err(_) => {
                    let logs = self.docker.container_logs(container_id).await.unwrap_or_default();
                    Err(CoreError::AgentRunnerError(format!(
                        "agent container exited {} with no usable result: {logs}",
                        outcome.exit_code
                    )))
                }
            }
        };
        result.map(|mut r| {
            // The host, not the in-container driver, is authoritative for the
            // run's correlator.
            r.run_id = run_id.to_string();
            r
        })
        .and_then(validate_result_content_types)
    }

    /// §4.H step 2: resolve or create the host-side venv for this kit's
    /// base image + detected interpreter minor version, installing the
    /// bootstrap library and the kit's declared dependencies into it.
    async fn ensure_venv(&self, module: &Module, kit: &Kit, minor: &str) -> Result<PathBuf> {
        let venv_dir = self.venv_base.join(format!("{}_{}_{}_py{minor}", module.owner, kit.kit_id, kit.semver));
        if venv_dir.join("pyvenv.cfg").is_file() {
            return Ok(venv_dir);
        }

        std::fs::create_dir_all(&self.venv_base)
            .map_err(|e| CoreError::AgentRunnerError(format!("creating venv base dir: {e}")))?;

        let status = Command::new("python3")
            .args(["-m", "venv", &venv_dir.display().to_string()])
            .status()
            .await
            .map_err(|e| CoreError::AgentRunnerError(format!("spawning venv creation: {e}")))?;
        if !status.success() {
            return Err(CoreError::AgentRunnerError(format!(
                "python3 -m venv failed for {venv_dir:?} (status {status})"
            )));
        }

        let pip = venv_dir.join("bin").join("pip");
        let mut packages = vec![BOOTSTRAP_LIBRARY.to_string()];
        packages.extend(kit.dependencies.iter().cloned());
        let status = Command::new(&pip)
            .arg("install")
            .arg("--no-cache-dir")
            .args(&packages)
            .status()
            .await
            .map_err(|e| CoreError::AgentRunnerError(format!("spawning pip install: {e}")))?;
        if !status.success() {
            let _ = std::fs::remove_dir_all(&venv_dir);
            return Err(CoreError::AgentRunnerError(format!(
                "dependency install failed for venv {venv_dir:?} (status {status})"
            )));
        }

        Ok(venv_dir)
    }

    /// `get_agent_tools_schema` (§4.H) — the no-container tool-schema
    /// probe the Profile Composer and caller introspection use: parse
    /// the agent class's source for methods carrying a `tool` marker and
    /// emit a §4.E-style descriptor per marked method.
    pub fn get_agent_tools_schema(&self, module_id: &str, profile: &str) -> Result<Vec<crate::parser::ToolDescriptor>> {
        let kit = self.modules.get_kit_config(module_id)?;
        let class_name = kit.class_for_profile(profile)?;
        let agents_dir = kit.kit_dir.join("agents");

        crate::parser::parse_agent_tool_methods(&agents_dir, class_name)?.ok_or_else(|| {
            CoreError::FunctionNotFound(format!(
                "no class {class_name:?} with tool-marked methods found under {agents_dir:?}"
            ))
        })
    }
}

struct SupervisedOutcome {
    exit_code: i64,
    timed_out: bool,
}

fn read_result_file(path: &Path) -> Result<AgentRunResult> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CoreError::AgentRunnerError(format!("reading result file: {e}")))?;
    if raw.trim().is_empty() {
        return Err(CoreError::AgentRunnerError("agent produced no result.json content".into()));
    }
    serde_json::from_str(&raw).map_err(|e| CoreError::AgentRunnerError(format!("malformed result.json: {e}")))
}

/// Rejects a run whose `results` entries name a MIME type the
/// presentation layer has no renderer for (§4.I
/// `get_supported_content_types`).
fn validate_result_content_types(result: AgentRunResult) -> Result<AgentRunResult> {
    for item in &result.results {
        if !crate::bridge::SUPPORTED_CONTENT_TYPES.contains(&item.content_type.as_str()) {
            return Err(CoreError::AgentRunnerError(format!(
                "agent result declared unsupported content_type {:?}",
                item.content_type
            )));
        }
    }
    Ok(result)
}

fn env_object_to_vec(env_vars: &Value) -> Vec<String> {
    env_vars
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| format!("{k}={}", if let Value::String(s) = v { s.clone() } else { v.to_string() }))
                .collect()
        })
        .unwrap_or_default()
}

/// §4.H step 2: a throwaway `python3 --version` probe against the kit's
/// base image, run as a one-off container rather than `exec` (nothing is
/// running yet to exec into).
async fn detect_python_minor(docker: &dyn DockerRuntime, base_image: &str) -> Result<String> {
    if !docker.image_exists(base_image).await? {
        docker.pull_image(base_image).await?;
    }
    let spec = ContainerSpec {
        name: None,
        image: base_image.to_string(),
        entrypoint: Some(vec![]),
        cmd: Some(vec!["python3".into(), "--version".into()]),
        env: Vec::new(),
        binds: Vec::new(),
        port_bindings: HashMap::new(),
        extra_hosts: Vec::new(),
    };
    let container_id = docker.create_container(spec).await?;
    docker.start_container(&container_id).await?;
    let _ = docker.wait_container(&container_id, Duration::from_secs(30)).await?;
    let logs = docker.container_logs(&container_id).await.unwrap_or_default();
    let _ = docker.remove_container(&container_id).await;

    parse_python_minor(&logs).ok_or_else(|| {
        CoreError::AgentRunnerError(format!("could not parse python version from probe output: {logs:?}"))
    })
}

/// Extracts `"3.11"` out of `"Python 3.11.4\n"`-shaped probe output.
fn parse_python_minor(version_output: &str) -> Option<String> {
    let version = version_output.split_whitespace().find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    let mut parts = version.split('.');
    let major = parts.next()?;
    let minor = parts.next()?;
    Some(format!("{major}.{minor}"))
}

/// The in-container shell entrypoint (§4.H step 5): invokes the bootstrap
/// driver module installed into the mounted venv, which loads the agent
/// class, runs `process_request`, and writes `/result.json`.
fn runner_shell_script() -> String {
    format!(
        r#"set -e
export PATH="{VENV_MOUNT_PATH}/bin:$PATH"
exec python3 -m ling_core_agent_bootstrap.driver
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_python_minor_extracts_major_minor() {
        assert_eq!(parse_python_minor("Python 3.11.4\n"), Some("3.11".to_string()));
        assert_eq!(parse_python_minor("Python 3.9.18"), Some("3.9".to_string()));
        assert_eq!(parse_python_minor("not a version"), None);
    }

    #[tokio::test]
    async fn detect_python_minor_errors_when_probe_logs_are_empty() {
        use crate::docker::fake::FakeRuntime;
        let docker = FakeRuntime::default();
        // FakeRuntime's container_logs always returns empty output, so the
        // probe has nothing to parse a version out of; this exercises the
        // error path, while parse_python_minor's own unit test above covers
        // the happy path against real `python3 --version` output.
        let err = detect_python_minor(&docker, "python:3.12-slim").await.unwrap_err();
        assert!(matches!(err, CoreError::AgentRunnerError(_)));
    }
}
