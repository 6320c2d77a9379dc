//! Warm Container Pool (§4.G) — long-lived per-workspace helper containers
//! used to execute tools without paying container-startup cost on every
//! call.

use crate::docker::{ContainerSpec, DockerRuntime};
use crate::error::{CoreError, Result};
use crate::kit::manifest::{RawPort, ResolvedAction};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 900;
const WORKSPACE_MOUNT_PATH: &str = "/repo";
const TOOL_RUN_DIR: &str = ".ling-core-tool-run";

struct WarmEntry {
    container_id: String,
    image_tag: String,
    last_used: Instant,
    port_bindings: HashMap<String, u16>,
}

/// Keyed by `workspace_name` (§4.G). Entries are behind one
/// `tokio::sync::Mutex` each, generalizing the teacher's
/// `agent_manager::locks::LockManager` (there keyed by path-glob) to
/// per-workspace serialization of container acquisition/eviction.
pub struct WarmContainerPool {
    docker: Arc<dyn DockerRuntime>,
    entries: Mutex<HashMap<String, WarmEntry>>,
    idle_timeout: Duration,
}

impl WarmContainerPool {
    pub fn new(docker: Arc<dyn DockerRuntime>, idle_timeout: Duration) -> Self {
        Self { docker, entries: Mutex::new(HashMap::new()), idle_timeout }
    }

    /// Returns a healthy warm container for `workspace_name` bound to
    /// `image_tag`, creating (or replacing a stale) one as needed.
    pub async fn acquire(
        &self,
        workspace_name: &str,
        image_tag: &str,
        workspace_root: &std::path::Path,
        declared_ports: &[RawPort],
        env: Vec<String>,
    ) -> Result<String> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(workspace_name) {
            let healthy = self
                .docker
                .inspect_container(&entry.container_id)
                .await?
                .map(|info| info.running && info.image == entry.image_tag)
                .unwrap_or(false);
            if healthy && entry.image_tag == image_tag {
                let id = entry.container_id.clone();
                entries.get_mut(workspace_name).unwrap().last_used = Instant::now();
                return Ok(id);
            }
            // Stale: image tag mismatch or container unhealthy (§4.G).
            let stale = entries.remove(workspace_name).unwrap();
            warn!(workspace_name, %stale.image_tag, "evicting stale warm container");
            self.docker.stop_container(&stale.container_id).await?;
            self.docker.remove_container(&stale.container_id).await?;
        }

        let mut port_bindings = HashMap::new();
        for port in declared_ports {
            let host_port = find_available_port(port.port)?;
            port_bindings.insert(format!("{}/tcp", port.port), host_port);
        }

        let mut full_env = env;
        for port in declared_ports {
            let host_port = port_bindings[&format!("{}/tcp", port.port)];
            full_env.push(format!("PORT_{}={}", port.name.to_uppercase(), host_port));
        }

        let spec = ContainerSpec {
            name: Some(format!("ling-core-warm-{workspace_name}")),
            image: image_tag.to_string(),
            entrypoint: Some(vec!["tail".into(), "-f".into(), "/dev/null".into()]),
            cmd: None,
            env: full_env,
            binds: vec![format!("{}:{WORKSPACE_MOUNT_PATH}", workspace_root.display())],
            port_bindings: port_bindings.clone(),
            extra_hosts: vec!["host.docker.internal:host-gateway".into()],
        };

        let container_id = self.docker.create_container(spec).await?;
        self.docker.start_container(&container_id).await?;
        info!(workspace_name, %image_tag, %container_id, "started warm container");

        entries.insert(
            workspace_name.to_string(),
            WarmEntry {
                container_id: container_id.clone(),
                image_tag: image_tag.to_string(),
                last_used: Instant::now(),
                port_bindings,
            },
        );
        Ok(container_id)
    }

    /// Executes `action` inside the already-acquired warm container for
    /// `workspace_name` (§4.G). Materializes a temp directory under the
    /// bind-mounted workspace holding the function's source, the JSON
    /// parameters, and a driver script; `exec`s the driver; surfaces a
    /// non-zero exit's `error.txt` traceback as [`CoreError::ToolError`].
    /// Per §9's user-visible-error note, the warm container is removed on
    /// any failure so the next call gets a fresh one.
    pub async fn execute_tool(
        &self,
        workspace_name: &str,
        container_id: &str,
        workspace_root: &std::path::Path,
        action: &ResolvedAction,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let run_id = crate::util::generate_readable_uid("run");
        let run_rel = std::path::Path::new(TOOL_RUN_DIR).join(&run_id);
        let run_dir = workspace_root.join(&run_rel);
        let result = self
            .run_in_temp_dir(container_id, &run_dir, &run_rel, action, parameters)
            .await;
        let _ = std::fs::remove_dir_all(&run_dir);

        if result.is_err() {
            warn!(workspace_name, container_id, "removing warm container after tool failure");
            self.evict(workspace_name).await?;
        }
        result
    }

    async fn run_in_temp_dir(
        &self,
        container_id: &str,
        run_dir: &std::path::Path,
        run_rel: &std::path::Path,
        action: &ResolvedAction,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        std::fs::create_dir_all(run_dir)
            .map_err(|e| CoreError::ToolError(format!("creating tool run dir: {e}")))?;

        let function_source = std::fs::read_to_string(&action.path)
            .map_err(|e| CoreError::ToolError(format!("reading action source {:?}: {e}", action.path)))?;
        std::fs::write(run_dir.join("function_module.py"), function_source)
            .map_err(|e| CoreError::ToolError(format!("writing driver inputs: {e}")))?;
        std::fs::write(
            run_dir.join("params.json"),
            serde_json::to_string(parameters)?,
        )
        .map_err(|e| CoreError::ToolError(format!("writing driver inputs: {e}")))?;
        std::fs::write(run_dir.join("driver.py"), tool_driver_script(&action.function))
            .map_err(|e| CoreError::ToolError(format!("writing driver inputs: {e}")))?;

        let container_run_dir = format!("{WORKSPACE_MOUNT_PATH}/{}", run_rel.display());

        let outcome = self
            .docker
            .exec(
                container_id,
                vec!["python3".into(), format!("{container_run_dir}/driver.py")],
            )
            .await?;

        let error_path = run_dir.join("error.txt");
        if outcome.exit_code != 0 || error_path.exists() {
            let traceback = std::fs::read_to_string(&error_path).unwrap_or(outcome.stdout);
            return Err(CoreError::ToolError(traceback));
        }

        let result_path = run_dir.join("result.json");
        let raw = std::fs::read_to_string(&result_path)
            .map_err(|e| CoreError::ToolError(format!("tool produced no result.json: {e}")))?;
        serde_json::from_str(&raw).map_err(CoreError::from)
    }

    pub async fn touch(&self, workspace_name: &str) {
        if let Some(entry) = self.entries.lock().await.get_mut(workspace_name) {
            entry.last_used = Instant::now();
        }
    }

    pub async fn port_bindings(&self, workspace_name: &str) -> Option<HashMap<String, u16>> {
        self.entries
            .lock()
            .await
            .get(workspace_name)
            .map(|e| e.port_bindings.clone())
    }

    async fn evict(&self, workspace_name: &str) -> Result<()> {
        let entry = self.entries.lock().await.remove(workspace_name);
        if let Some(entry) = entry {
            self.docker.stop_container(&entry.container_id).await?;
            self.docker.remove_container(&entry.container_id).await?;
            info!(workspace_name, "evicted idle warm container");
        }
        Ok(())
    }

    /// One sweep: evicts every entry idle longer than the configured
    /// timeout. Intended to be driven by a `tokio::time::interval` loop
    /// in the caller (kept out-of-process here so it stays testable
    /// without spawning a background task per test).
    pub async fn sweep_idle(&self) -> Result<Vec<String>> {
        let stale: Vec<String> = {
            let entries = self.entries.lock().await;
            let now = Instant::now();
            entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_used) > self.idle_timeout)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in &stale {
            self.evict(name).await?;
        }
        Ok(stale)
    }

    /// Spawns the idle sweeper as a background task (§4.G: "a background
    /// sweeper evicts containers idle for more than the configured
    /// timeout").
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = pool.sweep_idle().await {
                    warn!(error = %e, "warm container idle sweep failed");
                }
            }
        })
    }
}

/// Generates the small in-container driver (§4.G) that loads
/// `function_module.py`, calls `function_name` with the JSON parameters,
/// and writes `result.json` on success or `error.txt` (with traceback) on
/// failure — run via `exec` against the already-running warm container.
fn tool_driver_script(function_name: &str) -> String {
    format!(
        r#"import asyncio
import json
import sys
import traceback
import importlib.util

HERE = __import__("os").path.dirname(__import__("os").path.abspath(__file__))

try:
    spec = importlib.util.spec_from_file_location("function_module", HERE + "/function_module.py")
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)

    with open(HERE + "/params.json") as f:
        params = json.load(f)

    fn = getattr(module, "{function_name}")
    result = fn(**params)
    if asyncio.iscoroutine(result):
        result = asyncio.run(result)

    with open(HERE + "/result.json", "w") as f:
        json.dump(result, f)
except Exception:
    with open(HERE + "/error.txt", "w") as f:
        f.write(traceback.format_exc())
    sys.exit(1)
"#
    )
}

/// Searches upward from `requested` for a bindable host port (§4.G),
/// grounded in the original's `_find_available_port`.
fn find_available_port(requested: u16) -> Result<u16> {
    const MAX_PROBES: u16 = 1000;
    for offset in 0..MAX_PROBES {
        let candidate = requested.saturating_add(offset);
        if candidate == 0 {
            continue;
        }
        if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
            return Ok(candidate);
        }
    }
    Err(CoreError::ToolError(format!(
        "no bindable host port found starting from {requested}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeRuntime;
    use std::path::Path;

    fn test_ports() -> Vec<RawPort> {
        vec![RawPort { port: 9000, name: "api".into() }]
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses_healthy_container() {
        let docker: Arc<dyn DockerRuntime> = Arc::new(FakeRuntime::default());
        let pool = WarmContainerPool::new(docker, Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS));
        let id1 = pool
            .acquire("ws-1", "img:v1", Path::new("/tmp/ws-1"), &test_ports(), vec![])
            .await
            .unwrap();
        let id2 = pool
            .acquire("ws-1", "img:v1", Path::new("/tmp/ws-1"), &test_ports(), vec![])
            .await
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn acquire_replaces_container_on_image_tag_mismatch() {
        let docker: Arc<dyn DockerRuntime> = Arc::new(FakeRuntime::default());
        let pool = WarmContainerPool::new(docker, Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS));
        let id1 = pool
            .acquire("ws-1", "img:v1", Path::new("/tmp/ws-1"), &test_ports(), vec![])
            .await
            .unwrap();
        let id2 = pool
            .acquire("ws-1", "img:v2", Path::new("/tmp/ws-1"), &test_ports(), vec![])
            .await
            .unwrap();
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn sweep_idle_evicts_stale_entries() {
        let docker: Arc<dyn DockerRuntime> = Arc::new(FakeRuntime::default());
        let pool = WarmContainerPool::new(docker, Duration::from_millis(1));
        pool.acquire("ws-1", "img:v1", Path::new("/tmp/ws-1"), &test_ports(), vec![])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let evicted = pool.sweep_idle().await.unwrap();
        assert_eq!(evicted, vec!["ws-1".to_string()]);
    }

    #[test]
    fn find_available_port_returns_a_bindable_port() {
        let port = find_available_port(18080).unwrap();
        assert!(port >= 18080);
    }

    fn test_action(dir: &std::path::Path) -> ResolvedAction {
        let action_path = dir.join("double.py");
        std::fs::write(&action_path, "def double(x):\n    return x * 2\n").unwrap();
        ResolvedAction {
            path: action_path,
            function: "double".into(),
            name: "double".into(),
            description: None,
        }
    }

    #[tokio::test]
    async fn execute_tool_reads_result_written_by_driver() {
        let fake = Arc::new(FakeRuntime::default());
        fake.set_exec_script(|cmd| {
            // cmd[1] is "<WORKSPACE_MOUNT_PATH>/<run_rel>/driver.py"; the
            // fake stands in for the container by writing the result
            // straight onto the host-visible bind-mounted path.
            let container_driver_path = &cmd[1];
            let rel = container_driver_path
                .strip_prefix(WORKSPACE_MOUNT_PATH)
                .unwrap()
                .trim_start_matches('/');
            let host_run_dir = std::path::Path::new(rel).parent().unwrap();
            let host_run_dir = WORKSPACE_ROOT_FOR_TEST.with(|r| r.borrow().join(host_run_dir));
            std::fs::write(host_run_dir.join("result.json"), r#"{"doubled": 8}"#).unwrap();
            crate::docker::ExecOutcome { exit_code: 0, stdout: String::new() }
        });
        let docker: Arc<dyn DockerRuntime> = fake;
        let pool = WarmContainerPool::new(docker, Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS));

        let dir = tempfile::tempdir().unwrap();
        WORKSPACE_ROOT_FOR_TEST.with(|r| *r.borrow_mut() = dir.path().to_path_buf());
        let action = test_action(dir.path());

        let container_id = pool
            .acquire("ws-1", "img:v1", dir.path(), &test_ports(), vec![])
            .await
            .unwrap();

        let result = pool
            .execute_tool("ws-1", &container_id, dir.path(), &action, &serde_json::json!({"x": 4}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"doubled": 8}));
    }

    thread_local! {
        static WORKSPACE_ROOT_FOR_TEST: std::cell::RefCell<std::path::PathBuf> =
            std::cell::RefCell::new(std::path::PathBuf::new());
    }

    #[tokio::test]
    async fn execute_tool_surfaces_error_txt_and_evicts_container() {
        let fake = Arc::new(FakeRuntime::default());
        fake.set_exec_script(|cmd| {
            let container_driver_path = &cmd[1];
            let rel = container_driver_path
                .strip_prefix(WORKSPACE_MOUNT_PATH)
                .unwrap()
                .trim_start_matches('/');
            let host_run_dir = std::path::Path::new(rel).parent().unwrap();
            let host_run_dir = WORKSPACE_ROOT_FOR_TEST.with(|r| r.borrow().join(host_run_dir));
            std::fs::write(host_run_dir.join("error.txt"), "Traceback: boom").unwrap();
            crate::docker::ExecOutcome { exit_code: 1, stdout: String::new() }
        });
        let docker: Arc<dyn DockerRuntime> = fake;
        let pool = WarmContainerPool::new(docker, Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS));

        let dir = tempfile::tempdir().unwrap();
        WORKSPACE_ROOT_FOR_TEST.with(|r| *r.borrow_mut() = dir.path().to_path_buf());
        let action = test_action(dir.path());

        let container_id = pool
            .acquire("ws-1", "img:v1", dir.path(), &test_ports(), vec![])
            .await
            .unwrap();

        let err = pool
            .execute_tool("ws-1", &container_id, dir.path(), &action, &serde_json::json!({"x": 4}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ToolError(msg) if msg.contains("boom")));
        assert!(pool.port_bindings("ws-1").await.is_none());
    }
}
