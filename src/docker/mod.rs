//! Thin container-runtime seam shared by the Image Cache (§4.F), Warm
//! Container Pool (§4.G), and Agent Runner (§4.H).
//!
//! All three components talk to Docker only through [`DockerRuntime`]
//! rather than `bollard::Docker` directly, so their tests can inject
//! [`FakeRuntime`] instead of requiring a live daemon.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as BollardContainerConfig, CreateContainerOptions, ListContainersOptions,
    LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub binds: Vec<String>,
    /// `container_port/tcp` -> requested host port.
    pub port_bindings: HashMap<String, u16>,
    pub extra_hosts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub exit_code: i64,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: String,
}

#[derive(Debug, Clone)]
pub struct ContainerInspect {
    pub running: bool,
    pub image: String,
    /// Set once the container has exited; `None` while still running.
    /// The Agent Runner's supervisor loop (§4.H step 6) polls this
    /// instead of re-attaching to the wait stream.
    pub exit_code: Option<i64>,
}

#[async_trait]
pub trait DockerRuntime: Send + Sync {
    async fn image_exists(&self, tag: &str) -> Result<bool>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    /// Builds an image from a tar build context (a single-layer `Dockerfile`
    /// plus anything it needs) and tags it `tag`.
    async fn build_image(&self, context_tar: Vec<u8>, tag: &str) -> Result<()>;
    async fn remove_images_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn create_container(&self, spec: ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspect>>;
    async fn wait_container(&self, id: &str, timeout: Duration) -> Result<WaitOutcome>;
    async fn container_logs(&self, id: &str) -> Result<String>;
    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutcome>;
    async fn find_container_by_name(&self, name: &str) -> Result<Option<String>>;
}

pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| CoreError::ToolError(format!("docker connection failed: {e}")))?;
        Ok(Self { docker })
    }
}

fn tool_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::ToolError(e.to_string())
}

#[async_trait]
impl DockerRuntime for BollardRuntime {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.docker.inspect_image(tag).await.is_ok())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let opts = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(chunk) = stream.next().await {
            chunk.map_err(tool_err)?;
        }
        Ok(())
    }

    async fn build_image(&self, context_tar: Vec<u8>, tag: &str) -> Result<()> {
        let opts = bollard::image::BuildImageOptions {
            dockerfile: "Dockerfile",
            t: tag,
            rm: true,
            ..Default::default()
        };
        let mut stream = self
            .docker
            .build_image(opts, None, Some(context_tar.into()));
        while let Some(chunk) = stream.next().await {
            chunk.map_err(tool_err)?;
        }
        Ok(())
    }

    async fn remove_images_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(tool_err)?;
        let mut removed = Vec::new();
        for image in images {
            for tag in &image.repo_tags {
                if tag.starts_with(prefix) {
                    let _ = self
                        .docker
                        .remove_image(
                            tag,
                            Some(RemoveImageOptions {
                                force: true,
                                ..Default::default()
                            }),
                            None,
                        )
                        .await;
                    removed.push(tag.clone());
                }
            }
        }
        Ok(removed)
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for (container_port, host_port) in &spec.port_bindings {
            exposed_ports.insert(container_port.clone(), HashMap::new());
            port_bindings.insert(
                container_port.clone(),
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            port_bindings: Some(port_bindings),
            extra_hosts: Some(spec.extra_hosts.clone()),
            ..Default::default()
        };

        let config = BollardContainerConfig {
            image: Some(spec.image.clone()),
            entrypoint: spec.entrypoint.clone(),
            cmd: spec.cmd.clone(),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        };

        let create_opts = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let container = self
            .docker
            .create_container(create_opts, config)
            .await
            .map_err(tool_err)?;
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<bollard::container::StartContainerOptions<String>>)
            .await
            .map_err(tool_err)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let _ = self.docker.stop_container(id, None).await;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let _ = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspect>> {
        match self.docker.inspect_container(id, None).await {
            Ok(info) => Ok(Some(ContainerInspect {
                running: info
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false),
                exit_code: info.state.as_ref().and_then(|s| s.exit_code),
                image: info.config.and_then(|c| c.image).unwrap_or_default(),
            })),
            Err(_) => Ok(None),
        }
    }

    async fn wait_container(&self, id: &str, timeout: Duration) -> Result<WaitOutcome> {
        let wait = async {
            let mut stream = self
                .docker
                .wait_container(id, None::<WaitContainerOptions<String>>);
            match stream.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                Some(Err(e)) => Err(tool_err(e)),
                None => Ok(0),
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => Ok(WaitOutcome {
                exit_code: result?,
                timed_out: false,
            }),
            Err(_) => {
                self.stop_container(id).await?;
                Ok(WaitOutcome {
                    exit_code: -1,
                    timed_out: true,
                })
            }
        }
    }

    async fn container_logs(&self, id: &str) -> Result<String> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            if let Ok(log) = chunk {
                out.push_str(&log.to_string());
            }
        }
        Ok(out)
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutcome> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(tool_err)?;

        let mut stdout = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await.map_err(tool_err)?
        {
            while let Some(chunk) = output.next().await {
                if let Ok(chunk) = chunk {
                    stdout.push_str(&chunk.to_string());
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(tool_err)?;
        Ok(ExecOutcome {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
        })
    }

    async fn find_container_by_name(&self, name: &str) -> Result<Option<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(tool_err)?;
        Ok(containers.into_iter().find_map(|c| c.id))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        images: Vec<String>,
        containers: HashMap<String, ContainerInspect>,
        next_id: u64,
        exec_script: Option<Box<dyn Fn(&[String]) -> ExecOutcome + Send>>,
    }

    /// In-memory stand-in for Docker. Every image tag "exists" once built
    /// or pulled; containers are tracked by synthetic id. Good enough to
    /// drive the coalescing/eviction/port-allocation logic under test
    /// without a daemon.
    pub struct FakeRuntime {
        state: Mutex<State>,
    }

    impl Default for FakeRuntime {
        fn default() -> Self {
            Self { state: Mutex::new(State::default()) }
        }
    }

    #[async_trait]
    impl DockerRuntime for FakeRuntime {
        async fn image_exists(&self, tag: &str) -> Result<bool> {
            Ok(self.state.lock().unwrap().images.iter().any(|t| t == tag))
        }

        async fn pull_image(&self, image: &str) -> Result<()> {
            self.state.lock().unwrap().images.push(image.to_string());
            Ok(())
        }

        async fn build_image(&self, _context_tar: Vec<u8>, tag: &str) -> Result<()> {
            self.state.lock().unwrap().images.push(tag.to_string());
            Ok(())
        }

        async fn remove_images_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            let mut state = self.state.lock().unwrap();
            let (removed, kept): (Vec<_>, Vec<_>) =
                state.images.drain(..).partition(|t| t.starts_with(prefix));
            state.images = kept;
            Ok(removed)
        }

        async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = format!("fake-{}", state.next_id);
            state.containers.insert(
                id.clone(),
                ContainerInspect { running: false, image: spec.image, exit_code: None },
            );
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> Result<()> {
            if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
                c.running = true;
            }
            Ok(())
        }

        async fn stop_container(&self, id: &str) -> Result<()> {
            if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
                c.running = false;
                c.exit_code.get_or_insert(0);
            }
            Ok(())
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            self.state.lock().unwrap().containers.remove(id);
            Ok(())
        }

        async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInspect>> {
            Ok(self.state.lock().unwrap().containers.get(id).map(|c| ContainerInspect {
                running: c.running,
                image: c.image.clone(),
                exit_code: c.exit_code,
            }))
        }

        async fn wait_container(&self, _id: &str, _timeout: Duration) -> Result<WaitOutcome> {
            Ok(WaitOutcome { exit_code: 0, timed_out: false })
        }

        async fn container_logs(&self, _id: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn exec(&self, _id: &str, cmd: Vec<String>) -> Result<ExecOutcome> {
            let state = self.state.lock().unwrap();
            if let Some(script) = &state.exec_script {
                Ok(script(&cmd))
            } else {
                Ok(ExecOutcome { exit_code: 0, stdout: String::new() })
            }
        }

        async fn find_container_by_name(&self, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    impl FakeRuntime {
        pub fn set_exec_script(&self, f: impl Fn(&[String]) -> ExecOutcome + Send + 'static) {
            self.state.lock().unwrap().exec_script = Some(Box::new(f));
        }
    }
}
