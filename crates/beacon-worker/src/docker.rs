//! Docker container backend.
//!
//! Each handle maps to a container of the same name. The container idles
//! on `tail -f /dev/null` and check processes run in it through `exec`.

use async_trait::async_trait;
use beacon_core::backend::{
    BackendContainer, BackendError, BackendResult, ContainerBackend, ContainerDefinition,
    InputFetch, ProcessOutput, ProcessSpec,
};
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect to `host`, or the local daemon when unset.
    pub fn connect(host: Option<&str>) -> BackendResult<Self> {
        let docker = match host {
            None => Docker::connect_with_local_defaults(),
            Some(path) if path.starts_with("unix://") => Docker::connect_with_unix(
                path,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            Some(addr) => {
                Docker::connect_with_http(addr, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
        }
        .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn pull(&self, image: &str) {
        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, image, "pull warning");
                }
            }
        }
    }

    async fn exec(
        &self,
        handle: &str,
        cmd: Vec<String>,
        env: &BTreeMap<String, String>,
        dir: Option<&str>,
        stdin: Vec<u8>,
    ) -> BackendResult<ProcessOutput> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            env: Some(env_list(env)),
            working_dir: dir.map(str::to_string),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(handle, options)
            .await
            .map_err(|e| classify(handle, e))?;

        let started = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await
            .map_err(|e| classify(handle, e))?;

        let mut output = ProcessOutput::default();
        match started {
            StartExecResults::Attached {
                output: mut stream,
                mut input,
            } => {
                if !stdin.is_empty() {
                    input
                        .write_all(&stdin)
                        .await
                        .map_err(|e| BackendError::Transport(format!("write stdin: {}", e)))?;
                }
                input
                    .shutdown()
                    .await
                    .map_err(|e| BackendError::Transport(format!("close stdin: {}", e)))?;

                while let Some(chunk) = stream.next().await {
                    match chunk.map_err(|e| classify(handle, e))? {
                        LogOutput::StdErr { message } => output.stderr.extend_from_slice(&message),
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            output.stdout.extend_from_slice(&message)
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(BackendError::Client(format!(
                    "exec in {} started detached",
                    handle
                )));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(handle, e))?;
        output.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(output)
    }

    async fn start_and_fetch(&self, definition: &ContainerDefinition) -> BackendResult<()> {
        let handle = definition.handle.as_str();
        self.docker
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(handle, e))?;

        for input in &definition.inputs {
            self.fetch_input(handle, input).await?;
        }
        Ok(())
    }

    async fn fetch_input(&self, handle: &str, input: &InputFetch) -> BackendResult<()> {
        debug!(handle, input = %input.name, uri = %input.source_uri, "fetching input");
        let output = self
            .exec(
                handle,
                fetch_command(input),
                &BTreeMap::new(),
                None,
                Vec::new(),
            )
            .await?;

        if !output.success() {
            return Err(BackendError::Client(format!(
                "fetch input {} failed with status {}: {}",
                input.name,
                output.exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

/// Stream a tarball from `source_uri` into `dest_path`.
pub(crate) fn fetch_command(input: &InputFetch) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        r#"mkdir -p "$1" && wget -qO- "$0" | tar -x -C "$1""#.to_string(),
        input.source_uri.clone(),
        input.dest_path.clone(),
    ]
}

fn container_config(definition: &ContainerDefinition) -> Config<String> {
    let binds: Vec<String> = definition
        .bind_mounts
        .iter()
        .map(|m| {
            let mode = if m.read_only { "ro" } else { "rw" };
            format!("{}:{}:{}", m.src_path, m.dst_path, mode)
        })
        .collect();

    let labels: HashMap<String, String> = definition
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Config {
        image: Some(definition.image.clone()),
        entrypoint: Some(vec![
            "tail".to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ]),
        env: Some(env_list(&definition.env)),
        working_dir: definition.dir.clone(),
        labels: Some(labels),
        tty: Some(false),
        host_config: Some(HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn classify(handle: &str, err: bollard::errors::Error) -> BackendError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => BackendError::from_status(status_code, handle, message),
        other => BackendError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn lookup(&self, handle: &str) -> BackendResult<BackendContainer> {
        let inspect = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(handle, e))?;

        Ok(BackendContainer {
            handle: handle.to_string(),
            backend_id: inspect.id.unwrap_or_default(),
        })
    }

    async fn create(&self, definition: &ContainerDefinition) -> BackendResult<BackendContainer> {
        let handle = definition.handle.as_str();
        self.pull(&definition.image).await;

        let options = CreateContainerOptions {
            name: handle.to_string(),
            platform: None,
        };

        info!(handle, image = %definition.image, "creating container");
        let created = self
            .docker
            .create_container(Some(options), container_config(definition))
            .await
            .map_err(|e| match classify(handle, e) {
                // A 404 here is the image, not the container.
                BackendError::NotFound(_) => {
                    BackendError::Client(format!("image {} not found", definition.image))
                }
                other => other,
            })?;

        if let Err(err) = self.start_and_fetch(definition).await {
            // Leave nothing behind under a handle the ledger is about to fail.
            if let Err(cleanup) = self.destroy(handle).await {
                warn!(handle, error = %cleanup, "Failed to remove partially created container");
            }
            return Err(err);
        }

        Ok(BackendContainer {
            handle: handle.to_string(),
            backend_id: created.id,
        })
    }

    async fn run(
        &self,
        container: &BackendContainer,
        process: &ProcessSpec,
        stdin: Vec<u8>,
    ) -> BackendResult<ProcessOutput> {
        let mut cmd = Vec::with_capacity(process.args.len() + 1);
        cmd.push(process.path.clone());
        cmd.extend(process.args.iter().cloned());

        self.exec(
            &container.handle,
            cmd,
            &process.env,
            process.dir.as_deref(),
            stdin,
        )
        .await
    }

    async fn destroy(&self, handle: &str) -> BackendResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(handle, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) => match classify(handle, e) {
                BackendError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
