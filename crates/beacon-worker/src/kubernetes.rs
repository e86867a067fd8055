//! Kubernetes container backend.
//!
//! Each handle is a pod of the same name. An init container streams the
//! inputs into their volumes, then the `main` container idles until check
//! processes are exec'd into it.

use async_trait::async_trait;
use beacon_core::backend::{
    BackendContainer, BackendError, BackendResult, ContainerBackend, ContainerDefinition,
    ProcessOutput, ProcessSpec,
};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, Pod, PodSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::Client;
use kube::api::{Api, AttachParams, DeleteParams, PostParams};
use kube::runtime::wait::{await_condition, conditions::is_pod_running};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::container::HANDLE_LABEL;

pub const MAIN_CONTAINER: &str = "main";
pub const INPUTS_CONTAINER: &str = "inputs";

/// Environment variable carrying a process's stdin into the pod.
const STDIN_ENV: &str = "BEACON_STDIN";

/// Runs the wrapped process in `$0` with the payload from `STDIN_ENV` on stdin.
const EXEC_SCRIPT: &str =
    r#"cd "$0" && payload="$BEACON_STDIN" && unset BEACON_STDIN && printf '%s' "$payload" | "$@""#;

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct KubernetesBackend {
    client: Client,
    namespace: String,
    fetcher_image: String,
    startup_timeout: Duration,
}

impl KubernetesBackend {
    /// Connect using the in-cluster or kubeconfig defaults.
    pub async fn connect(
        namespace: impl Into<String>,
        fetcher_image: impl Into<String>,
    ) -> BackendResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, namespace, fetcher_image))
    }

    pub fn with_client(
        client: Client,
        namespace: impl Into<String>,
        fetcher_image: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            fetcher_image: fetcher_image.into(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Delete a pod that never became ready and hand back `err`.
    async fn abandon(&self, handle: &str, err: BackendError) -> BackendError {
        if let Err(cleanup) = self.destroy(handle).await {
            warn!(handle, error = %cleanup, "Failed to delete pod that did not start");
        }
        err
    }
}

fn classify(handle: &str, err: kube::Error) -> BackendError {
    match err {
        kube::Error::Api(response) => {
            BackendError::from_status(response.code, handle, response.message)
        }
        other => BackendError::Transport(other.to_string()),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The pod that backs `definition`.
pub fn pod_definition(definition: &ContainerDefinition, fetcher_image: &str) -> Pod {
    let mut volumes = Vec::new();
    let mut main_mounts = Vec::new();
    let mut input_mounts = Vec::new();
    let mut fetch_lines = vec!["set -e".to_string()];

    for (i, input) in definition.inputs.iter().enumerate() {
        let name = format!("input-{}", i);
        volumes.push(empty_dir(&name));
        let mount = VolumeMount {
            name,
            mount_path: input.dest_path.clone(),
            ..Default::default()
        };
        input_mounts.push(mount.clone());
        main_mounts.push(mount);
        fetch_lines.push(format!(
            "curl -sSfL {} | tar -x -C {}",
            shell_quote(&input.source_uri),
            shell_quote(&input.dest_path)
        ));
    }

    for (i, output) in definition.outputs.iter().enumerate() {
        let name = format!("output-{}", i);
        volumes.push(empty_dir(&name));
        main_mounts.push(VolumeMount {
            name,
            mount_path: output.clone(),
            ..Default::default()
        });
    }

    for (i, bind) in definition.bind_mounts.iter().enumerate() {
        let name = format!("bind-{}", i);
        volumes.push(Volume {
            name: name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: bind.src_path.clone(),
                type_: None,
            }),
            ..Default::default()
        });
        main_mounts.push(VolumeMount {
            name,
            mount_path: bind.dst_path.clone(),
            read_only: Some(bind.read_only),
            ..Default::default()
        });
    }

    let init_containers = if definition.inputs.is_empty() {
        None
    } else {
        Some(vec![Container {
            name: INPUTS_CONTAINER.to_string(),
            image: Some(fetcher_image.to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                fetch_lines.join("\n"),
            ]),
            volume_mounts: Some(input_mounts),
            ..Default::default()
        }])
    };

    let env: Vec<EnvVar> = definition
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let main = Container {
        name: MAIN_CONTAINER.to_string(),
        image: Some(definition.image.clone()),
        command: Some(vec![
            "tail".to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ]),
        env: if env.is_empty() { None } else { Some(env) },
        working_dir: definition.dir.clone(),
        volume_mounts: if main_mounts.is_empty() {
            None
        } else {
            Some(main_mounts)
        },
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(definition.handle.clone()),
            labels: Some(BTreeMap::from([(
                HANDLE_LABEL.to_string(),
                definition.handle.clone(),
            )])),
            annotations: Some(definition.labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers,
            containers: vec![main],
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// The command exec'd into the main container for `process`.
pub fn exec_command(process: &ProcessSpec, stdin: &[u8]) -> Vec<String> {
    let mut cmd = vec!["env".to_string()];
    cmd.extend(process.env.iter().map(|(k, v)| format!("{}={}", k, v)));
    cmd.push(format!("{}={}", STDIN_ENV, String::from_utf8_lossy(stdin)));
    cmd.push("sh".to_string());
    cmd.push("-c".to_string());
    cmd.push(EXEC_SCRIPT.to_string());
    cmd.push(process.dir.clone().unwrap_or_else(|| "/".to_string()));
    cmd.push(process.path.clone());
    cmd.extend(process.args.iter().cloned());
    cmd
}

/// Exit code reported by the exec status channel.
fn exit_code(status: Option<&Status>) -> i64 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.parse().ok())
        .unwrap_or(-1)
}

#[async_trait]
impl ContainerBackend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn lookup(&self, handle: &str) -> BackendResult<BackendContainer> {
        let pod = self
            .pods()
            .get_opt(handle)
            .await
            .map_err(|e| classify(handle, e))?
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;

        Ok(BackendContainer {
            handle: handle.to_string(),
            backend_id: pod.metadata.uid.unwrap_or_default(),
        })
    }

    async fn create(&self, definition: &ContainerDefinition) -> BackendResult<BackendContainer> {
        let handle = definition.handle.as_str();
        let api = self.pods();
        let pod = pod_definition(definition, &self.fetcher_image);

        info!(handle, image = %definition.image, namespace = %self.namespace, "creating pod");
        let created = api
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| match classify(handle, e) {
                BackendError::NotFound(_) => BackendError::Client(format!(
                    "namespace {} not found",
                    self.namespace
                )),
                other => other,
            })?;

        let running = match tokio::time::timeout(
            self.startup_timeout,
            await_condition(api, handle, is_pod_running()),
        )
        .await
        {
            Ok(Ok(running)) => running,
            Ok(Err(e)) => {
                let err = BackendError::Transport(e.to_string());
                return Err(self.abandon(handle, err).await);
            }
            Err(_) => {
                let err = BackendError::Server(format!(
                    "pod {} not running after {}s",
                    handle,
                    self.startup_timeout.as_secs()
                ));
                return Err(self.abandon(handle, err).await);
            }
        };
        debug!(handle, running = running.is_some(), "pod started");

        Ok(BackendContainer {
            handle: handle.to_string(),
            backend_id: created.metadata.uid.unwrap_or_default(),
        })
    }

    async fn run(
        &self,
        container: &BackendContainer,
        process: &ProcessSpec,
        stdin: Vec<u8>,
    ) -> BackendResult<ProcessOutput> {
        let handle = container.handle.as_str();
        let params = AttachParams::default()
            .container(MAIN_CONTAINER)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .pods()
            .exec(handle, exec_command(process, &stdin), &params)
            .await
            .map_err(|e| classify(handle, e))?;

        let missing = |what: &str| BackendError::Transport(format!("exec in {}: no {}", handle, what));
        let mut stdout_reader = attached.stdout().ok_or_else(|| missing("stdout"))?;
        let mut stderr_reader = attached.stderr().ok_or_else(|| missing("stderr"))?;
        let status = attached.take_status().ok_or_else(|| missing("status"))?;

        let mut output = ProcessOutput::default();
        let (out, err) = tokio::join!(
            stdout_reader.read_to_end(&mut output.stdout),
            stderr_reader.read_to_end(&mut output.stderr),
        );
        out.map_err(|e| BackendError::Transport(format!("read stdout: {}", e)))?;
        err.map_err(|e| BackendError::Transport(format!("read stderr: {}", e)))?;

        output.exit_code = exit_code(status.await.as_ref());
        attached
            .join()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(output)
    }

    async fn destroy(&self, handle: &str) -> BackendResult<()> {
        match self.pods().delete(handle, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match classify(handle, e) {
                BackendError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
