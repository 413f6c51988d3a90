//! Docker backend: one container per service, one set per sample.
//!
//! Containers and networks carry `sandkit.*` labels so that anything
//! left behind by an interrupted run can be found and removed later
//! without the cleanup ledger.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    ListContainersOptions, LogOutput, NetworkingConfig, RemoveContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::service::{EndpointSettings, HostConfig};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::compose::{parse_memory_limit, ComposeConfig, ComposeTemplate, ServiceConfig, CONFIG_CANDIDATES};
use super::{
    EnvironmentSet, ExecRequest, ExecResult, HandleDescriptor, SampleMetadata, SandboxBackend,
    SandboxEnvironment, SandboxError, SandboxResult,
};
use crate::config::{DockerConfig, ExecConfig};
use crate::identity::EnvironmentConfigIdentity;

const LABEL_MANAGED: &str = "sandkit.managed";
const LABEL_PROJECT: &str = "sandkit.project";
const LABEL_SET: &str = "sandkit.set-id";
const LABEL_SERVICE: &str = "sandkit.service";

/// Exit codes `timeout(1)` reports when it had to stop the command.
const TIMEOUT_EXIT_CODES: [i64; 2] = [124, 137];

/// Extra time allowed on top of the in-container timeout before the
/// stream itself is abandoned.
const TIMEOUT_GRACE: Duration = Duration::from_secs(10);

/// Backend provisioning Docker containers.
pub(crate) struct DockerBackend {
    config: DockerConfig,
    limits: ExecConfig,
    client: OnceCell<Docker>,
    templates: Mutex<HashMap<EnvironmentConfigIdentity, Arc<ComposeTemplate>>>,
    ready_images: Mutex<HashSet<String>>,
}

impl DockerBackend {
    pub fn new(config: DockerConfig, limits: ExecConfig) -> Self {
        Self {
            config,
            limits,
            client: OnceCell::new(),
            templates: Mutex::new(HashMap::new()),
            ready_images: Mutex::new(HashSet::new()),
        }
    }

    async fn docker(&self) -> SandboxResult<&Docker> {
        self.client
            .get_or_try_init(|| async {
                let docker = Docker::connect_with_local_defaults().map_err(|e| {
                    SandboxError::docker_unavailable(format!(
                        "failed to connect to Docker ({e}). Is Docker running?"
                    ))
                })?;
                docker.ping().await.map_err(|e| {
                    SandboxError::docker_unavailable(format!(
                        "cannot ping Docker daemon ({e}). Is Docker running?"
                    ))
                })?;
                Ok::<_, SandboxError>(docker)
            })
            .await
    }

    /// The identity's template, read from disk on first use only.
    fn template(&self, identity: &EnvironmentConfigIdentity) -> SandboxResult<Arc<ComposeTemplate>> {
        let mut templates = self
            .templates
            .lock()
            .map_err(|_| SandboxError::configuration("template cache lock poisoned"))?;
        if let Some(template) = templates.get(identity) {
            return Ok(Arc::clone(template));
        }
        let template = Arc::new(ComposeTemplate::load(identity, &self.config.default_image)?);
        templates.insert(identity.clone(), Arc::clone(&template));
        Ok(template)
    }

    fn image_ready(&self, image: &str) -> bool {
        self.ready_images
            .lock()
            .map(|ready| ready.contains(image))
            .unwrap_or(false)
    }

    fn mark_image_ready(&self, image: &str) {
        if let Ok(mut ready) = self.ready_images.lock() {
            ready.insert(image.to_string());
        }
    }

    /// Builds or pulls the image a service needs.
    async fn prepare_image(
        &self,
        template: &ComposeTemplate,
        name: &str,
        service: &ServiceConfig,
    ) -> SandboxResult<String> {
        let image = template.image_for(name, service);
        if self.image_ready(&image) {
            return Ok(image);
        }
        let docker = self.docker().await?;
        if let Some(build) = &service.build {
            let context = template.base_dir().join(build.context());
            build_image(docker, &context, build.dockerfile(), &image).await?;
        } else if docker.inspect_image(&image).await.is_err() {
            if !self.config.pull_missing {
                return Err(SandboxError::provisioning(format!(
                    "image '{image}' is not present locally and pulling is disabled"
                )));
            }
            pull_image(docker, &image).await?;
        }
        self.mark_image_ready(&image);
        Ok(image)
    }

    fn build_container_config(
        &self,
        template: &ComposeTemplate,
        set_id: &str,
        name: &str,
        service: &ServiceConfig,
        image: String,
        network: Option<&str>,
    ) -> SandboxResult<ContainerConfig<String>> {
        let cmd = match &service.command {
            Some(command) => command.to_argv()?,
            None => vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
        };
        let memory = service
            .mem_limit
            .as_deref()
            .map(parse_memory_limit)
            .transpose()?;
        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = service.cpus.map(|cpus| (cpus * 1_000_000_000.0) as i64);

        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_PROJECT.to_string(), template.project().to_string()),
            (LABEL_SET.to_string(), set_id.to_string()),
            (LABEL_SERVICE.to_string(), name.to_string()),
        ]);

        let networking_config = network.filter(|_| service.network_mode.is_none()).map(|net| {
            NetworkingConfig {
                endpoints_config: HashMap::from([(
                    net.to_string(),
                    EndpointSettings {
                        aliases: Some(vec![name.to_string()]),
                        ..Default::default()
                    },
                )]),
            }
        });

        Ok(ContainerConfig {
            image: Some(image),
            cmd: Some(cmd),
            working_dir: Some(self.working_dir(service)),
            env: Some(service.environment.to_pairs()),
            user: service.user.clone(),
            labels: Some(labels),
            host_config: Some(HostConfig {
                init: Some(true),
                memory,
                nano_cpus,
                network_mode: service.network_mode.clone(),
                ..Default::default()
            }),
            networking_config,
            ..Default::default()
        })
    }

    fn working_dir(&self, service: &ServiceConfig) -> String {
        service
            .working_dir
            .clone()
            .unwrap_or_else(|| self.config.working_dir.clone())
    }

    async fn provision(
        &self,
        identity: &EnvironmentConfigIdentity,
        set_id: &str,
        config: &ComposeConfig,
    ) -> SandboxResult<EnvironmentSet> {
        let template = self.template(identity)?;
        let docker = self.docker().await?;

        let network = if config.services.len() > 1 {
            let name = network_name(set_id);
            docker
                .create_network(CreateNetworkOptions {
                    name: name.clone(),
                    labels: HashMap::from([
                        (LABEL_MANAGED.to_string(), "true".to_string()),
                        (LABEL_PROJECT.to_string(), template.project().to_string()),
                        (LABEL_SET.to_string(), set_id.to_string()),
                    ]),
                    ..Default::default()
                })
                .await
                .map_err(|e| SandboxError::provisioning(format!("failed to create network: {e}")))?;
            Some(name)
        } else {
            None
        };

        let mut environments = Vec::new();
        for (name, service) in &config.services {
            let image = self.prepare_image(&template, name, service).await?;
            let container = container_name(set_id, name);
            let container_config = self.build_container_config(
                &template,
                set_id,
                name,
                service,
                image,
                network.as_deref(),
            )?;

            debug!(target: "sandkit::sandbox", container = %container, "creating container");
            docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: container.clone(),
                        platform: None,
                    }),
                    container_config,
                )
                .await
                .map_err(|e| {
                    SandboxError::provisioning(format!("failed to create container {container}: {e}"))
                })?;
            docker
                .start_container::<String>(&container, None)
                .await
                .map_err(|e| {
                    SandboxError::provisioning(format!("failed to start container {container}: {e}"))
                })?;

            let env = DockerEnvironment {
                docker: docker.clone(),
                container,
                service: name.clone(),
                working_dir: self.working_dir(service),
                limits: self.limits.clone(),
            };
            environments.push((name.clone(), Arc::new(env) as Arc<dyn SandboxEnvironment>));
        }
        EnvironmentSet::new(set_id, environments)
    }

    /// Force-removes containers and networks matching a label filter.
    async fn remove_labelled(&self, label: &str) -> SandboxResult<usize> {
        let docker = self.docker().await?;
        let containers = list_labelled(docker, label).await?;
        let mut removed = 0;
        let mut failures = Vec::new();
        for container in containers {
            match docker
                .remove_container(
                    &container,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => removed += 1,
                Err(e) if is_status(&e, 404) => {}
                Err(e) => failures.push(format!("{container}: {e}")),
            }
        }

        let networks = docker
            .list_networks(Some(ListNetworksOptions {
                filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            }))
            .await
            .map_err(|e| SandboxError::provisioning(format!("failed to list networks: {e}")))?;
        for network in networks.into_iter().filter_map(|n| n.name) {
            if let Err(e) = docker.remove_network(&network).await {
                if !is_status(&e, 404) {
                    failures.push(format!("{network}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(SandboxError::provisioning(format!(
                "failed to remove: {}",
                failures.join("; ")
            )))
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn config_candidates(&self) -> &'static [&'static str] {
        CONFIG_CANDIDATES
    }

    async fn validate_config(&self, identity: &EnvironmentConfigIdentity) -> SandboxResult<()> {
        self.template(identity)?.render(&SampleMetadata::new())?;
        Ok(())
    }

    async fn config_init(&self, identity: &EnvironmentConfigIdentity) -> SandboxResult<()> {
        let template = self.template(identity)?;
        let config = template.render(&SampleMetadata::new())?;
        for (name, service) in &config.services {
            let image = self.prepare_image(&template, name, service).await?;
            info!(target: "sandkit::sandbox", service = %name, image = %image, "image ready");
        }
        Ok(())
    }

    async fn sample_setup(
        &self,
        identity: &EnvironmentConfigIdentity,
        set_id: &str,
        metadata: &SampleMetadata,
    ) -> SandboxResult<EnvironmentSet> {
        let config = self.template(identity)?.render(metadata)?;
        match self.provision(identity, set_id, &config).await {
            Ok(set) => Ok(set),
            Err(err) => {
                // Do not leave half a set running.
                if let Err(cleanup) = self.remove_labelled(&set_label(set_id)).await {
                    warn!(set_id, error = %cleanup, "failed to remove partially provisioned set");
                }
                Err(err)
            }
        }
    }

    async fn sample_teardown(
        &self,
        _identity: &EnvironmentConfigIdentity,
        set_id: &str,
        _set: Option<&EnvironmentSet>,
        interrupted: bool,
    ) -> SandboxResult<()> {
        debug!(target: "sandkit::sandbox", set_id, interrupted, "removing containers");
        self.remove_labelled(&set_label(set_id))
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::interrupted_cleanup(set_id, e.to_string()))
    }

    async fn config_cleanup(
        &self,
        identity: &EnvironmentConfigIdentity,
        perform_cleanup: bool,
    ) -> SandboxResult<Vec<String>> {
        let label = format!("{LABEL_PROJECT}={}", self.template(identity)?.project());
        if perform_cleanup {
            let removed = self.remove_labelled(&label).await?;
            if removed > 0 {
                info!(target: "sandkit::sandbox", removed, "removed leftover containers");
            }
            return Ok(Vec::new());
        }
        let docker = self.docker().await?;
        list_labelled(docker, &label).await
    }

    async fn cli_cleanup(&self, target: Option<&str>) -> SandboxResult<usize> {
        match target {
            None => self.remove_labelled(&format!("{LABEL_MANAGED}=true")).await,
            Some(target) => {
                let by_set = self.remove_labelled(&set_label(target)).await?;
                if by_set > 0 {
                    return Ok(by_set);
                }
                // Fall back to a container name or id.
                let docker = self.docker().await?;
                let managed = list_labelled(docker, &format!("{LABEL_MANAGED}=true")).await?;
                if !managed.iter().any(|name| name == target || name.starts_with(target)) {
                    return Ok(0);
                }
                match docker
                    .remove_container(
                        target,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await
                {
                    Ok(()) => Ok(1),
                    Err(e) if is_status(&e, 404) => Ok(0),
                    Err(e) => Err(SandboxError::provisioning(format!(
                        "failed to remove {target}: {e}"
                    ))),
                }
            }
        }
    }
}

/// A running container acting as one environment.
pub(crate) struct DockerEnvironment {
    docker: Docker,
    container: String,
    service: String,
    working_dir: String,
    limits: ExecConfig,
}

impl DockerEnvironment {
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.working_dir.trim_end_matches('/'), path)
        }
    }
}

#[async_trait]
impl SandboxEnvironment for DockerEnvironment {
    async fn exec(&self, request: ExecRequest) -> SandboxResult<ExecResult> {
        if request.cmd.is_empty() {
            return Err(SandboxError::execution("empty command"));
        }
        let cmd = match request.timeout {
            Some(limit) => with_timeout_wrapper(&request.cmd, limit),
            None => request.cmd.clone(),
        };
        let env: Vec<String> = request.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let cwd = request
            .cwd
            .as_deref()
            .map_or_else(|| self.working_dir.clone(), |cwd| self.resolve(cwd));

        let exec = self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env),
                    working_dir: Some(cwd),
                    user: request.user.clone(),
                    attach_stdin: Some(request.input.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::execution(format!("failed to create exec: {e}")))?;

        let run = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let StartExecResults::Attached {
                output: mut stream,
                mut input,
            } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| SandboxError::execution(format!("failed to start exec: {e}")))?
            {
                if let Some(data) = &request.input {
                    input
                        .write_all(data.as_bytes())
                        .await
                        .map_err(|e| SandboxError::execution(format!("failed to write stdin: {e}")))?;
                    input
                        .shutdown()
                        .await
                        .map_err(|e| SandboxError::execution(format!("failed to close stdin: {e}")))?;
                }
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                            stdout.extend_from_slice(&message);
                        }
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::StdIn { .. }) => {}
                        Err(e) => warn!("Error reading exec output: {}", e),
                    }
                    let size = stdout.len() + stderr.len();
                    if size > self.limits.max_output_bytes {
                        return Err(SandboxError::output_limit_exceeded(
                            size,
                            self.limits.max_output_bytes,
                        ));
                    }
                }
            }
            Ok::<_, SandboxError>((stdout, stderr))
        };

        let (stdout, stderr) = match request.timeout {
            Some(limit) => tokio::time::timeout(limit + TIMEOUT_GRACE, run)
                .await
                .map_err(|_| SandboxError::timeout(limit))??,
            None => run.await?,
        };

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::execution(format!("failed to inspect exec: {e}")))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        if let Some(limit) = request.timeout {
            if TIMEOUT_EXIT_CODES.contains(&exit_code) {
                return Err(SandboxError::timeout(limit));
            }
        }

        ExecResult::from_output(
            i32::try_from(exit_code).unwrap_or(-1),
            stdout,
            stderr,
            self.limits.max_output_bytes,
        )
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()> {
        let target = self.resolve(path);
        let (parent, file_name) = split_parent(&target);

        let mkdir = self.exec(ExecRequest::new(["mkdir", "-p", parent])).await?;
        if !mkdir.success {
            return Err(if mkdir.stderr.contains("Permission denied") {
                SandboxError::permission_denied(path)
            } else {
                SandboxError::execution(format!("failed to create {parent}: {}", mkdir.stderr))
            });
        }

        let archive = single_file_tar(file_name, contents)?;
        self.docker
            .upload_to_container(
                &self.container,
                Some(UploadToContainerOptions {
                    path: parent.to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| map_file_error(&e, path))
    }

    async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        let target = self.resolve(path);
        let mut stream = self.docker.download_from_container(
            &self.container,
            Some(DownloadFromContainerOptions { path: target }),
        );

        let mut archive = Vec::new();
        // Tar framing adds at most a few blocks on top of the file itself.
        let limit = self.limits.max_read_bytes.saturating_add(64 * 1024);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_file_error(&e, path))?;
            archive.extend_from_slice(&chunk);
            if archive.len() > limit {
                return Err(SandboxError::output_limit_exceeded(
                    archive.len(),
                    self.limits.max_read_bytes,
                ));
            }
        }
        extract_single_file(&archive, path)
    }

    fn descriptor(&self) -> HandleDescriptor {
        HandleDescriptor {
            name: self.service.clone(),
            resource: self.container.clone(),
        }
    }
}

fn container_name(set_id: &str, service: &str) -> String {
    format!("sandkit-{set_id}-{}", service.to_lowercase())
}

fn network_name(set_id: &str) -> String {
    format!("sandkit-{set_id}")
}

fn set_label(set_id: &str) -> String {
    format!("{LABEL_SET}={set_id}")
}

fn is_status(err: &DockerError, status: u16) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code, .. } if *status_code == status)
}

fn map_file_error(err: &DockerError, path: &str) -> SandboxError {
    match err {
        DockerError::DockerResponseServerError { status_code: 404, .. } => {
            SandboxError::not_found(path)
        }
        DockerError::DockerResponseServerError { status_code: 403, .. } => {
            SandboxError::permission_denied(path)
        }
        other => SandboxError::execution(format!("{path}: {other}")),
    }
}

async fn list_labelled(docker: &Docker, label: &str) -> SandboxResult<Vec<String>> {
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        }))
        .await
        .map_err(|e| SandboxError::provisioning(format!("failed to list containers: {e}")))?;
    Ok(containers
        .into_iter()
        .filter_map(|c| {
            c.names
                .and_then(|names| names.into_iter().next())
                .map(|name| name.trim_start_matches('/').to_string())
                .or(c.id)
        })
        .collect())
}

/// Prefixes `cmd` with `timeout(1)` so the process is killed inside the
/// container rather than merely abandoned.
fn with_timeout_wrapper(cmd: &[String], limit: Duration) -> Vec<String> {
    let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
    let mut wrapped = vec![
        "timeout".to_string(),
        "-k".to_string(),
        "5s".to_string(),
        format!("{}s", secs.max(1)),
    ];
    wrapped.extend(cmd.iter().cloned());
    wrapped
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => (".", path),
    }
}

fn single_file_tar(name: &str, contents: &[u8]) -> SandboxResult<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
    );
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, name, contents)
        .map_err(|e| SandboxError::execution(format!("failed to build archive: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| SandboxError::execution(format!("failed to finalize archive: {e}")))
}

fn extract_single_file(archive: &[u8], path: &str) -> SandboxResult<Vec<u8>> {
    let mut archive = tar::Archive::new(archive);
    let mut entries = archive
        .entries()
        .map_err(|e| SandboxError::execution(format!("invalid archive for {path}: {e}")))?;
    let mut entry = entries
        .next()
        .ok_or_else(|| SandboxError::not_found(path))?
        .map_err(|e| SandboxError::execution(format!("invalid archive for {path}: {e}")))?;
    if entry.header().entry_type().is_dir() {
        return Err(SandboxError::is_a_directory(path));
    }
    let mut contents = Vec::new();
    entry
        .read_to_end(&mut contents)
        .map_err(|e| SandboxError::execution(format!("failed to read {path}: {e}")))?;
    Ok(contents)
}

/// Build an image from a Dockerfile in `context`.
async fn build_image(docker: &Docker, context: &Path, dockerfile: &str, tag: &str) -> SandboxResult<()> {
    info!(target: "sandkit::sandbox", tag, "building image from {}", context.display());
    if !context.join(dockerfile).exists() {
        return Err(SandboxError::configuration(format!(
            "Dockerfile not found: {}",
            context.join(dockerfile).display()
        )));
    }

    let mut tar_buf = Vec::new();
    {
        let mut tar = tar::Builder::new(&mut tar_buf);
        tar.append_dir_all(".", context)
            .map_err(|e| SandboxError::provisioning(format!("failed to archive build context: {e}")))?;
        tar.finish()
            .map_err(|e| SandboxError::provisioning(format!("failed to finalize build context: {e}")))?;
    }

    let options = BuildImageOptions {
        dockerfile: dockerfile.to_string(),
        t: tag.to_string(),
        rm: true,
        ..Default::default()
    };
    let mut stream = docker.build_image(options, None, Some(Bytes::from(tar_buf)));
    while let Some(chunk) = stream.next().await {
        let output =
            chunk.map_err(|e| SandboxError::provisioning(format!("error building image: {e}")))?;
        if let Some(text) = output.stream.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            debug!(target: "sandkit::sandbox", "{text}");
        }
        if let Some(error) = output.error {
            return Err(SandboxError::provisioning(format!("docker build error: {error}")));
        }
    }
    Ok(())
}

/// Pull an image from its registry.
async fn pull_image(docker: &Docker, image: &str) -> SandboxResult<()> {
    info!(target: "sandkit::sandbox", image, "pulling image");
    let (name, tag) = parse_image_tag(image);
    let options = CreateImageOptions {
        from_image: name,
        tag,
        ..Default::default()
    };
    let mut stream = docker.create_image(Some(options), None, None);
    while let Some(chunk) = stream.next().await {
        let output = chunk
            .map_err(|e| SandboxError::provisioning(format!("error pulling {image}: {e}")))?;
        if let Some(error) = output.error {
            return Err(SandboxError::provisioning(format!("docker pull error: {error}")));
        }
        if let Some(status) = output.status.as_deref() {
            debug!(target: "sandkit::sandbox", "{status}");
        }
    }
    Ok(())
}

/// Parse image name and tag from a string.
fn parse_image_tag(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(colon_pos) if !image[colon_pos..].contains('/') => {
            let (name, tag) = image.split_at(colon_pos);
            (name, &tag[1..])
        }
        _ => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_tag() {
        assert_eq!(parse_image_tag("ralph:latest"), ("ralph", "latest"));
        assert_eq!(parse_image_tag("myregistry/app:v1.0"), ("myregistry/app", "v1.0"));
        assert_eq!(
            parse_image_tag("registry.example.com:5000/app:dev"),
            ("registry.example.com:5000/app", "dev")
        );
    }

    #[test]
    fn test_parse_image_no_tag() {
        assert_eq!(parse_image_tag("alpine"), ("alpine", "latest"));
        assert_eq!(
            parse_image_tag("registry:5000/image"),
            ("registry:5000/image", "latest")
        );
    }

    #[test]
    fn test_container_and_network_names() {
        assert_eq!(container_name("ab12", "Victim"), "sandkit-ab12-victim");
        assert_eq!(network_name("ab12"), "sandkit-ab12");
        assert_eq!(set_label("ab12"), "sandkit.set-id=ab12");
    }

    #[test]
    fn test_timeout_wrapper_rounds_up() {
        let cmd = vec!["sleep".to_string(), "5".to_string()];
        assert_eq!(
            with_timeout_wrapper(&cmd, Duration::from_millis(1500)),
            vec!["timeout", "-k", "5s", "2s", "sleep", "5"]
        );
        assert_eq!(with_timeout_wrapper(&cmd, Duration::ZERO)[3], "1s");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/workspace/a/b.txt"), ("/workspace/a", "b.txt"));
        assert_eq!(split_parent("/b.txt"), ("/", "b.txt"));
        assert_eq!(split_parent("b.txt"), (".", "b.txt"));
    }

    #[test]
    fn test_tar_helpers_preserve_binary_content() {
        let contents = vec![0u8, 1, 2, 255, 254];
        let archive = single_file_tar("blob.bin", &contents).unwrap();
        assert_eq!(extract_single_file(&archive, "blob.bin").unwrap(), contents);
    }

    #[test]
    fn test_extract_from_empty_archive_is_not_found() {
        let archive = tar::Builder::new(Vec::new()).into_inner().unwrap();
        assert!(extract_single_file(&archive, "x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_container_config_labels_and_limits() {
        let backend = DockerBackend::new(DockerConfig::default(), ExecConfig::default());
        let identity = EnvironmentConfigIdentity::new("docker", Some("alpine:3.20".into()));
        let template = backend.template(&identity).unwrap();
        let service = ServiceConfig {
            image: Some("alpine:3.20".into()),
            mem_limit: Some("512m".into()),
            cpus: Some(0.5),
            ..Default::default()
        };
        let config = backend
            .build_container_config(&template, "set1", "default", &service, "alpine:3.20".into(), Some("net"))
            .unwrap();

        let labels = config.labels.unwrap();
        assert_eq!(labels[LABEL_SET], "set1");
        assert_eq!(labels[LABEL_SERVICE], "default");
        assert_eq!(labels[LABEL_MANAGED], "true");
        assert_eq!(config.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(
            config.cmd.unwrap(),
            vec!["tail", "-f", "/dev/null"]
        );
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert!(config.networking_config.is_some());
    }

    #[test]
    fn test_template_loaded_once_per_identity() {
        let backend = DockerBackend::new(DockerConfig::default(), ExecConfig::default());
        let identity = EnvironmentConfigIdentity::new("docker", None);
        let a = backend.template(&identity).unwrap();
        let b = backend.template(&identity).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_cli_cleanup_unknown_target_without_docker() {
        // Passes whether or not a Docker daemon is reachable.
        let backend = DockerBackend::new(DockerConfig::default(), ExecConfig::default());
        match backend.cli_cleanup(Some("sandkit-no-such-set")).await {
            Ok(removed) => assert_eq!(removed, 0),
            Err(e) => assert!(e.is_provisioning(), "unexpected error: {e}"),
        }
    }
}
