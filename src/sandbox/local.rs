//! Local backend: commands and files run directly on the host.
//!
//! Each sample gets a scratch directory under `<state_dir>/local/<set_id>`.
//! There is no isolation beyond that, so this backend is meant for runs
//! that are already inside an outer sandbox.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{
    EnvironmentSet, ExecRequest, ExecResult, HandleDescriptor, SampleMetadata, SandboxBackend,
    SandboxEnvironment, SandboxError, SandboxResult, DEFAULT_ENVIRONMENT,
};
use crate::config::ExecConfig;
use crate::identity::EnvironmentConfigIdentity;

/// Backend running sample environments in host directories.
pub(crate) struct LocalBackend {
    root: PathBuf,
    limits: ExecConfig,
}

impl LocalBackend {
    pub fn new(root: PathBuf, limits: ExecConfig) -> Self {
        Self { root, limits }
    }

    fn set_dir(&self, set_id: &str) -> PathBuf {
        self.root.join(set_id)
    }

    fn live_sets(&self) -> SandboxResult<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SandboxError::from_io(&e, &self.root)),
        };
        Ok(entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect())
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn validate_config(&self, identity: &EnvironmentConfigIdentity) -> SandboxResult<()> {
        if identity.config.is_some() {
            warn!(backend = "local", "config reference is ignored by the local backend");
        }
        Ok(())
    }

    async fn config_init(&self, _identity: &EnvironmentConfigIdentity) -> SandboxResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SandboxError::provisioning(format!("{}: {e}", self.root.display())))
    }

    async fn sample_setup(
        &self,
        _identity: &EnvironmentConfigIdentity,
        set_id: &str,
        _metadata: &SampleMetadata,
    ) -> SandboxResult<EnvironmentSet> {
        let dir = self.set_dir(set_id).join(DEFAULT_ENVIRONMENT);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::provisioning(format!("{}: {e}", dir.display())))?;
        debug!(target: "sandkit::sandbox", set_id, dir = %dir.display(), "created local workspace");

        let env = LocalEnvironment::new(dir, self.limits.clone());
        EnvironmentSet::new(
            set_id,
            vec![(
                DEFAULT_ENVIRONMENT.to_string(),
                Arc::new(env) as Arc<dyn SandboxEnvironment>,
            )],
        )
    }

    async fn sample_teardown(
        &self,
        _identity: &EnvironmentConfigIdentity,
        set_id: &str,
        _set: Option<&EnvironmentSet>,
        _interrupted: bool,
    ) -> SandboxResult<()> {
        let dir = self.set_dir(set_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(target: "sandkit::sandbox", set_id, "removed local workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::from_io(&e, &dir)),
        }
    }

    async fn config_cleanup(
        &self,
        _identity: &EnvironmentConfigIdentity,
        perform_cleanup: bool,
    ) -> SandboxResult<Vec<String>> {
        if perform_cleanup {
            return Ok(Vec::new());
        }
        Ok(self
            .live_sets()?
            .iter()
            .map(|path| path.display().to_string())
            .collect())
    }

    async fn cli_cleanup(&self, target: Option<&str>) -> SandboxResult<usize> {
        let targets = match target {
            Some(id) => vec![self.set_dir(id)].into_iter().filter(|p| p.is_dir()).collect(),
            None => self.live_sets()?,
        };
        let mut removed = 0;
        for dir in targets {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| SandboxError::from_io(&e, &dir))?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// A host directory acting as one environment.
pub(crate) struct LocalEnvironment {
    dir: PathBuf,
    limits: ExecConfig,
}

impl LocalEnvironment {
    pub fn new(dir: PathBuf, limits: ExecConfig) -> Self {
        Self { dir, limits }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }
}

#[async_trait]
impl SandboxEnvironment for LocalEnvironment {
    async fn exec(&self, request: ExecRequest) -> SandboxResult<ExecResult> {
        if request.user.is_some() {
            return Err(SandboxError::configuration(
                "the local backend cannot run commands as another user",
            ));
        }
        let (program, args) = request
            .cmd
            .split_first()
            .ok_or_else(|| SandboxError::execution("empty command"))?;
        let cwd = request
            .cwd
            .as_deref()
            .map_or_else(|| self.dir.clone(), |cwd| self.resolve(cwd));

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(&cwd)
            .envs(&request.env)
            .stdin(if request.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::execution(format!("failed to run '{program}': {e}")))?;
        let pid = child.id();

        if let (Some(input), Some(mut stdin)) = (request.input, child.stdin.take()) {
            tokio::spawn(async move {
                // The child may exit without reading its input.
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let wait = child.wait_with_output();
        let output = match request.timeout {
            Some(limit) => {
                if let Ok(output) = tokio::time::timeout(limit, wait).await {
                    output
                } else {
                    kill_process_group(pid);
                    return Err(SandboxError::timeout(limit));
                }
            }
            None => wait.await,
        }
        .map_err(|e| SandboxError::execution(format!("failed to wait for '{program}': {e}")))?;

        ExecResult::from_output(
            exit_code(output.status),
            output.stdout,
            output.stderr,
            self.limits.max_output_bytes,
        )
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::from_io(&e, parent))?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(|e| SandboxError::from_io(&e, path))
    }

    async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        let target = self.resolve(path);
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| SandboxError::from_io(&e, path))?;
        if meta.is_dir() {
            return Err(SandboxError::is_a_directory(path));
        }
        let size = usize::try_from(meta.len()).unwrap_or(usize::MAX);
        if size > self.limits.max_read_bytes {
            return Err(SandboxError::output_limit_exceeded(
                size,
                self.limits.max_read_bytes,
            ));
        }
        tokio::fs::read(&target)
            .await
            .map_err(|e| SandboxError::from_io(&e, path))
    }

    fn descriptor(&self) -> HandleDescriptor {
        HandleDescriptor {
            name: DEFAULT_ENVIRONMENT.to_string(),
            resource: self.dir.display().to_string(),
        }
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Kills the whole process group led by `pid`.
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        let _ = std::process::Command::new("kill")
            .args(["-KILL", &format!("-{pid}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecInput;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn environment(dir: &Path) -> LocalEnvironment {
        LocalEnvironment::new(dir.to_path_buf(), ExecConfig::default())
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let dir = tempdir().unwrap();
        let result = environment(dir.path())
            .exec(ExecRequest::new(["echo", "hi"]))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hi\n");
    }

    #[tokio::test]
    async fn test_exec_false_is_not_an_error() {
        let dir = tempdir().unwrap();
        let result = environment(dir.path())
            .exec(ExecRequest::new(["false"]))
            .await
            .unwrap();
        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_exec_missing_binary_is_execution_error() {
        let dir = tempdir().unwrap();
        let err = environment(dir.path())
            .exec(ExecRequest::new(["definitely-not-a-real-binary-xyz"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution { .. }));
    }

    #[tokio::test]
    async fn test_exec_input_env_and_cwd() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let env = environment(dir.path());

        let piped = env
            .exec(ExecRequest::new(["cat"]).with_input(ExecInput::Text("from stdin".into())))
            .await
            .unwrap();
        assert_eq!(piped.stdout, "from stdin");

        let vars = env
            .exec(ExecRequest::new(["sh", "-c", "echo $GREETING"]).with_env("GREETING", "hello"))
            .await
            .unwrap();
        assert_eq!(vars.stdout, "hello\n");

        let cwd = env
            .exec(ExecRequest::new(["pwd"]).with_cwd("sub"))
            .await
            .unwrap();
        assert!(cwd.stdout.trim_end().ends_with("sub"));
    }

    #[tokio::test]
    async fn test_exec_timeout_kills_command() {
        let dir = tempdir().unwrap();
        let started = Instant::now();
        let err = environment(dir.path())
            .exec(ExecRequest::new(["sleep", "10"]).with_timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_exec_binary_output_fails() {
        let dir = tempdir().unwrap();
        let err = environment(dir.path())
            .exec(ExecRequest::new(["printf", "\\377\\376"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Execution { .. }));
    }

    #[tokio::test]
    async fn test_exec_user_rejected() {
        let dir = tempdir().unwrap();
        let err = environment(dir.path())
            .exec(ExecRequest::new(["true"]).with_user("root"))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_write_then_read_text_and_binary() {
        let dir = tempdir().unwrap();
        let env = environment(dir.path());

        env.write_file("nested/dir/hello.txt", b"hello").await.unwrap();
        assert_eq!(env.read_file("nested/dir/hello.txt").await.unwrap(), b"hello");

        let binary = vec![0u8, 159, 146, 150, 255];
        env.write_file("blob.bin", &binary).await.unwrap();
        assert_eq!(env.read_file("blob.bin").await.unwrap(), binary);
    }

    #[tokio::test]
    async fn test_read_missing_file_leaves_environment_usable() {
        let dir = tempdir().unwrap();
        let env = environment(dir.path());

        let err = env.read_file("missing.txt").await.unwrap_err();
        assert!(err.is_not_found());

        env.write_file("present.txt", b"ok").await.unwrap();
        assert_eq!(env.read_file("present.txt").await.unwrap(), b"ok");
        assert!(env.exec(ExecRequest::new(["true"])).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_read_directory_fails() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        let err = environment(dir.path()).read_file("d").await.unwrap_err();
        assert!(matches!(err, SandboxError::IsADirectory { .. }));
    }

    #[tokio::test]
    async fn test_backend_setup_teardown_and_cli_cleanup() {
        let state = tempdir().unwrap();
        let backend = LocalBackend::new(state.path().join("local"), ExecConfig::default());
        let identity = EnvironmentConfigIdentity::new("local", None);

        backend.config_init(&identity).await.unwrap();
        let set = backend
            .sample_setup(&identity, "set-a", &SampleMetadata::new())
            .await
            .unwrap();
        assert_eq!(set.default_name(), DEFAULT_ENVIRONMENT);
        backend
            .sample_setup(&identity, "set-b", &SampleMetadata::new())
            .await
            .unwrap();

        backend
            .sample_teardown(&identity, "set-a", Some(&set), false)
            .await
            .unwrap();
        assert!(!state.path().join("local/set-a").exists());

        let live = backend.config_cleanup(&identity, false).await.unwrap();
        assert_eq!(live.len(), 1);
        assert!(live[0].ends_with("set-b"));

        assert_eq!(backend.cli_cleanup(None).await.unwrap(), 1);
        assert_eq!(backend.cli_cleanup(None).await.unwrap(), 0);
        assert_eq!(backend.cli_cleanup(Some("set-b")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_teardown_of_missing_set_is_ok() {
        let state = tempdir().unwrap();
        let backend = LocalBackend::new(state.path().join("local"), ExecConfig::default());
        let identity = EnvironmentConfigIdentity::new("local", None);
        backend
            .sample_teardown(&identity, "never-created", None, true)
            .await
            .unwrap();
    }
}
