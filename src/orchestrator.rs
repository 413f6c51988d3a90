//! Sandbox lifecycle orchestration.
//!
//! Tasks are prepared up front: each resolves to an identity, identities
//! are deduplicated, and every identity counts the tasks that share it.
//! `config_init` runs once per identity, on first need, with concurrent
//! callers waiting on the same result. Each sample then walks
//! `Pending → Provisioned → Active → Teardown → Released`, or ends
//! `Orphaned` when teardown is skipped, fails, or is cut short by
//! cancellation. When the last task of an identity completes,
//! `config_cleanup` runs once.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assets::{setup_interpreter, SampleAssets};
use crate::cleanup::CleanupRegistry;
use crate::governor::Governor;
use crate::identity::{self, EnvironmentConfigIdentity, SandboxSpec};
use crate::sandbox::{
    BackendRegistry, EnvironmentSet, ExecRequest, ExecResult, HandleDescriptor, SampleMetadata,
    SandboxBackend, SandboxEnvironment, SandboxError, SandboxResult,
};

/// Where setup scripts are written, relative to the default environment.
const SETUP_SCRIPT: &str = ".sandkit-setup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdentityState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    CleaningUp,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleState {
    Pending,
    Provisioned,
    Active,
    Teardown,
    Released,
    Orphaned,
}

/// A task as declared: its name, its sandbox, and where it lives.
#[derive(Debug, Clone)]
pub(crate) struct TaskSpec {
    pub name: String,
    pub sandbox: Option<SandboxSpec>,
    pub dir: PathBuf,
}

/// One unit of work.
#[derive(Debug, Clone, Default)]
pub(crate) struct SampleSpec {
    pub id: String,
    pub metadata: SampleMetadata,
    pub assets: SampleAssets,
}

/// A task bound to its backend and identity.
#[derive(Clone)]
pub(crate) struct PreparedTask {
    pub name: String,
    pub identity: EnvironmentConfigIdentity,
    pub dir: PathBuf,
    backend: Arc<dyn SandboxBackend>,
}

/// A set deliberately left running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetainedSet {
    pub backend: String,
    pub set_id: String,
    pub handles: Vec<HandleDescriptor>,
}

#[derive(Debug, Clone)]
pub(crate) struct OrchestratorOptions {
    /// Tear environments down after each sample and task.
    pub cleanup: bool,
    /// Upper bound on teardown after cancellation.
    pub teardown_grace: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            cleanup: true,
            teardown_grace: Duration::from_secs(30),
        }
    }
}

struct IdentityEntry {
    backend: Arc<dyn SandboxBackend>,
    init: OnceCell<Result<(), String>>,
    state: Mutex<IdentityState>,
    tasks: AtomicUsize,
}

pub(crate) struct Orchestrator {
    backends: Arc<BackendRegistry>,
    ledger: CleanupRegistry,
    governor: Governor,
    cancel: CancellationToken,
    options: OrchestratorOptions,
    identities: Mutex<HashMap<EnvironmentConfigIdentity, Arc<IdentityEntry>>>,
    samples: Mutex<BTreeMap<String, SampleState>>,
    retained: Mutex<Vec<RetainedSet>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sample_key(task: &str, sample: &str) -> String {
    format!("{task}/{sample}")
}

fn ledger_error(err: &anyhow::Error) -> SandboxError {
    SandboxError::provisioning(format!("cleanup ledger: {err:#}"))
}

/// Wraps a failure during asset installation, keeping cancellation intact.
fn setup_error(err: SandboxError, what: &str) -> SandboxError {
    if err.is_interrupted() || err.is_provisioning() {
        err
    } else {
        SandboxError::provisioning(format!("{what}: {err}"))
    }
}

impl Orchestrator {
    pub fn new(
        backends: Arc<BackendRegistry>,
        ledger: CleanupRegistry,
        governor: Governor,
        cancel: CancellationToken,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            backends,
            ledger,
            governor,
            cancel,
            options,
            identities: Mutex::new(HashMap::new()),
            samples: Mutex::new(BTreeMap::new()),
            retained: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves every task's backend and identity and validates configs.
    ///
    /// Any configuration error here is fatal to the whole run, before a
    /// single sample is provisioned.
    pub async fn prepare(
        &self,
        tasks: &[TaskSpec],
        run_override: Option<&SandboxSpec>,
    ) -> SandboxResult<Vec<PreparedTask>> {
        let mut prepared = Vec::with_capacity(tasks.len());
        for task in tasks {
            let spec = SandboxSpec::effective(run_override, task.sandbox.as_ref()).ok_or_else(|| {
                SandboxError::configuration(format!("task '{}' declares no sandbox", task.name))
            })?;
            let backend = self.backends.resolve(&spec.backend)?;
            let identity = identity::resolve_with_discovery(
                &spec.backend,
                spec.config.as_deref(),
                &task.dir,
                backend.config_candidates(),
            );

            let (entry, fresh) = {
                let mut identities = lock(&self.identities);
                let fresh = !identities.contains_key(&identity);
                let entry = Arc::clone(identities.entry(identity.clone()).or_insert_with(|| {
                    Arc::new(IdentityEntry {
                        backend: Arc::clone(&backend),
                        init: OnceCell::new(),
                        state: Mutex::new(IdentityState::Uninitialized),
                        tasks: AtomicUsize::new(0),
                    })
                }));
                (entry, fresh)
            };
            if fresh {
                backend.validate_config(&identity).await?;
            }
            entry.tasks.fetch_add(1, Ordering::SeqCst);

            debug!(task = %task.name, identity = %identity, "task prepared");
            prepared.push(PreparedTask {
                name: task.name.clone(),
                identity,
                dir: task.dir.clone(),
                backend,
            });
        }
        Ok(prepared)
    }

    fn entry(&self, identity: &EnvironmentConfigIdentity) -> SandboxResult<Arc<IdentityEntry>> {
        lock(&self.identities)
            .get(identity)
            .cloned()
            .ok_or_else(|| SandboxError::configuration(format!("identity {identity} was not prepared")))
    }

    fn set_identity_state(entry: &IdentityEntry, state: IdentityState) {
        *lock(&entry.state) = state;
    }

    pub fn identity_state(&self, identity: &EnvironmentConfigIdentity) -> Option<IdentityState> {
        lock(&self.identities)
            .get(identity)
            .map(|entry| *lock(&entry.state))
    }

    pub fn sample_state(&self, task: &str, sample: &str) -> Option<SampleState> {
        lock(&self.samples).get(&sample_key(task, sample)).copied()
    }

    fn set_sample_state(&self, key: &str, state: SampleState) {
        lock(&self.samples).insert(key.to_string(), state);
    }

    /// Sets left running because cleanup was disabled.
    pub fn retained(&self) -> Vec<RetainedSet> {
        lock(&self.retained).clone()
    }

    /// Runs `config_init` for `identity` at most once; concurrent callers
    /// share the outcome, failures included.
    async fn ensure_initialized(&self, identity: &EnvironmentConfigIdentity) -> SandboxResult<()> {
        let entry = self.entry(identity)?;
        let outcome = entry
            .init
            .get_or_init(|| async {
                Self::set_identity_state(&entry, IdentityState::Initializing);
                info!(identity = %identity, "initializing sandbox config");
                match entry.backend.config_init(identity).await {
                    Ok(()) => {
                        Self::set_identity_state(&entry, IdentityState::Ready);
                        Ok(())
                    }
                    Err(e) => {
                        Self::set_identity_state(&entry, IdentityState::Failed);
                        Err(e.to_string())
                    }
                }
            })
            .await;
        outcome.clone().map_err(SandboxError::provisioning)
    }

    /// Provisions a set for `sample`, runs `body` against it, and tears
    /// the set down.
    ///
    /// Provisioning failures abort only this sample. `body` never sees a
    /// set whose assets or setup script are incomplete.
    pub async fn run_sample<F, Fut, T>(
        &self,
        task: &PreparedTask,
        sample: &SampleSpec,
        body: F,
    ) -> SandboxResult<T>
    where
        F: FnOnce(SampleContext) -> Fut,
        Fut: Future<Output = SandboxResult<T>>,
    {
        let key = sample_key(&task.name, &sample.id);
        self.set_sample_state(&key, SampleState::Pending);
        if self.cancel.is_cancelled() {
            return Err(SandboxError::Interrupted);
        }

        self.ensure_initialized(&task.identity).await?;
        let _slot = self.governor.acquire_sandbox(&self.cancel).await?;

        let set_id = new_set_id();
        let record = self
            .ledger
            .register(&task.identity, &set_id)
            .map_err(|e| ledger_error(&e))?;
        debug!(target: "sandkit::sandbox", sample = %key, set_id = %set_id, "provisioning");

        let provisioned = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SandboxError::Interrupted),
            result = task.backend.sample_setup(&task.identity, &set_id, &sample.metadata) => result,
        };
        let set = match provisioned {
            Ok(set) => Arc::new(set),
            Err(err) => {
                warn!(sample = %key, set_id = %set_id, "provisioning failed: {err}");
                self.teardown(task, &key, &record.record_id, &set_id, None).await;
                return Err(err);
            }
        };
        self.set_sample_state(&key, SampleState::Provisioned);
        if let Err(e) = self.ledger.activate(&record.record_id, set.descriptors()) {
            warn!(set_id = %set_id, "failed to record handles: {e:#}");
        }

        let context = SampleContext {
            set: Arc::clone(&set),
            governor: self.governor.clone(),
            cancel: self.cancel.clone(),
        };
        let result = match self.install_assets(task, sample, &context).await {
            Ok(()) => {
                self.set_sample_state(&key, SampleState::Active);
                info!(sample = %key, set_id = %set_id, environments = set.len(), "sample environment ready");
                body(context).await
            }
            Err(err) => {
                warn!(sample = %key, set_id = %set_id, "sample setup failed: {err}");
                Err(err)
            }
        };

        self.teardown(task, &key, &record.record_id, &set_id, Some(&set))
            .await;
        result
    }

    /// Copies sample files, then runs the setup script in the default
    /// environment.
    async fn install_assets(
        &self,
        task: &PreparedTask,
        sample: &SampleSpec,
        context: &SampleContext,
    ) -> SandboxResult<()> {
        if sample.assets.is_empty() {
            return Ok(());
        }
        let assets = sample.assets.resolve(&task.dir)?;
        for file in &assets.files {
            context
                .environment(file.environment.as_deref())?
                .write_file(&file.path, &file.contents)
                .await
                .map_err(|e| setup_error(e, &format!("failed to copy {}", file.path)))?;
        }

        let Some(script) = assets.setup else {
            return Ok(());
        };
        let mut cmd = setup_interpreter(&script)?;
        cmd.push(SETUP_SCRIPT.to_string());

        let sandbox = context.sandbox()?;
        sandbox
            .write_file(SETUP_SCRIPT, &script)
            .await
            .map_err(|e| setup_error(e, "failed to write setup script"))?;
        debug!(target: "sandkit::sandbox", set_id = %context.set_id(), "running setup script");
        let outcome = sandbox
            .exec(ExecRequest::new(cmd))
            .await
            .map_err(|e| setup_error(e, "setup script could not run"))?;
        if !outcome.success {
            return Err(SandboxError::provisioning(format!(
                "setup script exited with status {}: {}",
                outcome.exit_code,
                outcome.stderr.trim()
            )));
        }
        if let Err(e) = sandbox.exec(ExecRequest::new(["rm", "-f", SETUP_SCRIPT])).await {
            debug!(target: "sandkit::sandbox", "failed to remove setup script: {e}");
        }
        Ok(())
    }

    /// Releases a sample's set, or records it as orphaned.
    async fn teardown(
        &self,
        task: &PreparedTask,
        key: &str,
        record_id: &str,
        set_id: &str,
        set: Option<&EnvironmentSet>,
    ) {
        self.set_sample_state(key, SampleState::Teardown);
        let interrupted = self.cancel.is_cancelled();

        if !self.options.cleanup && !interrupted && set.is_some() {
            if let Err(e) = self.ledger.mark_orphaned(record_id, false) {
                warn!(set_id, "failed to update cleanup record: {e:#}");
            }
            lock(&self.retained).push(RetainedSet {
                backend: task.identity.backend.clone(),
                set_id: set_id.to_string(),
                handles: set.map(EnvironmentSet::descriptors).unwrap_or_default(),
            });
            self.set_sample_state(key, SampleState::Orphaned);
            return;
        }

        debug!(target: "sandkit::sandbox", set_id, interrupted, "tearing down");
        let teardown = task
            .backend
            .sample_teardown(&task.identity, set_id, set, interrupted);
        let outcome = if interrupted {
            tokio::time::timeout(self.options.teardown_grace, teardown)
                .await
                .unwrap_or_else(|_| {
                    Err(SandboxError::interrupted_cleanup(
                        set_id,
                        format!(
                            "teardown exceeded the {}s grace period",
                            self.options.teardown_grace.as_secs()
                        ),
                    ))
                })
        } else {
            teardown.await
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.ledger.unregister(record_id) {
                    warn!(set_id, "failed to remove cleanup record: {e:#}");
                }
                self.set_sample_state(key, SampleState::Released);
            }
            Err(err) => {
                warn!(
                    backend = %task.identity.backend,
                    set_id,
                    "{err}; run `sandkit cleanup {} {set_id}` to remove it",
                    task.identity.backend
                );
                if let Err(e) = self.ledger.mark_orphaned(record_id, interrupted) {
                    warn!(set_id, "failed to update cleanup record: {e:#}");
                }
                self.set_sample_state(key, SampleState::Orphaned);
            }
        }
    }

    /// Marks one task finished. The last task of an identity triggers
    /// `config_cleanup`; with cleanup disabled its report of still-live
    /// resources is returned.
    pub async fn task_complete(&self, task: &PreparedTask) -> SandboxResult<Vec<String>> {
        let entry = self.entry(&task.identity)?;
        if entry.tasks.fetch_sub(1, Ordering::SeqCst) != 1 {
            return Ok(Vec::new());
        }

        let initialized = *lock(&entry.state) == IdentityState::Ready;
        if !initialized {
            Self::set_identity_state(&entry, IdentityState::Done);
            return Ok(Vec::new());
        }

        Self::set_identity_state(&entry, IdentityState::CleaningUp);
        debug!(target: "sandkit::sandbox", identity = %task.identity, "config cleanup");
        let cleanup = entry
            .backend
            .config_cleanup(&task.identity, self.options.cleanup);
        let result = if self.cancel.is_cancelled() {
            tokio::time::timeout(self.options.teardown_grace, cleanup)
                .await
                .unwrap_or_else(|_| {
                    Err(SandboxError::interrupted_cleanup(
                        task.identity.to_string(),
                        "config cleanup exceeded the grace period",
                    ))
                })
        } else {
            cleanup.await
        };
        Self::set_identity_state(&entry, IdentityState::Done);
        result
    }
}

fn new_set_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// What sample logic gets while its set is active.
#[derive(Clone)]
pub(crate) struct SampleContext {
    set: Arc<EnvironmentSet>,
    governor: Governor,
    cancel: CancellationToken,
}

impl SampleContext {
    pub fn set_id(&self) -> &str {
        self.set.set_id()
    }

    /// The named environment, or the default one for `None`.
    pub fn environment(&self, name: Option<&str>) -> SandboxResult<Sandbox> {
        let inner = Arc::clone(self.set.get(name)?);
        Ok(Sandbox {
            name: name.unwrap_or(self.set.default_name()).to_string(),
            inner,
            governor: self.governor.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// The default environment.
    pub fn sandbox(&self) -> SandboxResult<Sandbox> {
        self.environment(None)
    }
}

/// One environment, with exec slots and cancellation applied.
#[derive(Clone)]
pub(crate) struct Sandbox {
    name: String,
    inner: Arc<dyn SandboxEnvironment>,
    governor: Governor,
    cancel: CancellationToken,
}

impl Sandbox {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn cancellable<T>(&self, op: impl Future<Output = SandboxResult<T>>) -> SandboxResult<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SandboxError::Interrupted),
            result = op => result,
        }
    }

    pub async fn exec(&self, request: ExecRequest) -> SandboxResult<ExecResult> {
        let _slot = self.governor.acquire_exec(&self.cancel).await?;
        self.cancellable(self.inner.exec(request)).await
    }

    pub async fn write_file(&self, path: &str, contents: impl AsRef<[u8]>) -> SandboxResult<()> {
        self.cancellable(self.inner.write_file(path, contents.as_ref()))
            .await
    }

    pub async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        self.cancellable(self.inner.read_file(path)).await
    }

    pub async fn read_text(&self, path: &str) -> SandboxResult<String> {
        let bytes = self.read_file(path).await?;
        String::from_utf8(bytes)
            .map_err(|_| SandboxError::execution(format!("unable to decode {path} as UTF-8")))
    }
}
