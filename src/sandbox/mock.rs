//! Mock backend for testing.
//!
//! Counts lifecycle calls and keeps files in memory so orchestration logic
//! can be exercised without Docker or the host filesystem.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    EnvironmentSet, ExecRequest, ExecResult, HandleDescriptor, SampleMetadata, SandboxBackend,
    SandboxEnvironment, SandboxError, SandboxResult,
};
use crate::identity::EnvironmentConfigIdentity;

/// Call counts observed by a [`MockBackend`].
#[derive(Debug, Default)]
pub(crate) struct MockCounters {
    pub config_init: AtomicUsize,
    pub sample_setup: AtomicUsize,
    pub sample_teardown: AtomicUsize,
    pub interrupted_teardown: AtomicUsize,
    pub config_cleanup: AtomicUsize,
    pub cleanup_skipped: AtomicUsize,
}

impl MockCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// A configurable in-memory backend.
pub(crate) struct MockBackend {
    name: String,
    counters: Arc<MockCounters>,
    environments: Vec<String>,
    init_delay: Duration,
    teardown_delay: Duration,
    fail_init: bool,
    fail_setup_for: Option<String>,
    exec_delay: Duration,
    live: Arc<Mutex<BTreeSet<String>>>,
}

impl MockBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            counters: Arc::new(MockCounters::default()),
            environments: vec!["default".to_string()],
            init_delay: Duration::ZERO,
            teardown_delay: Duration::ZERO,
            fail_init: false,
            fail_setup_for: None,
            exec_delay: Duration::ZERO,
            live: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    #[must_use]
    pub fn with_environments(mut self, names: &[&str]) -> Self {
        self.environments = names.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    #[must_use]
    pub fn with_teardown_delay(mut self, delay: Duration) -> Self {
        self.teardown_delay = delay;
        self
    }

    #[must_use]
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    #[must_use]
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Fails `sample_setup` when the sample metadata has `fail = <value>`.
    #[must_use]
    pub fn failing_setup_for(mut self, value: &str) -> Self {
        self.fail_setup_for = Some(value.to_string());
        self
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    /// Set ids provisioned and not yet torn down.
    pub fn live_sets(&self) -> Arc<Mutex<BTreeSet<String>>> {
        Arc::clone(&self.live)
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn config_init(&self, _identity: &EnvironmentConfigIdentity) -> SandboxResult<()> {
        self.counters.config_init.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.init_delay).await;
        if self.fail_init {
            return Err(SandboxError::provisioning("mock init failure"));
        }
        Ok(())
    }

    async fn sample_setup(
        &self,
        _identity: &EnvironmentConfigIdentity,
        set_id: &str,
        metadata: &SampleMetadata,
    ) -> SandboxResult<EnvironmentSet> {
        self.counters.sample_setup.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup_for.is_some() && metadata.get("fail") == self.fail_setup_for.as_ref() {
            return Err(SandboxError::provisioning("mock setup failure"));
        }
        self.live
            .lock()
            .expect("mock lock poisoned")
            .insert(set_id.to_string());
        let environments = self
            .environments
            .iter()
            .map(|name| {
                let env = MockEnvironment::new(name).with_exec_delay(self.exec_delay);
                (name.clone(), Arc::new(env) as Arc<dyn SandboxEnvironment>)
            })
            .collect();
        EnvironmentSet::new(set_id, environments)
    }

    async fn sample_teardown(
        &self,
        _identity: &EnvironmentConfigIdentity,
        set_id: &str,
        _set: Option<&EnvironmentSet>,
        interrupted: bool,
    ) -> SandboxResult<()> {
        self.counters.sample_teardown.fetch_add(1, Ordering::SeqCst);
        if interrupted {
            self.counters
                .interrupted_teardown
                .fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(self.teardown_delay).await;
        self.live.lock().expect("mock lock poisoned").remove(set_id);
        Ok(())
    }

    async fn config_cleanup(
        &self,
        _identity: &EnvironmentConfigIdentity,
        perform_cleanup: bool,
    ) -> SandboxResult<Vec<String>> {
        self.counters.config_cleanup.fetch_add(1, Ordering::SeqCst);
        if perform_cleanup {
            return Ok(Vec::new());
        }
        self.counters.cleanup_skipped.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .live
            .lock()
            .expect("mock lock poisoned")
            .iter()
            .cloned()
            .collect())
    }

    async fn cli_cleanup(&self, target: Option<&str>) -> SandboxResult<usize> {
        let mut live = self.live.lock().expect("mock lock poisoned");
        Ok(match target {
            Some(id) => usize::from(live.remove(id)),
            None => {
                let count = live.len();
                live.clear();
                count
            }
        })
    }
}

/// In-memory environment. `exec` echoes its arguments.
pub(crate) struct MockEnvironment {
    name: String,
    files: Mutex<HashMap<String, Vec<u8>>>,
    exec_delay: Duration,
    execs: AtomicUsize,
}

impl MockEnvironment {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            files: Mutex::new(HashMap::new()),
            exec_delay: Duration::ZERO,
            execs: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }
}

#[async_trait]
impl SandboxEnvironment for MockEnvironment {
    async fn exec(&self, request: ExecRequest) -> SandboxResult<ExecResult> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.exec_delay).await;
        match request.cmd.first().map(String::as_str) {
            Some("false") => Ok(ExecResult {
                success: false,
                exit_code: 1,
                stdout: String::new(),
                stderr: String::new(),
            }),
            Some(_) => Ok(ExecResult {
                success: true,
                exit_code: 0,
                stdout: format!("{}\n", request.cmd[1..].join(" ")),
                stderr: String::new(),
            }),
            None => Err(SandboxError::execution("empty command")),
        }
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()> {
        self.files
            .lock()
            .expect("mock lock poisoned")
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        self.files
            .lock()
            .expect("mock lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::not_found(path))
    }

    fn descriptor(&self) -> HandleDescriptor {
        HandleDescriptor {
            name: self.name.clone(),
            resource: format!("mock-{}", self.name),
        }
    }
}
