//! Named collection of environments provisioned for one sample.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{HandleDescriptor, SandboxEnvironment, SandboxError, SandboxResult, DEFAULT_ENVIRONMENT};

/// Environments for one sample, keyed by logical name.
///
/// With a single environment that environment is the default whatever its
/// name. With several, exactly one must be named `default`.
#[derive(Clone)]
pub(crate) struct EnvironmentSet {
    set_id: String,
    default_name: String,
    environments: BTreeMap<String, Arc<dyn SandboxEnvironment>>,
}

impl EnvironmentSet {
    /// Builds a set, enforcing the default-entry rule.
    pub fn new(
        set_id: impl Into<String>,
        environments: Vec<(String, Arc<dyn SandboxEnvironment>)>,
    ) -> SandboxResult<Self> {
        let set_id = set_id.into();
        let names: Vec<String> = environments.iter().map(|(name, _)| name.clone()).collect();
        let default_name = default_environment_name(&names)?;

        let mut map = BTreeMap::new();
        for (name, env) in environments {
            if map.insert(name.clone(), env).is_some() {
                return Err(SandboxError::configuration(format!(
                    "duplicate environment name '{name}'"
                )));
            }
        }

        Ok(Self {
            set_id,
            default_name,
            environments: map,
        })
    }

    /// Looks up an environment. `None` resolves to the default entry.
    pub fn get(&self, name: Option<&str>) -> SandboxResult<&Arc<dyn SandboxEnvironment>> {
        let name = name.unwrap_or(&self.default_name);
        self.environments.get(name).ok_or_else(|| {
            SandboxError::configuration(format!(
                "no environment named '{name}' (available: {})",
                self.names().join(", ")
            ))
        })
    }

    pub fn set_id(&self) -> &str {
        &self.set_id
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    pub fn names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    /// Descriptors of every environment, for the cleanup ledger.
    pub fn descriptors(&self) -> Vec<HandleDescriptor> {
        self.environments.values().map(|env| env.descriptor()).collect()
    }
}

impl fmt::Debug for EnvironmentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentSet")
            .field("set_id", &self.set_id)
            .field("default_name", &self.default_name)
            .field("environments", &self.names())
            .finish()
    }
}

/// Picks the default entry among `names`.
///
/// Shared with config validation so multi-environment configs without a
/// `default` entry are rejected before anything is provisioned.
pub(crate) fn default_environment_name(names: &[String]) -> SandboxResult<String> {
    match names {
        [] => Err(SandboxError::configuration(
            "an environment set needs at least one environment",
        )),
        [only] => Ok(only.clone()),
        _ => {
            let defaults = names.iter().filter(|n| *n == DEFAULT_ENVIRONMENT).count();
            if defaults == 1 {
                Ok(DEFAULT_ENVIRONMENT.to_string())
            } else {
                Err(SandboxError::configuration(format!(
                    "multiple environments ({}) require exactly one named '{DEFAULT_ENVIRONMENT}'",
                    names.join(", ")
                )))
            }
        }
    }
}
