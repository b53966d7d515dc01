//! Environment propagation into worker processes.

use std::collections::BTreeMap;

use crate::Result;

/// Variable set in every worker so its runtime knows it serves gRPC
/// through the bridge.
pub const BRIDGE_MARKER_VAR: &str = "BIFROST_GRPC";

/// Value of [`BRIDGE_MARKER_VAR`].
pub const BRIDGE_MARKER_VALUE: &str = "true";

/// Supplies `name -> value` pairs merged into the worker environment.
pub trait EnvironmentProvider: Send + Sync {
    fn environment(&self) -> Result<BTreeMap<String, String>>;
}

/// A fixed set of variables, usually the `[env]` table of the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    values: BTreeMap<String, String>,
}

impl StaticEnvironment {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }
}

impl EnvironmentProvider for StaticEnvironment {
    fn environment(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.values.clone())
    }
}

/// Build the final worker environment.
///
/// Later sources win: the worker's own variables, then the provider's,
/// then the bridge marker.
pub fn merge_worker_env(
    worker_env: &BTreeMap<String, String>,
    provider: Option<&dyn EnvironmentProvider>,
) -> Result<BTreeMap<String, String>> {
    let mut env = worker_env.clone();
    if let Some(provider) = provider {
        env.extend(provider.environment()?);
    }
    env.insert(BRIDGE_MARKER_VAR.to_string(), BRIDGE_MARKER_VALUE.to_string());
    Ok(env)
}
