use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// ServiceEnvironment
// ---------------------------------------------------------------------------

/// Describes backing services an agent can reach from its container.
///
/// The manager folds `env_map` into the container environment at spawn and
/// appends `docs` to the instructions file. Health monitoring itself lives
/// behind this seam; the engine only surfaces warnings.
pub trait ServiceEnvironment: Send + Sync {
    /// Environment variables pointing the agent at its services.
    fn env_map(&self) -> BTreeMap<String, String>;

    /// Warnings about services that are down or degraded.
    fn health_warnings(&self) -> Vec<String>;

    /// Documentation block for the instructions file.
    fn docs(&self) -> Option<String>;
}

/// Environment with no provisioned services.
pub struct NoServices;

impl ServiceEnvironment for NoServices {
    fn env_map(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn health_warnings(&self) -> Vec<String> {
        Vec::new()
    }

    fn docs(&self) -> Option<String> {
        None
    }
}
