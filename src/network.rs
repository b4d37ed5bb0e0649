//! Network backend selection.

use log::{info, warn};

use crate::runtime::ContainerRuntime;
use crate::types::{Capabilities, NetworkBackend};

/// Most preferred backend the runtime reports; the runtime default otherwise.
///
/// `NetworkBackend`'s ordering is the preference order, so this is the
/// minimum of the set. Never fails.
pub fn select(capabilities: &Capabilities) -> NetworkBackend {
    capabilities
        .iter()
        .next()
        .copied()
        .unwrap_or(NetworkBackend::Default)
}

/// Uses `forced` when configured, otherwise asks the runtime.
/// A failed capability query falls back to the default backend.
pub async fn resolve(
    runtime: &dyn ContainerRuntime,
    forced: Option<NetworkBackend>,
) -> NetworkBackend {
    if let Some(backend) = forced {
        info!("Using configured network backend: {}", backend);
        return backend;
    }
    let backend = match runtime.network_backends().await {
        Ok(capabilities) => select(&capabilities),
        Err(e) => {
            warn!("Could not detect network backends ({}); using runtime default", e);
            NetworkBackend::Default
        }
    };
    info!("Selected network backend: {}", backend);
    backend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{Call, FakeRuntime};
    use NetworkBackend::*;

    fn caps(backends: &[NetworkBackend]) -> Capabilities {
        backends.iter().copied().collect()
    }

    #[test]
    fn test_select_prefers_pasta() {
        assert_eq!(select(&caps(&[Pasta, Slirp4netns, Default])), Pasta);
        assert_eq!(select(&caps(&[Default, Slirp4netns, Pasta])), Pasta);
    }

    #[test]
    fn test_select_falls_back_to_slirp() {
        assert_eq!(select(&caps(&[Slirp4netns, Default])), Slirp4netns);
    }

    #[test]
    fn test_select_empty_is_default() {
        assert_eq!(select(&caps(&[])), Default);
        assert_eq!(select(&caps(&[Default])), Default);
    }

    #[tokio::test]
    async fn test_resolve_override_skips_detection() {
        let runtime = FakeRuntime::new().with_capabilities(&[Pasta]);
        assert_eq!(resolve(&runtime, Some(Slirp4netns)).await, Slirp4netns);
        assert_eq!(runtime.count(&Call::NetworkBackends), 0);
    }

    #[tokio::test]
    async fn test_resolve_detects() {
        let runtime = FakeRuntime::new().with_capabilities(&[Slirp4netns, Default]);
        assert_eq!(resolve(&runtime, None).await, Slirp4netns);
    }
}
