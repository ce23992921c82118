//! Common test utilities.

use std::path::PathBuf;
use std::sync::Once;

use tempfile::TempDir;
use toolgate::{Gateway, GatewayConfig};

static TRACING: Once = Once::new();

/// Initialize tracing once per test binary; honors RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config with a short execution budget, rooted under a temp directory.
pub fn test_config(root: PathBuf) -> GatewayConfig {
    GatewayConfig {
        workspace_root: Some(root),
        timeout_secs: 10,
        ..Default::default()
    }
}

/// Create a gateway over a fresh workspace root, with config tweaks applied.
pub fn gateway_with(tweak: impl FnOnce(&mut GatewayConfig)) -> Gateway {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    // Leak the TempDir so it doesn't get cleaned up during the test.
    let tmp = Box::leak(Box::new(tmp));
    let mut config = test_config(tmp.path().join("workspaces"));
    tweak(&mut config);
    Gateway::new(config)
}

/// Create a gateway with default test config.
#[allow(dead_code)]
pub fn gateway() -> Gateway {
    gateway_with(|_| {})
}
