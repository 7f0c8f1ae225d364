use std::collections::HashMap;

use normgrad::{
    reference::{BridgeConfig, TorchBridge},
    tensor::Tensor,
    util,
};

// Transport is exact; what remains is torch summing in a different order.
pub const TOLERANCE: f64 = 1e-10;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Bridge from the environment, or `None` (and a note on stderr) when no
/// interpreter with torch is around and the test should be skipped.
pub fn bridge() -> Option<TorchBridge> {
    init_tracing();
    let bridge = TorchBridge::locate();
    if bridge.is_none() {
        eprintln!("skipping: no python interpreter with torch found");
    }
    bridge
}

pub fn uncached_bridge() -> Option<TorchBridge> {
    init_tracing();
    let config = BridgeConfig {
        use_cache: false,
        ..BridgeConfig::from_env()
    };
    let bridge = TorchBridge::with_config(config);
    if bridge.is_none() {
        eprintln!("skipping: no python interpreter with torch found");
    }
    bridge
}

pub fn inputs(named: &[(&str, &Tensor)]) -> HashMap<String, Tensor> {
    named
        .iter()
        .map(|(name, t)| (name.to_string(), (*t).clone()))
        .collect()
}

pub fn assert_matches(what: &str, ours: &Tensor, reference: &Tensor) {
    assert_eq!(ours.shape, reference.shape, "{what}: shape mismatch");
    let diff = util::max_abs_diff(&ours.data, &reference.data);
    assert!(diff < TOLERANCE, "{what}: max abs diff {diff}");
}
