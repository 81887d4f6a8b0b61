mod client;
mod latency;
mod network;

pub use client::{TEST_USER_ID, TestClient, test_object_infos};
pub use latency::LatencyStore;
pub use network::{MockNetwork, record_response};

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
