// dl-test-utils: Shared test utilities for the codec suites.
//
// Provides in-memory byte transports (pipes, re-chunking sources) and
// externally driven deferred nodes for integration testing of the producer
// and consumer halves.

pub mod nodes;
pub mod pipe;

pub use nodes::{controlled_node, deferred_node, failing_stream_node};
pub use pipe::{PipeTx, byte_pipe, chunked, collect_lines, pump_lines};

/// Install a process-wide tracing subscriber honoring `RUST_LOG`.
/// Safe to call from every test; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
