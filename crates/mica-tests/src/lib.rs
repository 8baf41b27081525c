//! Two-process harness for the integration tests.
//!
//! The GPU service runs with its real threads; the "content process" is the
//! test thread talking through a real control transport. Nothing is mocked:
//! every byte crosses the same rings production traffic would.

use std::time::{Duration, Instant};

use mica_gpu::{GpuService, ServiceConfig};
use mica_ipc::shmem::HandleBroker;
use mica_renderer::GpuProcessHost;

pub struct Harness {
    pub service: GpuService,
    pub host: GpuProcessHost,
    pub broker: HandleBroker,
}

impl Harness {
    pub fn launch() -> Self {
        Self::launch_with(ServiceConfig::default())
    }

    pub fn launch_with(config: ServiceConfig) -> Self {
        let (service, control_region, broker) =
            GpuService::launch(config).expect("control transport allocation");
        let host =
            GpuProcessHost::connect(control_region, broker.clone()).expect("host attach");
        Self {
            service,
            host,
            broker,
        }
    }

    /// Join all GPU-side threads.
    pub fn shutdown(self) {
        self.service.shutdown();
    }
}

/// Spin until `predicate` holds, panicking after `timeout`.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::yield_now();
    }
}
