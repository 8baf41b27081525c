//! Process-wide registry of live channels, keyed by renderer id.
//!
//! Guarantees at most one live channel per renderer: concurrent establishes
//! for the same id serialize on the registry lock, the second caller
//! observing the first one's channel instead of a duplicate. A channel whose
//! renderer disconnected is reaped on the next establish for that id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use mica_ipc::shmem::{HandleBroker, ShmemHandle};
use mica_ipc::transport::Transport;
use mica_proto::{CallFault, GpuInfo};

use crate::channel::GpuChannel;
use crate::service::{ServiceConfig, ViewRegistry};

struct ChannelRecord {
    handle: ShmemHandle,
    alive: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

pub struct ChannelDirectory {
    broker: HandleBroker,
    views: ViewRegistry,
    config: ServiceConfig,
    channels: Mutex<HashMap<u32, ChannelRecord>>,
}

impl ChannelDirectory {
    pub(crate) fn new(broker: HandleBroker, views: ViewRegistry, config: ServiceConfig) -> Self {
        Self {
            broker,
            views,
            config,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live channel for `renderer_id`, creating one if needed.
    ///
    /// The returned handle resolves to the channel's transport region; the
    /// caller attaches the client end.
    pub fn establish(&self, renderer_id: u32) -> Result<(ShmemHandle, GpuInfo), CallFault> {
        let mut channels = self.channels.lock().unwrap();

        if let Some(record) = channels.get_mut(&renderer_id) {
            if record.alive.load(Ordering::Acquire) {
                tracing::debug!(renderer_id, "reusing existing gpu channel");
                return Ok((record.handle, self.config.info.clone()));
            }
            // The renderer went away; reap the dead channel before replacing.
            if let Some(join) = record.join.take() {
                let _ = join.join();
            }
            self.broker.revoke(record.handle);
            channels.remove(&renderer_id);
            tracing::debug!(renderer_id, "reaped dead gpu channel");
        }

        let region = Transport::allocate(&self.config.transport)
            .map_err(|_| CallFault::ResourceExhausted)?;
        let server =
            Transport::server(region.clone()).map_err(|_| CallFault::ResourceExhausted)?;
        let handle = self.broker.transmit(region);

        let alive = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));
        let channel = GpuChannel::new(
            renderer_id,
            server,
            self.broker.clone(),
            self.views.clone(),
            self.config.clone(),
            shutdown.clone(),
            alive.clone(),
        );
        let join = std::thread::spawn(move || channel.run());

        channels.insert(
            renderer_id,
            ChannelRecord {
                handle,
                alive,
                shutdown,
                join: Some(join),
            },
        );
        tracing::info!(renderer_id, "gpu channel established");
        Ok((handle, self.config.info.clone()))
    }

    /// Number of channels whose renderer is still attached.
    pub fn live_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .values()
            .filter(|record| record.alive.load(Ordering::Acquire))
            .count()
    }

    /// Stop every channel thread and release their transports.
    pub(crate) fn shutdown(&self) {
        let mut channels = self.channels.lock().unwrap();
        for (renderer_id, mut record) in channels.drain() {
            record.shutdown.store(true, Ordering::Release);
            if let Some(join) = record.join.take() {
                let _ = join.join();
            }
            self.broker.revoke(record.handle);
            tracing::debug!(renderer_id, "channel shut down");
        }
    }
}
