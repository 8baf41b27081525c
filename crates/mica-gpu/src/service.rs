//! GPU process entry point: the control-path dispatch loop.
//!
//! Control messages (channel establishment, synchronization, native view
//! registration) travel on their own transport, separate from per-channel
//! traffic. Because this loop processes them strictly in order, replying to
//! `Synchronize` only after the messages queued before it is exactly the
//! barrier the protocol promises.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use mica_ipc::poll::Backoff;
use mica_ipc::shmem::{HandleBroker, SharedMemory};
use mica_ipc::transport::{Transport, TransportConfig, TransportError, TransportServer};
use mica_proto::{
    decode_request, encode_event, CallFault, Event, GpuCaps, GpuInfo, Request, ROUTE_CONTROL,
};

use crate::directory::ChannelDirectory;
use crate::sink::CommandSink;

/// Builds the command sink for a newly created endpoint, from
/// `(renderer_id, route)`.
pub type SinkFactory = Arc<dyn Fn(u32, u32) -> Box<dyn CommandSink> + Send + Sync>;

/// Tunables for a GPU service instance.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Identification/caps advertised in `ChannelEstablished` replies.
    pub info: GpuInfo,
    /// Ring capacities for per-renderer channel transports.
    pub transport: TransportConfig,
    /// Command ring size used when `Initialize` passes no hint.
    pub default_cmd_ring_bytes: u32,
    /// Per-buffer ceiling for `CreateTransferBuffer`.
    pub max_transfer_buffer_bytes: u32,
    /// Sink for consumed commands; `None` discards them.
    pub sink_factory: Option<SinkFactory>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            info: GpuInfo::default(),
            transport: TransportConfig::default(),
            default_cmd_ring_bytes: 64 * 1024,
            max_transfer_buffer_bytes: 16 << 20,
            sink_factory: None,
        }
    }
}

/// Native views registered by the host, shared across every channel.
/// Maps view id to the native window id exposed through `GetViewXid`.
#[derive(Clone, Default)]
pub(crate) struct ViewRegistry {
    inner: Arc<Mutex<HashMap<u32, u64>>>,
}

impl ViewRegistry {
    pub(crate) fn insert(&self, view_id: u32, parent_window: u64) {
        // The simulated window system derives a stable native id instead of
        // asking a display server for one.
        let xid = (parent_window << 32) | view_id as u64;
        self.inner.lock().unwrap().insert(view_id, xid);
    }

    pub(crate) fn contains(&self, view_id: u32) -> bool {
        self.inner.lock().unwrap().contains_key(&view_id)
    }

    pub(crate) fn xid_of(&self, view_id: u32) -> Option<u64> {
        self.inner.lock().unwrap().get(&view_id).copied()
    }
}

/// A running GPU process (control thread plus one thread per channel).
pub struct GpuService {
    directory: Arc<ChannelDirectory>,
    shutdown: Arc<AtomicBool>,
    control_join: Option<JoinHandle<()>>,
}

impl GpuService {
    /// Run a service over an already-attached control transport end.
    pub fn start(control: TransportServer, broker: HandleBroker, config: ServiceConfig) -> Self {
        let views = ViewRegistry::default();
        let directory = Arc::new(ChannelDirectory::new(
            broker,
            views.clone(),
            config.clone(),
        ));
        let shutdown = Arc::new(AtomicBool::new(false));

        let loop_directory = directory.clone();
        let loop_shutdown = shutdown.clone();
        let caps = config.info.caps;
        let control_join = std::thread::spawn(move || {
            control_loop(control, loop_directory, views, caps, loop_shutdown)
        });

        Self {
            directory,
            shutdown,
            control_join: Some(control_join),
        }
    }

    /// Allocate the control transport and start the service on it.
    ///
    /// Returns the service, the control region for the host to attach, and
    /// the broker both sides resolve handles through.
    pub fn launch(
        config: ServiceConfig,
    ) -> Result<(Self, Arc<SharedMemory>, HandleBroker), TransportError> {
        let broker = HandleBroker::new();
        let region = Transport::allocate(&config.transport)?;
        let server = Transport::server(region.clone())?;
        let service = Self::start(server, broker.clone(), config);
        Ok((service, region, broker))
    }

    pub fn directory(&self) -> &ChannelDirectory {
        &self.directory
    }

    /// Stop the control loop and every channel, joining their threads.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.control_join.take() {
            let _ = join.join();
        }
        self.directory.shutdown();
        tracing::info!("gpu service stopped");
    }
}

impl Drop for GpuService {
    fn drop(&mut self) {
        if self.control_join.is_some() {
            self.shutdown_inner();
        }
    }
}

fn control_loop(
    control: TransportServer,
    directory: Arc<ChannelDirectory>,
    views: ViewRegistry,
    caps: GpuCaps,
    shutdown: Arc<AtomicBool>,
) {
    tracing::info!("gpu control loop up");
    let mut backoff = Backoff::new();
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let bytes = match control.recv() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                backoff.wait();
                continue;
            }
            Err(_) => {
                tracing::info!("host disconnected from control transport");
                break;
            }
        };
        backoff.reset();

        let (seq, _route, request) = match decode_request(&bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::error!(error = %err, "undecodable control message, stopping");
                break;
            }
        };

        let reply = match request {
            Request::EstablishChannel { renderer_id } => {
                Some(match directory.establish(renderer_id) {
                    Ok((handle, info)) => Event::ChannelEstablished {
                        channel: handle.raw(),
                        info,
                    },
                    Err(fault) => Event::CallFailed { fault },
                })
            }
            // In-order processing makes this a barrier over everything the
            // host queued before it.
            Request::Synchronize => Some(Event::SynchronizeDone),
            Request::NewRenderWidgetHostView {
                parent_window,
                view_id,
            } => {
                views.insert(view_id, parent_window);
                tracing::debug!(view_id, "native view registered");
                if seq != 0 {
                    Some(Event::Done)
                } else {
                    None
                }
            }
            Request::GetViewXid { view_id } => Some(if !caps.contains(GpuCaps::VIEW_XID) {
                Event::CallFailed {
                    fault: CallFault::Unsupported,
                }
            } else {
                match views.xid_of(view_id) {
                    Some(xid) => Event::ViewXid { xid },
                    None => Event::CallFailed {
                        fault: CallFault::InvalidHandle,
                    },
                }
            }),
            other => {
                tracing::warn!(?other, "non-control request on the control transport");
                if seq != 0 {
                    Some(Event::CallFailed {
                        fault: CallFault::Unsupported,
                    })
                } else {
                    None
                }
            }
        };

        if let Some(event) = reply {
            if control
                .send(&encode_event(seq, ROUTE_CONTROL, &event))
                .is_err()
            {
                tracing::info!("host went away mid-reply");
                break;
            }
        }
    }
    control.close();
    tracing::info!("gpu control loop down");
}
