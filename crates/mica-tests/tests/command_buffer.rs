//! Endpoint flow control: flush pairs, transfer buffers, parent borrows.

use std::sync::{Arc, Mutex};

use mica_gpu::{CommandSink, ServiceConfig, SinkError};
use mica_proto::{CallError, EndpointError, Size};
use mica_tests::{wait_until, Harness};

struct MirrorSink(Arc<Mutex<Vec<Vec<u8>>>>);

impl CommandSink for MirrorSink {
    fn consume(&mut self, command: &[u8]) -> Result<(), SinkError> {
        self.0.lock().unwrap().push(command.to_vec());
        Ok(())
    }
}

fn mirroring_config() -> (ServiceConfig, Arc<Mutex<Vec<Vec<u8>>>>) {
    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    let config = ServiceConfig {
        sink_factory: Some(Arc::new(move |_renderer, _route| {
            Box::new(MirrorSink(sink_seen.clone()))
        })),
        ..ServiceConfig::default()
    };
    (config, seen)
}

struct Rng(u64);

impl Rng {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        ((x.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }
}

#[test]
fn get_offset_tracks_flushes_and_never_decreases() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel
        .create_offscreen_command_buffer(None, Size::new(256, 256), 0)
        .unwrap();
    proxy.initialize(4096).unwrap();

    let mut rng = Rng(0x5EED_0BAD_F00D_0001);
    let mut last_get = 0u32;
    for _ in 0..500 {
        let burst = rng.next_u32() % 4;
        for _ in 0..burst {
            let len = (rng.next_u32() % 96) as usize;
            proxy.write_command(&vec![0xC5; len]).unwrap();
        }
        let put = proxy.put_offset();
        let state = proxy.flush().unwrap();
        assert_eq!(state.error, None);
        assert_eq!(state.get_offset, put, "sync flush consumes to put");
        assert!(state.get_offset.wrapping_sub(last_get) < u32::MAX / 2);
        last_get = state.get_offset;
    }

    harness.shutdown();
}

#[test]
fn commands_arrive_at_the_sink_in_order() {
    let (config, seen) = mirroring_config();
    let harness = Harness::launch_with(config);
    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    proxy.initialize(1024).unwrap();

    for i in 0..20u8 {
        proxy.write_command(&[i; 40]).unwrap();
    }
    proxy.flush().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    for (i, command) in seen.iter().enumerate() {
        assert_eq!(command, &vec![i as u8; 40]);
    }

    harness.shutdown();
}

#[test]
fn full_ring_write_blocks_until_flush_frees_space() {
    // Ring much smaller than the traffic; write_command must interleave
    // flushes to make room and never lose a record.
    let (config, seen) = mirroring_config();
    let harness = Harness::launch_with(config);
    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    proxy.initialize(256).unwrap();

    for i in 0..64u8 {
        proxy.write_command(&[i; 60]).unwrap();
    }
    let state = proxy.flush().unwrap();
    assert_eq!(state.error, None);
    assert_eq!(seen.lock().unwrap().len(), 64);

    harness.shutdown();
}

#[test]
fn async_flush_state_arrives_via_update() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    proxy.initialize(4096).unwrap();

    proxy.write_command(&[1; 100]).unwrap();
    let put = proxy.put_offset();
    proxy.async_flush().unwrap();

    let mut last = proxy.state();
    wait_until(std::time::Duration::from_secs(5), || {
        let state = proxy.poll_state().unwrap();
        assert!(!state.supersedes(&last) || state.token >= last.token);
        last = state;
        state.get_offset == put
    });
    assert_eq!(proxy.state().error, None);

    harness.shutdown();
}

#[test]
fn async_get_state_reports_without_publishing() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    proxy.initialize(4096).unwrap();

    // Written but unpublished commands must not move get.
    proxy.write_command(&[9; 64]).unwrap();
    proxy.async_get_state().unwrap();

    // The sync query is ordered behind the async one; by the time it returns
    // the unsolicited update has been pumped too.
    let state = proxy.get_state().unwrap();
    assert_eq!(state.get_offset, 0);
    assert_eq!(proxy.state().get_offset, 0);

    harness.shutdown();
}

#[test]
fn transfer_buffer_lifecycle() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    proxy.initialize(4096).unwrap();

    let id = proxy.create_transfer_buffer(4096).unwrap();
    assert!(id > 0);

    let (region_a, size) = proxy.get_transfer_buffer(id).unwrap();
    assert_eq!(size, 4096);
    let (region_b, _) = proxy.get_transfer_buffer(id).unwrap();
    assert!(
        Arc::ptr_eq(&region_a, &region_b),
        "get is idempotent and maps the same region"
    );
    region_a.write_bytes(0, b"bulk payload");

    proxy.destroy_transfer_buffer(id).unwrap();
    assert_eq!(
        proxy.get_transfer_buffer(id).unwrap_err(),
        CallError::InvalidHandle
    );
    assert_eq!(
        proxy.destroy_transfer_buffer(id).unwrap_err(),
        CallError::InvalidHandle
    );

    // A fresh buffer never reuses the stale id.
    let next = proxy.create_transfer_buffer(64).unwrap();
    assert!(next > id);

    harness.shutdown();
}

#[test]
fn transfer_buffer_allocation_failure_keeps_endpoint_usable() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    proxy.initialize(4096).unwrap();

    // Larger than the service's per-buffer ceiling.
    assert_eq!(
        proxy.create_transfer_buffer(u32::MAX).unwrap_err(),
        CallError::ResourceExhausted
    );

    // The failure is reported to the call only; the endpoint still works.
    let id = proxy.create_transfer_buffer(1024).unwrap();
    proxy.write_command(&[3; 16]).unwrap();
    assert_eq!(proxy.flush().unwrap().error, None);
    proxy.destroy_transfer_buffer(id).unwrap();

    harness.shutdown();
}

#[test]
fn destroying_a_parent_errors_the_child_on_next_use() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();

    let mut parent = channel
        .create_offscreen_command_buffer(None, Size::new(128, 128), 0)
        .unwrap();
    parent.initialize(4096).unwrap();

    let mut child = channel
        .create_offscreen_command_buffer(Some(parent.route()), Size::new(64, 64), 5)
        .unwrap();
    child.initialize(4096).unwrap();
    assert_eq!(child.flush().unwrap().error, None);

    parent.destroy().unwrap();

    let state = child.flush().unwrap();
    assert_eq!(state.error, Some(EndpointError::ParentLost));

    // Terminal: the endpoint stays errored.
    let state = child.get_state().unwrap();
    assert_eq!(state.error, Some(EndpointError::ParentLost));

    harness.shutdown();
}

#[test]
fn creating_a_child_under_a_destroyed_parent_fails() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();

    let parent = channel
        .create_offscreen_command_buffer(None, Size::new(128, 128), 0)
        .unwrap();
    let parent_route = parent.route();
    parent.destroy().unwrap();

    assert_eq!(
        channel
            .create_offscreen_command_buffer(Some(parent_route), Size::new(64, 64), 1)
            .unwrap_err(),
        CallError::InvalidHandle
    );

    harness.shutdown();
}

#[test]
fn resize_offscreen_rejected_on_view_endpoints() {
    let harness = Harness::launch();
    harness.host.new_render_widget_host_view(0x10, 4).unwrap();
    harness.host.synchronize().unwrap();
    let channel = harness.host.establish_channel(7).unwrap();

    let mut view = channel.create_view_command_buffer(4).unwrap();
    view.initialize(4096).unwrap();
    assert_eq!(
        view.resize_offscreen_frame_buffer(Size::new(32, 32))
            .unwrap_err(),
        CallError::Unsupported
    );

    let offscreen = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    offscreen
        .resize_offscreen_frame_buffer(Size::new(32, 32))
        .unwrap();

    harness.shutdown();
}

#[test]
fn view_initialize_requests_the_first_paint() {
    let harness = Harness::launch();
    harness.host.new_render_widget_host_view(0x10, 4).unwrap();
    harness.host.synchronize().unwrap();
    let channel = harness.host.establish_channel(7).unwrap();

    let mut view = channel.create_view_command_buffer(4).unwrap();
    assert!(!view.take_repaint_pending());
    view.initialize(4096).unwrap();

    wait_until(std::time::Duration::from_secs(5), || {
        channel.pump().unwrap();
        view.take_repaint_pending()
    });

    harness.shutdown();
}
