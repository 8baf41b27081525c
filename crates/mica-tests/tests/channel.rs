//! Channel establishment, the control barrier, and view bookkeeping.

use mica_proto::{CallError, GpuCaps, GpuInfo};
use mica_tests::Harness;

#[test]
fn establish_flush_scenario() {
    // Renderer 7: channel -> view command buffer -> ring -> flush, end to end.
    let harness = Harness::launch();
    harness.host.new_render_widget_host_view(0x5000, 1).unwrap();
    harness.host.synchronize().unwrap();

    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel.create_view_command_buffer(1).unwrap();
    proxy.initialize(65536).unwrap();

    // Four 252-byte payloads frame to exactly 1024 ring bytes.
    for byte in 0..4u8 {
        proxy.write_command(&[byte; 252]).unwrap();
    }
    assert_eq!(proxy.put_offset(), 1024);

    let state = proxy.flush().unwrap();
    assert_eq!(state.get_offset, 1024);
    assert_eq!(state.error, None);

    harness.shutdown();
}

#[test]
fn establishing_twice_reuses_the_channel() {
    let harness = Harness::launch();

    let first = harness.host.establish_channel_handle(7).unwrap();
    let second = harness.host.establish_channel_handle(7).unwrap();
    assert_eq!(first, second, "same renderer id must share one channel");
    assert_eq!(harness.service.directory().live_channels(), 1);

    let other = harness.host.establish_channel_handle(8).unwrap();
    assert_ne!(first, other);
    assert_eq!(harness.service.directory().live_channels(), 2);

    harness.shutdown();
}

#[test]
fn concurrent_establishes_for_one_renderer_serialize() {
    let harness = Harness::launch();
    let directory = harness.service.directory();

    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| directory.establish(9).unwrap().0))
            .collect();
        let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
    });
    assert_eq!(directory.live_channels(), 1);

    harness.shutdown();
}

#[test]
fn synchronize_is_a_barrier_after_establish() {
    let harness = Harness::launch();

    // The establish itself is sync here, but the barrier must still complete
    // and order behind any number of queued control messages.
    for view_id in 0..16 {
        harness
            .host
            .new_render_widget_host_view(0x1000 + view_id as u64, view_id)
            .unwrap();
    }
    harness.host.synchronize().unwrap();

    // Every view registration queued before the barrier is now visible.
    let channel = harness.host.establish_channel(1).unwrap();
    for view_id in 0..16 {
        channel.create_view_command_buffer(view_id).unwrap();
    }

    harness.shutdown();
}

#[test]
fn view_xid_lookup() {
    let harness = Harness::launch();
    harness.host.new_render_widget_host_view(0xAB, 3).unwrap();
    harness.host.synchronize().unwrap();

    let xid = harness.host.get_view_xid(3).unwrap();
    assert_eq!(xid, (0xAB_u64 << 32) | 3);

    assert_eq!(
        harness.host.get_view_xid(99).unwrap_err(),
        CallError::InvalidHandle
    );

    harness.shutdown();
}

#[test]
fn view_xid_requires_the_capability() {
    let config = mica_gpu::ServiceConfig {
        info: GpuInfo {
            caps: GpuCaps::all() - GpuCaps::VIEW_XID,
            ..GpuInfo::default()
        },
        ..mica_gpu::ServiceConfig::default()
    };
    let harness = Harness::launch_with(config);
    harness.host.new_render_widget_host_view(0xAB, 3).unwrap();
    harness.host.synchronize().unwrap();

    assert_eq!(
        harness.host.get_view_xid(3).unwrap_err(),
        CallError::Unsupported
    );

    harness.shutdown();
}

#[test]
fn channel_reports_gpu_info() {
    let config = mica_gpu::ServiceConfig {
        info: GpuInfo {
            vendor_id: 0x10DE,
            device_id: 0x2204,
            driver_version: String::from("535.154.05"),
            caps: GpuCaps::all(),
        },
        ..mica_gpu::ServiceConfig::default()
    };
    let harness = Harness::launch_with(config);

    let channel = harness.host.establish_channel(7).unwrap();
    assert_eq!(channel.info().vendor_id, 0x10DE);
    assert_eq!(channel.info().driver_version, "535.154.05");

    harness.shutdown();
}

#[test]
fn creating_a_command_buffer_for_an_unknown_view_fails() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();
    assert_eq!(
        channel.create_view_command_buffer(12345).unwrap_err(),
        CallError::InvalidHandle
    );
    harness.shutdown();
}
