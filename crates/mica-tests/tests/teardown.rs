//! Channel loss: renderer disconnects, service shutdown, resource release.

use std::time::Duration;

use mica_proto::{CallError, Size};
use mica_tests::{wait_until, Harness};

#[test]
fn renderer_disconnect_tears_the_channel_down() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    proxy.initialize(4096).unwrap();
    assert_eq!(harness.service.directory().live_channels(), 1);

    channel.close();
    let directory = harness.service.directory();
    wait_until(Duration::from_secs(5), || directory.live_channels() == 0);

    // Everything on the dead channel reports the loss.
    assert_eq!(proxy.flush().unwrap_err(), CallError::ChannelLost);
    assert_eq!(proxy.get_state().unwrap_err(), CallError::ChannelLost);

    harness.shutdown();
}

#[test]
fn reestablish_after_disconnect_creates_a_fresh_channel() {
    let harness = Harness::launch();

    let first_handle = harness.host.establish_channel_handle(7).unwrap();
    let channel = harness.host.establish_channel(7).unwrap();
    assert_eq!(harness.service.directory().live_channels(), 1);

    channel.close();
    let directory = harness.service.directory();
    wait_until(Duration::from_secs(5), || directory.live_channels() == 0);

    let second_handle = harness.host.establish_channel_handle(7).unwrap();
    assert_ne!(
        first_handle, second_handle,
        "a dead channel is reaped, not resurrected"
    );
    assert_eq!(harness.service.directory().live_channels(), 1);

    harness.shutdown();
}

#[test]
fn dropping_a_proxy_destroys_its_endpoint() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();

    let parent = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    let parent_route = parent.route();
    drop(parent);

    // The drop-sent destroy is ordered ahead of this create on the same
    // ring, so the parent is guaranteed gone by the time it is checked.
    assert_eq!(
        channel
            .create_offscreen_command_buffer(Some(parent_route), Size::new(16, 16), 1)
            .unwrap_err(),
        CallError::InvalidHandle
    );

    harness.shutdown();
}

#[test]
fn service_shutdown_severs_live_channels() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();
    let mut proxy = channel
        .create_offscreen_command_buffer(None, Size::new(64, 64), 0)
        .unwrap();
    proxy.initialize(4096).unwrap();

    harness.shutdown();

    let result = proxy.flush();
    assert!(
        matches!(result, Err(CallError::ChannelLost)),
        "flush after shutdown must report channel loss, got {result:?}"
    );
}

#[test]
fn host_calls_fail_after_service_shutdown() {
    let harness = Harness::launch();
    let Harness { service, host, .. } = harness;
    service.shutdown();

    assert_eq!(host.synchronize().unwrap_err(), CallError::ChannelLost);
    assert_eq!(
        host.establish_channel_handle(3).unwrap_err(),
        CallError::ChannelLost
    );
    assert!(host.is_lost());
}

#[test]
fn channel_loss_resolves_outstanding_paints() {
    let harness = Harness::launch();
    let channel = harness.host.establish_channel(7).unwrap();
    channel.new_backing_store(0x4000, Size::new(8, 8)).unwrap();

    let bitmap =
        mica_renderer::TransportBitmap::allocate(channel.broker(), Size::new(8, 8)).unwrap();
    let rect = mica_proto::Rect::new(0, 0, 8, 8);
    let pending = channel
        .paint_to_backing_store(0x4000, 1, &bitmap, rect, vec![rect])
        .unwrap();

    channel.close();

    // The waiter must resolve (with an error), not hang, and the bitmap must
    // come back.
    let result = pending.wait(&channel);
    assert!(result.is_err());
    assert!(!bitmap.is_in_flight());

    harness.shutdown();
}
