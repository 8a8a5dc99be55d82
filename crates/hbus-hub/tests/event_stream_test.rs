//! Integration tests for the operate-mode event stream.
//!
//! Each test puts a simulated router into operate mode through the mode
//! controller and then feeds raw frames onto the line.

mod common;

use common::*;
use hbus_hub::{BusMode, ModeController, RouterEvent};
use hbus_protocol::{
    join_appended, mirror_idx, Event, EventKind, ResponseFrame, EVT_BUTTON_LONG,
    EVT_BUTTON_SHORT, OP_MODE_ACK, RESP_MARKER, RESP_PREAMBLE,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;

async fn operating(id: u8) -> (ModeController, SimRouter, mpsc::Receiver<RouterEvent>) {
    let (bus, mut router) = sim_bus(id);
    let (ctl, events) = controller(bus);
    ctl.enter_operate().await.unwrap();
    assert_eq!(ctl.mode(), BusMode::Operate);
    router.take_commands();
    (ctl, router, events)
}

fn output(module: u8, channel: u8) -> Event {
    Event::new(module, EventKind::Output, channel as i32, 1)
}

#[tokio::test]
async fn test_events_survive_random_garbage() {
    let (ctl, router, mut events) = operating(1).await;
    let mut rng = ChaCha8Rng::seed_from_u64(0x4855_4231);

    let mut expected = Vec::new();
    let mut garbage_gaps = 0;
    let mut line = Vec::new();
    for i in 0..40u8 {
        let junk = rng.gen_range(0..=3);
        if junk > 0 {
            garbage_gaps += 1;
        }
        for _ in 0..junk {
            let byte = loop {
                let b: u8 = rng.gen();
                if b != RESP_PREAMBLE && b != RESP_MARKER {
                    break b;
                }
            };
            line.push(byte);
        }
        let (module, channel) = (i % 7 + 1, i % 5);
        line.extend_from_slice(output_on(1, module, channel).as_bytes());
        expected.push(output(module, channel));
    }
    router.send(&line).await;

    for want in expected {
        let got = next_event(&mut events).await;
        assert_eq!(got.router, 1);
        assert_eq!(got.event, want);
    }
    assert!(events.try_recv().is_err());

    let stats = ctl.stream_stats();
    assert_eq!(stats.events, 40);
    assert_eq!(stats.resyncs, garbage_gaps);
    ctl.enter_server().await.unwrap();
}

#[tokio::test]
async fn test_zero_length_frame_is_one_resync() {
    let (ctl, router, mut events) = operating(1).await;

    router.send(&[RESP_PREAMBLE, RESP_MARKER, 0x01, 0x00]).await;
    router.send(output_on(1, 3, 2).as_bytes()).await;

    assert_eq!(next_event(&mut events).await.event, output(3, 2));
    let stats = ctl.stream_stats();
    assert_eq!(stats.resyncs, 1);
    assert_eq!(stats.frames, 1);
    assert_eq!(ctl.mode(), BusMode::Operate);
}

#[tokio::test]
async fn test_appended_frame_is_processed() {
    let (ctl, router, mut events) = operating(1).await;

    let first = button(1, 12, 3, EVT_BUTTON_SHORT);
    let second = output_on(1, 4, 1);
    router.send(&join_appended(&first, &second)).await;

    assert_eq!(
        next_event(&mut events).await.event,
        Event::new(12, EventKind::Button, 3, 1)
    );
    assert_eq!(next_event(&mut events).await.event, output(4, 1));
    let stats = ctl.stream_stats();
    assert_eq!(stats.appended, 1);
    assert_eq!(stats.resyncs, 0);
}

#[tokio::test]
async fn test_same_kind_different_value_keeps_order() {
    let (_ctl, router, mut events) = operating(1).await;

    router.send(button(1, 12, 3, EVT_BUTTON_SHORT).as_bytes()).await;
    router.send(button(1, 12, 3, EVT_BUTTON_LONG).as_bytes()).await;

    let first = next_event(&mut events).await.event;
    let second = next_event(&mut events).await.event;
    assert_eq!(first, Event::new(12, EventKind::Button, 3, 1));
    assert_eq!(second, Event::new(12, EventKind::Button, 3, 2));
}

#[tokio::test]
async fn test_mirror_delta_becomes_event() {
    let (ctl, router, mut events) = operating(1).await;

    router
        .send(controller_mirror(1, 5, |m| m[mirror_idx::DIM_1] = 80).as_bytes())
        .await;
    router
        .send(controller_mirror(1, 5, |m| m[mirror_idx::DIM_1] = 40).as_bytes())
        .await;
    // Marker so the test knows both mirrors were consumed.
    router.send(output_on(1, 9, 0).as_bytes()).await;

    assert_eq!(
        next_event(&mut events).await.event,
        Event::new(5, EventKind::DimValue, 0, 40)
    );
    assert_eq!(next_event(&mut events).await.event, output(9, 0));
    assert_eq!(ctl.mirrors().snapshot(5).unwrap().as_bytes()[mirror_idx::DIM_1], 40);
}

#[tokio::test]
async fn test_corrupt_checksum_never_produces_event() {
    let (ctl, router, mut events) = operating(1).await;

    let mut bad = output_on(1, 6, 1).into_bytes();
    let last = bad.len() - 1;
    bad[last] ^= 0x5a;
    router.send(&bad).await;
    router.send(output_on(1, 7, 1).as_bytes()).await;

    assert_eq!(next_event(&mut events).await.event, output(7, 1));
    assert!(events.try_recv().is_err());
    assert_eq!(ctl.stream_stats().checksum_failures, 1);
}

#[tokio::test]
async fn test_router_leaving_operate_mode_falls_back() {
    let (ctl, router, _events) = operating(1).await;
    let _monitor = ctl.spawn_fault_monitor().unwrap();
    let mut mode = ctl.subscribe();

    router
        .send(ResponseFrame::build(1, OP_MODE_ACK, &[0]).as_bytes())
        .await;

    tokio::time::timeout(TEST_WAIT, mode.wait_for(|m| *m == BusMode::Server))
        .await
        .unwrap()
        .unwrap();
    assert!(!ctl.stream_running().await);
}
