//! Integration tests for mode transitions, the network block and API
//! command dispatch.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use hbus_hub::{ApiGroup, BusMode, ExchangeOutcome, MirrorStore, ModeConfig, ModeController};
use hbus_protocol::{templates, Command, OP_GLOBAL_MODE, OP_MODE_ACK};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_operate_and_back_twice() {
    let (bus, mut router) = sim_bus(1);
    let (ctl, _events) = controller(bus);

    for _ in 0..2 {
        ctl.enter_operate().await.unwrap();
        assert_eq!(ctl.mode(), BusMode::Operate);
        assert!(ctl.stream_running().await);

        ctl.enter_server().await.unwrap();
        assert_eq!(ctl.mode(), BusMode::Server);
        assert!(!ctl.stream_running().await);
    }

    let commands = router.take_commands();
    assert_eq!(
        opcodes(&commands),
        vec![
            OP_MODE_ACK,
            OP_MODE_ACK,
            OP_GLOBAL_MODE,
            OP_MODE_ACK,
            OP_MODE_ACK,
            OP_GLOBAL_MODE
        ]
    );
    // Operate with mirror and events on, then back to server.
    assert_eq!(&commands[0][3..7], &[0x85, 0x01, 0x01, 0x01]);
    assert_eq!(&commands[1][3..5], &[0x85, 0x00]);
    assert!(*ctl.router_reachable().borrow());
}

#[tokio::test]
async fn test_repeated_requests_are_idempotent() {
    let (bus, mut router) = sim_bus(1);
    let (ctl, _events) = controller(bus);

    ctl.enter_server().await.unwrap();
    assert!(router.take_commands().is_empty());

    ctl.enter_operate().await.unwrap();
    ctl.enter_operate().await.unwrap();
    assert_eq!(router.take_commands().len(), 1);
    ctl.enter_server().await.unwrap();
}

#[tokio::test]
async fn test_test_mode_operates_without_client() {
    let (bus, _router) = sim_bus(1);
    let (events_tx, _events) = mpsc::channel(8);
    let ctl = ModeController::new(bus, ModeConfig::default(), MirrorStore::new(), events_tx);

    assert!(ctl.enter_operate().await.is_err());
    ctl.set_test_mode(true);
    ctl.enter_operate().await.unwrap();
    assert_eq!(ctl.mode(), BusMode::Operate);
    ctl.enter_server().await.unwrap();
}

#[tokio::test]
async fn test_initial_server_mode() {
    let (bus, mut router) = sim_bus(1);
    let (ctl, _events) = controller(bus);

    assert!(ctl.set_initial_server_mode().await.unwrap());
    assert_eq!(router.next_command().await[4], 0x00);

    router.set_mute(true);
    assert!(!ctl.set_initial_server_mode().await.unwrap());
    assert_eq!(ctl.mode(), BusMode::Server);
}

#[tokio::test]
async fn test_unacknowledged_operate_still_streams() {
    let (bus, router) = sim_bus(1);
    let (ctl, mut events) = controller(bus);

    router.set_mute(true);
    ctl.enter_operate().await.unwrap();
    assert_eq!(ctl.mode(), BusMode::Operate);

    router.send(output_on(1, 2, 0).as_bytes()).await;
    assert_eq!(next_event(&mut events).await.event.module, 2);
}

#[tokio::test]
async fn test_network_block_holds_api_commands() {
    let (bus, _router) = sim_bus(1);
    let (ctl, _events) = controller(bus);

    let block = ctl.block_network();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let api = tokio::spawn({
        let ctl = ctl.clone();
        async move {
            ctl.dispatch(ApiGroup::Data, |_exchange| async move {
                let _ = done_tx.send(());
            })
            .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(done_rx.try_recv().is_err());

    drop(block);
    tokio::time::timeout(TEST_WAIT, done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    api.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_blocked_restores_operate_mode() {
    let (bus, _router) = sim_bus(1);
    let (ctl, _events) = controller(bus);
    ctl.enter_operate().await.unwrap();

    let inner = ctl.clone();
    let seen = ctl
        .run_blocked(true, || async move {
            inner.enter_server().await.unwrap();
            (inner.mode(), inner.network_blocked())
        })
        .await;

    assert_eq!(seen, (BusMode::Server, true));
    assert!(!ctl.network_blocked());
    assert_eq!(ctl.mode(), BusMode::Operate);
}

#[tokio::test]
async fn test_blocked_operation_waits_for_running_command() {
    let (bus, _router) = sim_bus(1);
    let (ctl, _events) = controller(bus);
    ctl.enter_operate().await.unwrap();

    let busy = Arc::new(AtomicBool::new(false));
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let api = tokio::spawn({
        let ctl = ctl.clone();
        let busy = busy.clone();
        async move {
            ctl.dispatch(ApiGroup::Forward, |_exchange| async move {
                busy.store(true, Ordering::SeqCst);
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(300)).await;
                busy.store(false, Ordering::SeqCst);
            })
            .await
        }
    });
    started_rx.await.unwrap();

    let inner = ctl.clone();
    let busy_seen = busy.clone();
    let (overlapped, mode) = ctl
        .run_blocked(true, || async move {
            (busy_seen.load(Ordering::SeqCst), inner.mode())
        })
        .await;

    assert!(!overlapped);
    assert_eq!(mode, BusMode::Server);
    assert_eq!(ctl.mode(), BusMode::Operate);
    api.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_command_queued_behind_block_waits_for_it() {
    let (bus, _router) = sim_bus(1);
    let (ctl, _events) = controller(bus);

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
    let blocked = tokio::spawn({
        let ctl = ctl.clone();
        async move {
            ctl.run_blocked(false, || async move {
                let _ = entered_tx.send(());
                let _ = release_rx.await;
            })
            .await
        }
    });
    entered_rx.await.unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let api = tokio::spawn({
        let ctl = ctl.clone();
        let ran = ran.clone();
        async move {
            ctl.dispatch(ApiGroup::Data, |_exchange| async move {
                ran.store(true, Ordering::SeqCst);
            })
            .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ran.load(Ordering::SeqCst));

    let _ = release_tx.send(());
    blocked.await.unwrap();
    api.await.unwrap().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_dispatch_policies() {
    let (bus, _router) = sim_bus(1);
    let (ctl, _events) = controller(bus);
    let query = || Command::new(templates::GET_GLOB_MODE);

    // Data: run in server mode, restore operate mode.
    ctl.enter_operate().await.unwrap();
    let outcome = ctl
        .dispatch(ApiGroup::Data, |exchange| async move {
            exchange.send_and_await(&query(), TEST_WAIT).await.unwrap()
        })
        .await
        .unwrap();
    assert!(matches!(outcome, ExchangeOutcome::Reply(_)));
    assert_eq!(ctl.mode(), BusMode::Operate);

    // Forward: untouched, so no reply can be read.
    let outcome = ctl
        .dispatch(ApiGroup::Forward, |exchange| async move {
            exchange.send_and_await(&query(), TEST_WAIT).await.unwrap()
        })
        .await
        .unwrap();
    assert_eq!(outcome, ExchangeOutcome::Unavailable);
    assert_eq!(ctl.mode(), BusMode::Operate);

    // Admin: server mode, and stays there.
    ctl.dispatch(ApiGroup::Admin, |_exchange| async {})
        .await
        .unwrap();
    assert_eq!(ctl.mode(), BusMode::Server);

    // Actions: from server mode into operate mode afterwards.
    ctl.dispatch(ApiGroup::Actions, |_exchange| async {})
        .await
        .unwrap();
    assert_eq!(ctl.mode(), BusMode::Operate);

    // Settings from server mode: nothing to restore.
    ctl.enter_server().await.unwrap();
    ctl.dispatch(ApiGroup::Settings, |_exchange| async {})
        .await
        .unwrap();
    assert_eq!(ctl.mode(), BusMode::Server);
}

#[tokio::test]
async fn test_line_failure_forces_server_mode() {
    let (bus, router) = sim_bus(1);
    let (ctl, _events) = controller(bus);
    let _monitor = ctl.spawn_fault_monitor().unwrap();
    assert!(ctl.spawn_fault_monitor().is_none());
    let mut reachable = ctl.router_reachable();

    ctl.enter_operate().await.unwrap();
    router.hang_up().await;

    tokio::time::timeout(TEST_WAIT, reachable.wait_for(|up| !*up))
        .await
        .unwrap()
        .unwrap();
    let mut mode = ctl.subscribe();
    tokio::time::timeout(TEST_WAIT, mode.wait_for(|m| *m == BusMode::Server))
        .await
        .unwrap()
        .unwrap();
    assert!(!ctl.stream_running().await);
}

#[tokio::test]
async fn test_operate_mode_recovered_after_router_drops_out() {
    let (bus, mut router) = sim_bus(1);
    let (ctl, mut events) = controller(bus);
    let _monitor = ctl.spawn_fault_monitor().unwrap();
    ctl.enter_operate().await.unwrap();
    router.take_commands();
    let mut mode = ctl.subscribe();

    router
        .send(hbus_protocol::ResponseFrame::build(1, OP_MODE_ACK, &[0]).as_bytes())
        .await;
    tokio::time::timeout(TEST_WAIT, mode.wait_for(|m| *m == BusMode::Server))
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(TEST_WAIT, mode.wait_for(|m| *m == BusMode::Operate))
        .await
        .unwrap()
        .unwrap();
    assert!(ctl.stream_running().await);

    // Drain, then the operate command again.
    let commands = router.take_commands();
    assert_eq!(opcodes(&commands), vec![OP_GLOBAL_MODE, OP_MODE_ACK]);
    assert_eq!(commands[1][4], 0x01);

    router.send(output_on(1, 5, 2).as_bytes()).await;
    assert_eq!(next_event(&mut events).await.event.module, 5);
}

#[tokio::test]
async fn test_no_recovery_after_admin_command() {
    let (bus, router) = sim_bus(1);
    let (ctl, _events) = controller(bus);
    let _monitor = ctl.spawn_fault_monitor().unwrap();
    ctl.enter_operate().await.unwrap();
    let mut mode = ctl.subscribe();

    router
        .send(hbus_protocol::ResponseFrame::build(1, OP_MODE_ACK, &[0]).as_bytes())
        .await;
    tokio::time::timeout(TEST_WAIT, mode.wait_for(|m| *m == BusMode::Server))
        .await
        .unwrap()
        .unwrap();
    ctl.dispatch(ApiGroup::Admin, |_exchange| async {})
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(ctl.mode(), BusMode::Server);
    assert!(!ctl.stream_running().await);
}
