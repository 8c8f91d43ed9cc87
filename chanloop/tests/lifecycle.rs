mod common;

use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chanloop::channel::mem::{MemChannel, MemConfig};
use chanloop::channel::{Channel, State};
use chanloop::{Handle, InvariantViolation, Loop, LoopError, Outcome};

use common::{ScriptedChannel, init_tracing, mem_pair, scripted};

#[chanloop::test]
async fn close_resolves_pending_recv_as_closed(handle: Handle) {
    init_tracing();
    let (_server, client) = mem_pair(&handle, MemConfig::new("client"));

    let channel = client.channel().clone();
    let h = handle.clone();
    handle.spawn(async move {
        h.sleep(Duration::from_millis(20)).await;
        channel.close();
    });

    let start = Instant::now();
    let outcome = client.recv(Some(Duration::from_secs(5))).await;
    assert_eq!(outcome, Outcome::Closed);
    assert!(start.elapsed() < Duration::from_secs(1));

    // Stays closed.
    assert_eq!(client.recv(None).await, Outcome::Closed);
}

#[chanloop::test]
async fn autoclose_delivers_one_message_then_closes(handle: Handle) {
    init_tracing();
    let (server, client) =
        mem_pair(&handle, MemConfig::new("client").with_autoclose(true));

    server.post(b"response", 1).unwrap();
    server.post(b"ignored", 2).unwrap();

    let msg = client.recv(Some(Duration::from_secs(2))).await;
    assert_eq!(msg.into_data().map(|m| m.seq), Some(1));

    handle.sleep(Duration::ZERO).await;
    assert_eq!(client.state(), State::Closed);
    assert_eq!(client.recv(Some(Duration::from_secs(2))).await, Outcome::Closed);
}

#[chanloop::test]
async fn error_state_resolves_pending_recv_as_closed(handle: Handle) {
    init_tracing();
    let (channel, adapter) = scripted(&handle, "flaky");
    channel.open().unwrap();

    let h = handle.clone();
    let failing = channel.clone();
    handle.spawn(async move {
        h.sleep(Duration::from_millis(10)).await;
        failing.set_state(State::Error);
    });

    assert_eq!(
        adapter.recv(Some(Duration::from_secs(5))).await,
        Outcome::Closed
    );
    assert_eq!(adapter.state(), State::Error);
}

#[chanloop::test]
async fn buffered_data_is_drained_before_closed(handle: Handle) {
    init_tracing();
    let (channel, adapter) = scripted(&handle, "loopback");
    channel.open().unwrap();

    adapter.post(b"last words", 5).unwrap();
    channel.close();

    let msg = adapter.recv(None).await.into_data().unwrap();
    assert_eq!(msg.seq, 5);
    assert_eq!(adapter.recv(None).await, Outcome::Closed);
}

#[chanloop::test]
async fn reopened_channel_delivers_again(handle: Handle) {
    init_tracing();
    let (channel, adapter) = scripted(&handle, "reopen");
    channel.open().unwrap();
    channel.close();
    assert_eq!(adapter.recv(None).await, Outcome::Closed);

    channel.open().unwrap();
    adapter.post(b"again", 2).unwrap();
    assert_eq!(adapter.recv(None).await.into_data().map(|m| m.seq), Some(2));
}

#[chanloop::test]
async fn channel_del_resolves_pending_recv_as_closed(handle: Handle) {
    init_tracing();
    let (_server, client) = mem_pair(&handle, MemConfig::new("client"));
    let client = Rc::new(client);

    let h = handle.clone();
    let deleting = client.clone();
    handle.spawn(async move {
        h.sleep(Duration::from_millis(10)).await;
        h.channel_del(&deleting);
    });

    assert_eq!(
        client.recv(Some(Duration::from_secs(5))).await,
        Outcome::Closed
    );
    // Deregistered for good: later receives do not wait.
    assert_eq!(client.recv(None).await, Outcome::Closed);
}

#[chanloop::test]
async fn spawned_tasks_can_be_joined(handle: Handle) {
    init_tracing();
    let h = handle.clone();
    let outer = handle.spawn(async move {
        let inner = h.spawn(async { 21 });
        inner.await * 2
    });
    assert_eq!(outer.await, 42);
    assert_eq!(handle.task_count(), 1);
}

#[test]
fn duplicate_descriptor_aborts_run() {
    init_tracing();
    let mut event_loop = Loop::new().unwrap();
    let handle = event_loop.handle();
    let (server, client) = MemChannel::pair(MemConfig::new("server"), MemConfig::new("client"));
    let client = Rc::new(client);

    // Two registrations of one channel both try to arm its descriptor once it opens.
    let first = handle.channel_add(client.clone()).unwrap();
    let _second = handle.channel_add(client.clone()).unwrap();
    server.open().unwrap();
    client.open().unwrap();

    // No timer bounds this receive, so the loop must not block after recording the violation.
    let err = event_loop
        .run(async move { first.recv(None).await })
        .unwrap_err();

    assert!(matches!(
        err,
        LoopError::Invariant(InvariantViolation::DuplicateDescriptor { .. })
    ));
}

#[chanloop::test]
async fn suspended_polled_channel_holds_data_until_resumed(handle: Handle) {
    init_tracing();
    let (server, client) = mem_pair(&handle, MemConfig::new("client").with_fd(false));

    client.suspend();
    server.post(b"held", 4).unwrap();
    assert_eq!(
        client.recv(Some(Duration::from_millis(40))).await,
        Outcome::TimedOut
    );
    assert_eq!(client.channel().state(), State::Active);

    client.resume().unwrap();
    assert_eq!(
        client.recv(Some(Duration::from_secs(2))).await.into_data().map(|m| m.seq),
        Some(4)
    );
}

#[chanloop::test]
async fn suspended_channel_still_sees_close(handle: Handle) {
    init_tracing();
    let (_server, client) = mem_pair(&handle, MemConfig::new("client"));
    client.suspend();

    let channel = client.channel().clone();
    let h = handle.clone();
    handle.spawn(async move {
        h.sleep(Duration::from_millis(10)).await;
        channel.close();
    });

    assert_eq!(client.recv(Some(Duration::from_secs(5))).await, Outcome::Closed);
}

#[chanloop::test]
async fn announced_sub_channels_are_watched_and_handed_out(handle: Handle) {
    init_tracing();
    let (listener, adapter) = scripted(&handle, "listener");
    listener.open().unwrap();

    let (peer, conn) = MemChannel::pair(MemConfig::new("peer"), MemConfig::new("conn"));
    peer.open().unwrap();
    conn.open().unwrap();
    listener.add_child(Arc::new(conn));
    peer.post(b"hello", 1).unwrap();

    let mut children = adapter.take_children();
    assert_eq!(children.len(), 1);
    assert!(adapter.take_children().is_empty());
    let conn = children.pop().unwrap();
    assert_eq!(conn.name(), "conn");
    assert_eq!(
        conn.recv(Some(Duration::from_secs(2))).await.into_data().map(|m| m.seq),
        Some(1)
    );

    listener.delete_child("conn");
    assert_eq!(conn.recv(Some(Duration::from_secs(5))).await, Outcome::Closed);
}

#[chanloop::test]
async fn unclaimed_sub_channels_go_with_their_parent(handle: Handle) {
    init_tracing();
    let (listener, adapter) = scripted(&handle, "listener");
    listener.open().unwrap();
    let child = Arc::new(ScriptedChannel::new("child"));
    listener.add_child(child.clone());

    handle.sleep(Duration::ZERO).await;
    assert_eq!(child.subscriber_count(), 1);

    handle.channel_del(&adapter);
    assert_eq!(child.subscriber_count(), 0);
    assert_eq!(listener.subscriber_count(), 0);
}

#[chanloop::test]
async fn deleted_channel_stops_receiving_callbacks(handle: Handle) {
    init_tracing();
    let (channel, adapter) = scripted(&handle, "resubscribed");
    assert_eq!(channel.subscriber_count(), 1);

    handle.channel_del(&adapter);
    assert_eq!(channel.subscriber_count(), 0);

    let again = handle.channel_add(channel.clone()).unwrap();
    drop(adapter);
    assert_eq!(channel.subscriber_count(), 1);

    channel.open().unwrap();
    again.post(b"once", 1).unwrap();
    assert_eq!(again.recv(None).await.into_data().map(|m| m.seq), Some(1));
    assert_eq!(
        again.recv(Some(Duration::from_millis(20))).await,
        Outcome::TimedOut
    );
}
