mod common;

use std::rc::Rc;
use std::thread;
use std::time::Duration;

use chanloop::channel::Channel;
use chanloop::channel::direct::DirectChannel;
use chanloop::channel::mem::{MemChannel, MemConfig};
use chanloop::{Handle, Outcome};

use common::{init_tracing, mem_pair};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

#[chanloop::test]
async fn posts_from_another_thread_wake_the_descriptor(handle: Handle) {
    init_tracing();
    let (server, client) = mem_pair(&handle, MemConfig::new("client"));

    let poster = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        for seq in 0..3 {
            server.post(b"from afar", seq).unwrap();
        }
    });

    for seq in 0..3 {
        let msg = client.recv(WAIT).await.into_data().unwrap();
        assert_eq!(msg.seq, seq);
    }
    poster.join().unwrap();
}

#[chanloop::test]
async fn posts_from_another_thread_reach_a_polled_channel(handle: Handle) {
    init_tracing();
    let (server, client) = mem_pair(&handle, MemConfig::new("client").with_fd(false));

    let poster = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        server.post(b"tick", 1).unwrap();
    });

    assert_eq!(client.recv(WAIT).await.into_data().map(|m| m.seq), Some(1));
    poster.join().unwrap();
}

// Nothing to wait on and no timers besides the receive timeout: only the cross-thread
// wakeup can get the loop out of its poll in time.
#[chanloop::test]
async fn callbacks_on_another_thread_interrupt_the_poll(handle: Handle) {
    init_tracing();
    let (a, b) = DirectChannel::pair("a", "b");
    a.open().unwrap();
    b.open().unwrap();
    let b = handle.channel_add(Rc::new(b)).unwrap();

    let poster = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        a.post(b"direct", 3).unwrap();
        a.close();
    });

    let start = std::time::Instant::now();
    let msg = b.recv(Some(Duration::from_secs(30))).await.into_data().unwrap();
    assert_eq!(msg.seq, 3);
    assert!(start.elapsed() < Duration::from_secs(5));
    poster.join().unwrap();

    // Only the other end closed.
    assert_eq!(b.recv(Some(Duration::from_millis(20))).await, Outcome::TimedOut);
}

#[chanloop::test]
async fn close_from_another_thread_resolves_pending_recv(handle: Handle) {
    init_tracing();
    let (server, client) = MemChannel::pair(MemConfig::new("server"), MemConfig::new("client"));
    server.open().unwrap();
    client.open().unwrap();
    assert!(client.readiness().is_some());
    let remote = client.clone();
    let client = handle.channel_add(Rc::new(client)).unwrap();

    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        remote.close();
    });

    let start = std::time::Instant::now();
    assert_eq!(client.recv(WAIT).await, Outcome::Closed);
    assert!(start.elapsed() < Duration::from_secs(2));
    closer.join().unwrap();

    assert_eq!(
        client.recv(Some(Duration::from_millis(20))).await,
        Outcome::Closed
    );
}
