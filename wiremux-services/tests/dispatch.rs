//! Dispatcher lifecycle tests: admission, pipelining, half-close, drain.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    rc::Rc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures_channel::oneshot;
use monoio::{
    io::{sink::SinkExt, stream::Stream, AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt},
    net::{TcpListener, TcpStream},
};
use monoio_codec::{Decoded, Decoder, Encoder, Framed};

use wiremux_core::{
    listener::Listener,
    packet::{Packet, PacketCodec},
    queue::RequestQueue,
};
use wiremux_services::{
    mux::{Dispatcher, MuxConfig, Status},
    upstream::WireRequestQueue,
};

const MAX_FRAME: usize = 4096;

/// Test queue: echoes immediately, or parks requests for the test to
/// complete or fail by hand.
#[derive(Clone)]
struct TestQueue {
    inner: Rc<TestQueueInner>,
}

struct TestQueueInner {
    echo: bool,
    parked: RefCell<VecDeque<(Bytes, oneshot::Sender<Bytes>)>>,
    refuse: Cell<bool>,
}

impl TestQueue {
    fn echo() -> Self {
        Self::with_mode(true)
    }

    fn parked() -> Self {
        Self::with_mode(false)
    }

    fn with_mode(echo: bool) -> Self {
        Self {
            inner: Rc::new(TestQueueInner {
                echo,
                parked: RefCell::new(VecDeque::new()),
                refuse: Cell::new(false),
            }),
        }
    }

    fn pending(&self) -> usize {
        self.inner.parked.borrow().len()
    }

    /// Echoes the oldest parked request back.
    fn complete_next(&self) {
        let (body, tx) = self
            .inner
            .parked
            .borrow_mut()
            .pop_front()
            .expect("no parked request");
        let _ = tx.send(body);
    }

    /// Fails the oldest parked request (its waiter observes `None`).
    fn fail_next(&self) {
        self.inner
            .parked
            .borrow_mut()
            .pop_front()
            .expect("no parked request");
    }

    /// Fails everything in flight and refuses all later enqueues, the way
    /// a dead upstream does.
    fn fail_all(&self) {
        self.inner.refuse.set(true);
        self.inner.parked.borrow_mut().clear();
    }
}

impl RequestQueue for TestQueue {
    type Pending = Pin<Box<dyn Future<Output = Option<Bytes>>>>;

    fn enqueue(&self, body: Bytes) -> io::Result<Self::Pending> {
        if self.inner.refuse.get() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if self.inner.echo {
            Ok(Box::pin(std::future::ready(Some(body))))
        } else {
            let (tx, rx) = oneshot::channel();
            self.inner.parked.borrow_mut().push_back((body, tx));
            Ok(Box::pin(async move { rx.await.ok() }))
        }
    }
}

/// Minimal framed client over one socket, usable half-closed.
struct TestClient {
    stream: TcpStream,
    codec: PacketCodec,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            codec: PacketCodec::new(MAX_FRAME),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, id: u64, body: &'static [u8]) {
        let mut out = BytesMut::new();
        self.codec
            .encode(Packet::new(id, Bytes::from_static(body)), &mut out)
            .unwrap();
        let (res, _) = self.stream.write_all(out.freeze()).await;
        res.unwrap();
    }

    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Decoded::Some(packet) = self.codec.decode(&mut self.buf).unwrap() {
                return Some(packet);
            }
            self.buf.reserve(4096);
            let owned = std::mem::take(&mut self.buf);
            let (res, owned) = self.stream.read(owned).await;
            self.buf = owned;
            match res {
                Ok(0) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    async fn recv_timeout(&mut self, ms: u64) -> Option<Packet> {
        match monoio::time::timeout(Duration::from_millis(ms), self.recv()).await {
            Ok(packet) => packet,
            Err(_) => None,
        }
    }

    async fn shutdown_write(&mut self) {
        self.stream.shutdown().await.unwrap();
    }
}

fn start_dispatcher<Q>(
    queue: Q,
    max_connections: usize,
) -> (SocketAddr, Status, monoio::task::JoinHandle<()>)
where
    Q: RequestQueue + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let dispatcher = Dispatcher::new(
        vec![Listener::Tcp(listener)],
        queue,
        MuxConfig {
            max_connections,
            max_frame_size: MAX_FRAME,
        },
    );
    let status = dispatcher.status();
    let serve = monoio::spawn(dispatcher.serve());
    (addr, status, serve)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        monoio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

#[monoio::test(timer_enabled = true)]
async fn admission_bounds_concurrent_connections() {
    let queue = TestQueue::echo();
    let (addr, status, _serve) = start_dispatcher(queue, 2);

    let mut first = TestClient::connect(addr).await;
    first.send(1, b"a").await;
    assert_eq!(&first.recv().await.unwrap().body[..], b"a");

    let mut second = TestClient::connect(addr).await;
    second.send(1, b"b").await;
    assert_eq!(&second.recv().await.unwrap().body[..], b"b");
    assert_eq!(status.active_connections(), 2);

    // The third connect lands in the kernel backlog; it is not admitted
    // and gets no response while both slots are taken.
    let mut third = TestClient::connect(addr).await;
    third.send(1, b"c").await;
    assert!(third.recv_timeout(200).await.is_none());
    assert_eq!(status.active_connections(), 2);
    monoio::time::sleep(Duration::from_millis(50)).await;

    // A slot frees, accepts re-arm, and the parked client is served.
    drop(first);
    let response = third
        .recv_timeout(2000)
        .await
        .expect("third client served after a slot freed");
    assert_eq!(&response.body[..], b"c");
}

#[monoio::test(timer_enabled = true)]
async fn pipelined_requests_all_complete() {
    let queue = TestQueue::echo();
    let (addr, status, _serve) = start_dispatcher(queue, 4);

    let mut client = TestClient::connect(addr).await;
    for id in 0..100 {
        client.send(id, b"payload").await;
    }
    let mut seen = [false; 100];
    for _ in 0..100 {
        let packet = client.recv().await.expect("response");
        assert_eq!(&packet.body[..], b"payload");
        seen[packet.id as usize] = true;
    }
    assert!(seen.iter().all(|s| *s));

    drop(client);
    wait_until(|| status.active_connections() == 0).await;
    // A clean client exit never drains the dispatcher.
    assert!(status.is_alive());
}

#[monoio::test(timer_enabled = true)]
async fn half_closed_connection_drains_before_teardown() {
    let queue = TestQueue::parked();
    let (addr, status, _serve) = start_dispatcher(queue.clone(), 4);

    let mut client = TestClient::connect(addr).await;
    for id in 0..5 {
        client.send(id, b"req").await;
    }
    wait_until(|| queue.pending() == 5).await;

    queue.complete_next();
    queue.complete_next();
    assert_eq!(client.recv().await.unwrap().id, 0);
    assert_eq!(client.recv().await.unwrap().id, 1);

    // EOF with three responses still owed: the connection must stay up
    // until they are written back.
    client.shutdown_write().await;
    monoio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(status.active_connections(), 1);

    queue.complete_next();
    queue.complete_next();
    queue.complete_next();
    for expected in 2..5 {
        assert_eq!(client.recv().await.expect("late response").id, expected);
    }
    wait_until(|| status.active_connections() == 0).await;
    assert!(status.is_alive());
}

#[monoio::test(timer_enabled = true)]
async fn upstream_failure_drains_the_dispatcher() {
    let queue = TestQueue::parked();
    let (addr, status, serve) = start_dispatcher(queue.clone(), 4);

    let mut first = TestClient::connect(addr).await;
    let mut second = TestClient::connect(addr).await;
    for id in 0..3 {
        first.send(id, b"one").await;
        second.send(id, b"two").await;
    }
    wait_until(|| queue.pending() == 6).await;
    assert!(status.is_alive());

    // One failed response puts the dispatcher into drain; the rest of the
    // in-flight requests fail the way a dead upstream fails them.
    queue.fail_next();
    queue.fail_all();

    serve.await;
    assert!(!status.is_alive());
    assert!(status.has_failed());
    assert_eq!(status.active_connections(), 0);

    // Clients observe their sockets closing without responses.
    assert!(first.recv_timeout(1000).await.is_none());
    assert!(second.recv_timeout(1000).await.is_none());

    // The listener went away with the dispatcher.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[monoio::test(timer_enabled = true)]
async fn stalled_client_does_not_block_others() {
    let queue = TestQueue::echo();
    let (addr, status, _serve) = start_dispatcher(queue, 4);

    let mut stalled = TestClient::connect(addr).await;
    for id in 0..50 {
        stalled.send(id, b"stall").await;
    }

    // While the first client never reads, another client's traffic flows.
    let mut live = TestClient::connect(addr).await;
    for id in 0..10 {
        live.send(id, b"live").await;
        assert_eq!(live.recv().await.expect("live response").id, id);
    }

    for _ in 0..50 {
        assert!(stalled.recv().await.is_some());
    }
    drop(stalled);
    drop(live);
    wait_until(|| status.active_connections() == 0).await;
}

#[monoio::test(timer_enabled = true)]
async fn end_to_end_through_the_wire_queue() {
    let target_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let target_addr = target_listener.local_addr().unwrap();
    let target = monoio::spawn(async move {
        let (stream, _) = target_listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec::new(MAX_FRAME));
        let first = framed.next().await.unwrap().unwrap();
        let second = framed.next().await.unwrap().unwrap();
        // Answer the first two in reverse order.
        framed.send_and_flush(second).await.unwrap();
        framed.send_and_flush(first).await.unwrap();
        let third = framed.next().await.unwrap().unwrap();
        framed.send_and_flush(third).await.unwrap();
        // Dropping the connection here is an upstream failure.
    });

    let upstream = TcpStream::connect(target_addr).await.unwrap();
    let queue = WireRequestQueue::start(upstream, MAX_FRAME);
    let (addr, status, serve) = start_dispatcher(queue, 4);

    let mut client = TestClient::connect(addr).await;
    client.send(10, b"alpha").await;
    client.send(11, b"beta").await;
    // The upstream reordered them; the client matches by packet id.
    let mut bodies = HashMap::new();
    for _ in 0..2 {
        let packet = client.recv().await.unwrap();
        bodies.insert(packet.id, packet.body);
    }
    assert_eq!(bodies.get(&10).map(|b| &b[..]), Some(&b"alpha"[..]));
    assert_eq!(bodies.get(&11).map(|b| &b[..]), Some(&b"beta"[..]));

    client.send(12, b"gamma").await;
    assert_eq!(client.recv().await.unwrap().id, 12);

    target.await;
    monoio::time::sleep(Duration::from_millis(50)).await;

    // The next request meets a dead upstream and drains the dispatcher.
    client.send(13, b"delta").await;
    serve.await;
    assert!(!status.is_alive());
}
