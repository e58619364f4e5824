//! The wire request queue: owner of the single upstream connection.
//!
//! Requests from every client connection are multiplexed onto one
//! persistent transport under internally assigned ids; responses may come
//! back in any order and are routed to their waiters by id. There is no
//! reconnection: the first transport error fails the queue permanently,
//! fails every in-flight request, and refuses everything after — which is
//! exactly the signal the dispatcher drains on.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_channel::{mpsc, oneshot};
use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{sink::SinkExt, stream::Stream, AsyncReadRent, AsyncWriteRent, Split, Splitable},
    net::TcpStream,
    BufResult,
};
use monoio_codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use wiremux_core::{
    config::Endpoint,
    packet::{Packet, PacketCodec},
    queue::RequestQueue,
};

/// Pre-sized for the expected in-flight request population.
const PENDING_CAPACITY: usize = 32 * 1024;

/// Cheaply clonable handle to the upstream request channel.
pub struct WireRequestQueue {
    inner: Rc<Inner>,
}

impl Clone for WireRequestQueue {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner {
    requests: mpsc::UnboundedSender<Packet>,
    pending: RefCell<HashMap<u64, oneshot::Sender<Bytes>>>,
    next_id: Cell<u64>,
    failed: Cell<bool>,
}

impl WireRequestQueue {
    /// Dials the upstream target and starts the queue over it.
    pub async fn connect(endpoint: &Endpoint, max_frame: usize) -> io::Result<Self> {
        let stream = UpstreamStream::connect(endpoint).await?;
        Ok(Self::start(stream, max_frame))
    }

    /// Starts a queue over an established upstream transport.
    pub fn start<S>(io: S, max_frame: usize) -> Self
    where
        S: Split + AsyncReadRent + AsyncWriteRent + 'static,
    {
        let (request_tx, request_rx) = mpsc::unbounded();
        let inner = Rc::new(Inner {
            requests: request_tx,
            pending: RefCell::new(HashMap::with_capacity(PENDING_CAPACITY)),
            next_id: Cell::new(0),
            failed: Cell::new(false),
        });

        let (read_half, write_half) = io.into_split();
        monoio::spawn(send_requests(
            FramedWrite::new(write_half, PacketCodec::new(max_frame)),
            request_rx,
            Rc::downgrade(&inner),
        ));
        monoio::spawn(receive_responses(
            FramedRead::new(read_half, PacketCodec::new(max_frame)),
            Rc::downgrade(&inner),
        ));

        Self { inner }
    }
}

impl RequestQueue for WireRequestQueue {
    type Pending = PendingResponse;

    fn enqueue(&self, body: Bytes) -> io::Result<PendingResponse> {
        if self.inner.failed.get() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id.wrapping_add(1));

        let (tx, rx) = oneshot::channel();
        self.inner.pending.borrow_mut().insert(id, tx);
        if self.inner.requests.unbounded_send(Packet::new(id, body)).is_err() {
            self.inner.pending.borrow_mut().remove(&id);
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        Ok(PendingResponse { rx })
    }
}

/// Resolves exactly once per accepted enqueue: the response body, or
/// `None` when the upstream failed the request.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Bytes>,
}

impl Future for PendingResponse {
    type Output = Option<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.rx).poll(cx).map(|res| res.ok())
    }
}

async fn send_requests<W: AsyncWriteRent>(
    mut sink: FramedWrite<W, PacketCodec>,
    mut requests: mpsc::UnboundedReceiver<Packet>,
    state: Weak<Inner>,
) {
    use futures_util::StreamExt;

    while let Some(packet) = requests.next().await {
        if let Err(e) = sink.send_and_flush(packet).await {
            warn!("upstream write failed: {e}");
            fail(&state);
            return;
        }
    }
    debug!("request queue released, upstream writer stopped");
}

async fn receive_responses<R: AsyncReadRent>(
    mut source: FramedRead<R, PacketCodec>,
    state: Weak<Inner>,
) {
    loop {
        match source.next().await {
            Some(Ok(packet)) => {
                let Some(inner) = state.upgrade() else { return };
                match inner.pending.borrow_mut().remove(&packet.id) {
                    Some(tx) => {
                        let _ = tx.send(packet.body);
                    }
                    None => warn!("upstream response for unknown request id {}", packet.id),
                };
            }
            Some(Err(e)) => {
                warn!("upstream read failed: {e}");
                break;
            }
            None => {
                info!("upstream closed its connection");
                break;
            }
        }
    }
    fail(&state);
}

/// Marks the queue failed and fails every pending request. The pending
/// senders drop here, so every waiter observes `None`.
fn fail(state: &Weak<Inner>) {
    if let Some(inner) = state.upgrade() {
        if !inner.failed.replace(true) {
            inner.pending.borrow_mut().clear();
        }
    }
}

/// Established transport to the upstream target.
pub enum UpstreamStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(monoio::net::UnixStream),
}

unsafe impl Split for UpstreamStream {}

impl UpstreamStream {
    pub async fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::SocketAddress(sa) => {
                let addr: SocketAddr = sa.socket_addr;
                TcpStream::connect(addr).await.map(Self::Tcp)
            }
            #[cfg(unix)]
            Endpoint::Uds(uds) => monoio::net::UnixStream::connect(&uds.uds_path)
                .await
                .map(Self::Unix),
            #[cfg(not(unix))]
            Endpoint::Uds(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix domain upstreams are not supported on this platform",
            )),
        }
    }
}

impl AsyncReadRent for UpstreamStream {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            UpstreamStream::Tcp(inner) => inner.read(buf).await,
            #[cfg(unix)]
            UpstreamStream::Unix(inner) => inner.read(buf).await,
        }
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            UpstreamStream::Tcp(inner) => inner.readv(buf).await,
            #[cfg(unix)]
            UpstreamStream::Unix(inner) => inner.readv(buf).await,
        }
    }
}

impl AsyncWriteRent for UpstreamStream {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            UpstreamStream::Tcp(inner) => inner.write(buf).await,
            #[cfg(unix)]
            UpstreamStream::Unix(inner) => inner.write(buf).await,
        }
    }

    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        match self {
            UpstreamStream::Tcp(inner) => inner.writev(buf_vec).await,
            #[cfg(unix)]
            UpstreamStream::Unix(inner) => inner.writev(buf_vec).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            UpstreamStream::Tcp(inner) => inner.flush().await,
            #[cfg(unix)]
            UpstreamStream::Unix(inner) => inner.flush().await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            UpstreamStream::Tcp(inner) => inner.shutdown().await,
            #[cfg(unix)]
            UpstreamStream::Unix(inner) => inner.shutdown().await,
        }
    }
}
