use std::convert::Infallible;

use futures_channel::mpsc;
use monoio::io::{sink::SinkExt, stream::Stream, AsyncWriteRent, Splitable};
use monoio_codec::{FramedRead, FramedWrite};
use service_async::Service;
use tracing::{trace, warn};

use wiremux_core::{
    context::PeerAddr,
    listener::AcceptedStream,
    packet::{Packet, PacketCodec},
    queue::RequestQueue,
};

use crate::common::{Flag, Gauge, GaugeGuard};

/// Per-connection relay between one client and the upstream queue.
///
/// A single `call` handles the whole life of one accepted connection:
/// it reads framed requests and hands each to the upstream queue
/// immediately (the next request is read before the previous response
/// returns), while a writer task sends responses back in whatever order
/// the upstream completes them. The connection is torn down only once
/// reading has stopped and every forwarded request has either been
/// written back or failed.
pub struct MuxCoreService<Q> {
    queue: Q,
    drain: Flag,
    max_frame: usize,
}

impl<Q> MuxCoreService<Q> {
    pub(crate) fn new(queue: Q, drain: Flag, max_frame: usize) -> Self {
        Self {
            queue,
            drain,
            max_frame,
        }
    }
}

/// A finished response travelling to the writer task. The guard keeps the
/// request accounted until the write itself completes.
struct Outgoing {
    packet: Packet,
    _inflight: GaugeGuard,
}

impl<Q> MuxCoreService<Q>
where
    Q: RequestQueue + 'static,
{
    async fn relay(&self, stream: AcceptedStream, peer: PeerAddr) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, PacketCodec::new(self.max_frame));
        let writer = FramedWrite::new(write_half, PacketCodec::new(self.max_frame));

        let (response_tx, response_rx) = mpsc::unbounded();
        // Flipped when a response write fails; cancels the armed read so
        // the connection is reaped instead of lingering until read EOF.
        let abort = Flag::new();
        let writer_task = monoio::spawn(write_responses(writer, response_rx, abort.clone()));

        let inflight = Gauge::new();
        loop {
            let packet = monoio::select! {
                _ = self.drain.wait() => break,
                _ = abort.wait() => break,
                decoded = reader.next() => match decoded {
                    Some(Ok(packet)) => packet,
                    Some(Err(e)) => {
                        warn!("closing connection {peer:?}: bad request frame: {e}");
                        break;
                    }
                    None => {
                        trace!("connection {peer:?} closed by peer");
                        break;
                    }
                },
            };

            // Drain may have been signalled while this packet was in flight;
            // no new request may be forwarded afterwards.
            if self.drain.is_set() {
                break;
            }

            let id = packet.id;
            let guard = inflight.add();
            let pending = match self.queue.enqueue(packet.body) {
                Ok(pending) => pending,
                Err(e) => {
                    drop(guard);
                    warn!("upstream refused request: {e}");
                    self.drain.set();
                    break;
                }
            };

            let response_tx = response_tx.clone();
            let drain = self.drain.clone();
            monoio::spawn(async move {
                match pending.await {
                    Some(body) => {
                        let _ = response_tx.unbounded_send(Outgoing {
                            packet: Packet::new(id, body),
                            _inflight: guard,
                        });
                    }
                    None => {
                        // The upstream failed this request: release it and
                        // put the dispatcher into drain.
                        drop(guard);
                        drain.set();
                    }
                }
            });
        }

        // Reading is over. The connection may only go away once every
        // forwarded request has been written back or failed.
        drop(response_tx);
        inflight.wait_zero().await;
        writer_task.await;
    }
}

async fn write_responses<W: AsyncWriteRent>(
    mut writer: FramedWrite<W, PacketCodec>,
    mut responses: mpsc::UnboundedReceiver<Outgoing>,
    abort: Flag,
) {
    use futures_util::StreamExt;

    while let Some(outgoing) = responses.next().await {
        if abort.is_set() {
            // Reap without writing; dropping the guard still retires the
            // request.
            continue;
        }
        if let Err(e) = writer.send_and_flush(outgoing.packet).await {
            warn!("response write failed, dropping connection: {e}");
            abort.set();
        }
    }
}

impl<Q> Service<(AcceptedStream, PeerAddr)> for MuxCoreService<Q>
where
    Q: RequestQueue + 'static,
{
    type Response = ();
    type Error = Infallible;

    async fn call(&self, (stream, peer): (AcceptedStream, PeerAddr)) -> Result<(), Infallible> {
        self.relay(stream, peer).await;
        Ok(())
    }
}
