use std::{cell::Cell, rc::Rc};

use futures_util::future::select_all;
use monoio::io::stream::Stream;
use service_async::Service;
use tracing::{debug, error, info, warn};

use wiremux_core::{
    context::PeerAddr,
    listener::{AcceptedAddr, AcceptedStream, Listener},
    queue::RequestQueue,
};

use crate::common::{Flag, Gauge};

use super::{connection::MuxCoreService, MuxConfig};

/// Liveness observer handed to the supervisor.
///
/// The dispatcher is alive while the upstream has not failed, or while
/// connections are still draining after the failure. Once `is_alive`
/// reports false, shutdown is safe: no connection, read or write is
/// outstanding anywhere.
#[derive(Clone)]
pub struct Status {
    active: Gauge,
    failed: Flag,
}

impl Status {
    pub fn is_alive(&self) -> bool {
        !self.failed.is_set() || self.active.count() > 0
    }

    pub fn has_failed(&self) -> bool {
        self.failed.is_set()
    }

    pub fn active_connections(&self) -> usize {
        self.active.count()
    }
}

/// Accepts client connections on a fixed listener set and relays their
/// requests through one upstream queue.
pub struct Dispatcher<Q> {
    listeners: Vec<Listener>,
    svc: Rc<MuxCoreService<Q>>,
    active: Gauge,
    drain: Flag,
    max_connections: usize,
    conn_seq: Cell<u64>,
}

impl<Q> Dispatcher<Q>
where
    Q: RequestQueue + 'static,
{
    pub fn new(listeners: Vec<Listener>, queue: Q, config: MuxConfig) -> Self {
        assert!(
            !listeners.is_empty(),
            "dispatcher requires at least one listener"
        );
        assert!(
            config.max_connections > 0,
            "dispatcher requires a positive connection limit"
        );
        let drain = Flag::new();
        let svc = Rc::new(MuxCoreService::new(
            queue,
            drain.clone(),
            config.max_frame_size,
        ));
        Self {
            listeners,
            svc,
            active: Gauge::new(),
            drain,
            max_connections: config.max_connections,
            conn_seq: Cell::new(0),
        }
    }

    pub fn status(&self) -> Status {
        Status {
            active: self.active.clone(),
            failed: self.drain.clone(),
        }
    }

    /// Runs the dispatcher. Returns only after the upstream has failed and
    /// every client connection has drained; resources free on drop.
    pub async fn serve(mut self) {
        while !self.drain.is_set() {
            if self.active.count() >= self.max_connections {
                // Admission closed: accepts stay quiesced until a slot
                // frees or drain begins.
                monoio::select! {
                    _ = self.drain.wait() => break,
                    _ = self.active.wait_below(self.max_connections) => continue,
                }
            }
            if self.listeners.is_empty() {
                // Every listener died; only drain can end the dispatcher.
                self.drain.wait().await;
                break;
            }

            // Arm an accept on every listener; dropping the composite
            // future cancels them all at once.
            let accept = select_all(self.listeners.iter_mut().map(|l| Box::pin(l.next())));
            let (result, index) = monoio::select! {
                _ = self.drain.wait() => break,
                (result, index, _) = accept => (result, index),
            };
            match result {
                Some(Ok((stream, addr))) => self.admit(stream, addr),
                Some(Err(e)) => warn!("error accepting connection: {e}"),
                None => {
                    error!("listener terminated, dropping it");
                    self.listeners.swap_remove(index);
                }
            }
        }

        // Drain: nothing accepts and nothing reads; wait for in-flight
        // work to finish.
        self.active.wait_zero().await;
        info!("dispatcher drained");
    }

    fn admit(&self, stream: AcceptedStream, addr: AcceptedAddr) {
        let conn_id = self.conn_seq.get();
        self.conn_seq.set(conn_id + 1);
        debug!("connection {conn_id} admitted from {addr:?}");

        let guard = self.active.add();
        let svc = self.svc.clone();
        monoio::spawn(async move {
            let _active = guard;
            match svc.call((stream, PeerAddr::from(addr))).await {
                Ok(()) => debug!("connection {conn_id} complete"),
                Err(e) => error!("connection {conn_id} error: {e:?}"),
            }
        });
    }
}
