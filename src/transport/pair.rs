//! Connection pairs: one accepted client bound to one dialed upstream

use super::pipe::{pipe, Direction, PairHandle};
use crate::filter::ByteFilter;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::task::TaskTracker;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};

/// Number of pairs whose copy loops are still running
#[derive(Debug, Clone, Default)]
pub struct ConnectionGauge {
    active: Arc<AtomicUsize>,
}

impl ConnectionGauge {
    pub fn get(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn enter(&self) -> GaugeGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        GaugeGuard {
            active: self.active.clone(),
        }
    }
}

struct GaugeGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bytes forwarded by a finished pair, after filtering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairTotals {
    /// Client to upstream
    pub request: u64,
    /// Upstream to client
    pub response: u64,
}

/// A client connection and its upstream connection, ready to relay
pub struct ConnectionPair {
    client: TcpStream,
    upstream: TcpStream,
    peer: SocketAddr,
    handle: PairHandle,
}

impl ConnectionPair {
    pub fn new(
        client: TcpStream,
        upstream: TcpStream,
        peer: SocketAddr,
        handle: PairHandle,
    ) -> Self {
        Self {
            client,
            upstream,
            peer,
            handle,
        }
    }

    /// Start both copy loops on `tracker` and return without waiting for them.
    ///
    /// The loops run concurrently in one task, each owning one read half and
    /// the opposite write half. The task resolves once both have stopped.
    pub fn spawn(
        self,
        tracker: &TaskTracker,
        gauge: &ConnectionGauge,
        request_filter: Option<Box<dyn ByteFilter>>,
        response_filter: Option<Box<dyn ByteFilter>>,
    ) -> JoinHandle<PairTotals> {
        let id = self.handle.id();
        let peer = self.peer;
        let span = info_span!("pair", id, peer = %peer);
        let guard = gauge.enter();

        let (client_read, client_write) = self.client.into_split();
        let (upstream_read, upstream_write) = self.upstream.into_split();

        let request = pipe(
            client_read,
            upstream_write,
            request_filter,
            self.handle.clone(),
            Direction::Request,
        );
        let response = pipe(
            upstream_read,
            client_write,
            response_filter,
            self.handle,
            Direction::Response,
        );

        debug!(pair = id, peer = %peer, "Relay started");

        tracker.spawn(
            async move {
                let (request, response) = tokio::join!(request, response);
                drop(guard);

                let totals = PairTotals {
                    request: request.forwarded,
                    response: response.forwarded,
                };
                info!(
                    request_bytes = totals.request,
                    response_bytes = totals.response,
                    "Relay finished ({}, {})",
                    request.end,
                    response.end
                );
                totals
            }
            .instrument(span),
        )
    }
}
