//! Stream filters and connection setup hooks
//!
//! A relay is byte-oblivious: the only way to look at or rewrite traffic is
//! through a [`ByteFilter`], applied to each chunk right after it is read and
//! before it is forwarded. Filters are created per connection and per
//! direction by a [`FilterFactory`], so stateful filters never share state
//! across connections.
//!
//! A [`ConnectionSetupHook`] runs once on every freshly dialed upstream
//! connection, before any relayed byte is written to it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use tokio::net::TcpStream;

/// Transforms relayed bytes in flight
pub trait ByteFilter: Send {
    /// Rewrite `chunk` before it is forwarded.
    ///
    /// `chunk` holds exactly what one read returned and is never empty on
    /// entry. The filter may edit, truncate or extend it; whatever it holds
    /// afterwards is written out, and an empty chunk forwards nothing.
    fn filter(&mut self, chunk: &mut Vec<u8>);
}

impl<F> ByteFilter for F
where
    F: FnMut(&mut Vec<u8>) + Send,
{
    fn filter(&mut self, chunk: &mut Vec<u8>) {
        self(chunk)
    }
}

/// Builds a fresh [`ByteFilter`] for each relayed connection
pub trait FilterFactory: Send + Sync {
    fn new_filter(&self) -> Box<dyn ByteFilter>;
}

impl<F, B> FilterFactory for F
where
    F: Fn() -> B + Send + Sync,
    B: ByteFilter + 'static,
{
    fn new_filter(&self) -> Box<dyn ByteFilter> {
        Box::new(self())
    }
}

/// Future returned by [`ConnectionSetupHook::setup`]
pub type SetupFuture<'a> = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

/// Prepares an upstream connection before relaying starts
///
/// On failure the hook is responsible for closing `upstream`.
pub trait ConnectionSetupHook: Send + Sync {
    fn setup<'a>(&'a self, upstream: &'a mut TcpStream) -> SetupFuture<'a>;
}

/// Upper-cases ASCII letters, leaving every other byte untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiUppercase;

impl ByteFilter for AsciiUppercase {
    fn filter(&mut self, chunk: &mut Vec<u8>) {
        chunk.make_ascii_uppercase();
    }
}
