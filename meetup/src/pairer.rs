//! Rendezvous of the two connection sequences
//!
//! The pairer takes one connection from each supplier, in lock step, and
//! hands every pair to a freshly spawned pipe. Pairing is positional: the
//! n-th connection of endpoint 1 always meets the n-th connection of
//! endpoint 2, however their arrival times interleave.

use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::PairError;
use crate::{EndpointId, Graceful, Timeouts, pipe};

/// Lock step receiver over two ordered sequences
#[derive(Debug)]
pub struct Rendezvous<T> {
    first: mpsc::Receiver<T>,
    second: mpsc::Receiver<T>,
}

impl<T> Rendezvous<T> {
    pub fn new(first: mpsc::Receiver<T>, second: mpsc::Receiver<T>) -> Self {
        Self { first, second }
    }

    /// Wait, without any timeout, until both sides have produced their next
    /// item. Fails if either sequence has ended.
    pub async fn next_pair(&mut self) -> Result<(T, T), PairError> {
        let (first, second) = tokio::join!(self.first.recv(), self.second.recv());
        match (first, second) {
            (Some(first), Some(second)) => Ok((first, second)),
            (None, _) => Err(PairError::SupplierGone(EndpointId::One)),
            (_, None) => Err(PairError::SupplierGone(EndpointId::Two)),
        }
    }
}

/// Pair connections forever, spawning a pipe for each pair without waiting
/// for it. Returns `Ok` on shutdown.
#[tracing::instrument(name = "pairer", skip_all)]
pub async fn run(
    mut rendezvous: Rendezvous<Connection>,
    timeouts: Timeouts,
    graceful: &Graceful,
) -> Result<(), PairError> {
    let mut next_id: u64 = 0;

    loop {
        let (first, second) = tokio::select! {
            _ = graceful.cancelled() => {
                tracing::info!("Pairer shutting down");
                return Ok(());
            }
            pair = rendezvous.next_pair() => pair?,
        };

        next_id += 1;
        pipe::spawn(next_id, first, second, timeouts, graceful);
    }
}
