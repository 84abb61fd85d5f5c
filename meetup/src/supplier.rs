//! Connection suppliers
//!
//! A supplier produces an ordered, never ending sequence of established
//! connections for one endpoint, either by accepting inbound connections or
//! by dialing out. Connections are handed over through a channel with room
//! for a single connection, and a supplier only goes looking for the next
//! connection once that slot is free.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::SupplyError;
use crate::{EndpointConfig, EndpointId, Graceful, Timeouts};

/// A ready to run connection supplier for one endpoint
#[derive(Debug)]
pub enum Supplier {
    /// Accepts inbound connections on an already bound socket
    Listener {
        endpoint: EndpointId,
        listener: TcpListener,
    },
    /// Dials `addr` forever, pausing after each failed attempt
    Dialer { endpoint: EndpointId, addr: String },
}

impl Supplier {
    /// Prepare a supplier. Listen endpoints bind their socket here so that an
    /// unusable address is reported before anything else starts.
    pub async fn bind(endpoint: EndpointId, config: &EndpointConfig) -> Result<Self, SupplyError> {
        match config {
            EndpointConfig::Listen(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .map_err(|source| SupplyError::Bind {
                        endpoint,
                        addr: addr.clone(),
                        source,
                    })?;
                let local = listener
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| addr.clone());
                tracing::info!("{endpoint}: listening on {local}");
                Ok(Supplier::Listener { endpoint, listener })
            }
            EndpointConfig::Connect(addr) => {
                tracing::info!("{endpoint}: connecting to {addr}");
                Ok(Supplier::Dialer {
                    endpoint,
                    addr: addr.clone(),
                })
            }
        }
    }

    /// The bound address of a listening supplier
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Supplier::Listener { listener, .. } => listener.local_addr().ok(),
            Supplier::Dialer { .. } => None,
        }
    }

    /// Run the supplier as a task and return the receiving end of its
    /// connection sequence. The sequence ends only on shutdown.
    pub fn spawn(self, timeouts: Timeouts, graceful: &Graceful) -> mpsc::Receiver<Connection> {
        let (tx, rx) = mpsc::channel(1);
        let g = graceful.clone();

        match self {
            Supplier::Listener { endpoint, listener } => {
                graceful.spawn(accept_loop(endpoint, listener, tx, g));
            }
            Supplier::Dialer { endpoint, addr } => {
                graceful.spawn(dial_loop(endpoint, addr, timeouts, tx, g));
            }
        }

        rx
    }
}

#[tracing::instrument(name = "listen", skip_all, fields(%endpoint))]
async fn accept_loop(
    endpoint: EndpointId,
    listener: TcpListener,
    tx: mpsc::Sender<Connection>,
    graceful: Graceful,
) {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    loop {
        let permit = tokio::select! {
            _ = graceful.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = graceful.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::info!("{endpoint}: accepted connection from {peer}");
                permit.send(Connection::new(stream, endpoint));
            }
            Err(e) => {
                tracing::warn!("listen: accept: {addr} {e}");
            }
        }
    }

    tracing::debug!("{endpoint}: stopped accepting on {addr}");
}

#[tracing::instrument(name = "connect", skip_all, fields(%endpoint, %addr))]
async fn dial_loop(
    endpoint: EndpointId,
    addr: String,
    timeouts: Timeouts,
    tx: mpsc::Sender<Connection>,
    graceful: Graceful,
) {
    loop {
        let permit = tokio::select! {
            _ = graceful.cancelled() => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some(stream) = dial(&addr, &timeouts, &graceful).await else {
            break;
        };

        match stream.peer_addr() {
            Ok(peer) => tracing::info!("{endpoint}: connected to {addr} ({peer})"),
            Err(_) => tracing::info!("{endpoint}: connected to {addr}"),
        }
        permit.send(Connection::new(stream, endpoint));
    }

    tracing::debug!("{endpoint}: stopped connecting to {addr}");
}

/// Keep trying to connect until it works. Returns `None` only on shutdown.
async fn dial(addr: &str, timeouts: &Timeouts, graceful: &Graceful) -> Option<TcpStream> {
    loop {
        let attempt = tokio::select! {
            _ = graceful.cancelled() => return None,
            attempt = tokio::time::timeout(timeouts.connect, TcpStream::connect(addr)) => attempt,
        };

        match attempt {
            Ok(Ok(stream)) => return Some(stream),
            Ok(Err(e)) => tracing::warn!("connect: {addr} {e}"),
            Err(_) => tracing::warn!("connect: {addr} timed out after {:?}", timeouts.connect),
        }

        tokio::select! {
            _ = graceful.cancelled() => return None,
            _ = tokio::time::sleep(timeouts.reconnect) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_listener_supplies_in_accept_order() {
        let graceful = Graceful::new();
        let supplier = Supplier::bind(EndpointId::One, &EndpointConfig::listen("127.0.0.1:0"))
            .await
            .unwrap();
        let addr = supplier.local_addr().unwrap();
        let mut rx = supplier.spawn(Timeouts::default(), &graceful);

        for tag in [b'a', b'b', b'c'] {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&[tag]).await.unwrap();

            let conn = rx.recv().await.unwrap();
            assert_eq!(conn.endpoint(), EndpointId::One);
            let (mut read, _write) = conn.into_split();
            let mut buf = [0u8; 1];
            read.read(&mut buf).await.unwrap();
            assert_eq!(buf[0], tag);
        }

        graceful.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let err = Supplier::bind(EndpointId::Two, &EndpointConfig::listen(addr.clone()))
            .await
            .unwrap_err();
        let SupplyError::Bind { endpoint, addr: failed, .. } = err;
        assert_eq!(endpoint, EndpointId::Two);
        assert_eq!(failed, addr);
    }

    #[tokio::test]
    async fn test_dialer_keeps_retrying_until_listener_appears() {
        // Grab a free port, then release it so the first attempts fail
        let addr = {
            let scratch = TcpListener::bind("127.0.0.1:0").await.unwrap();
            scratch.local_addr().unwrap()
        };

        let graceful = Graceful::new();
        let timeouts = Timeouts {
            connect: Duration::from_secs(1),
            reconnect: Duration::from_millis(100),
            ..Timeouts::default()
        };
        let supplier = Supplier::bind(EndpointId::Two, &EndpointConfig::connect(addr.to_string()))
            .await
            .unwrap();
        assert!(supplier.local_addr().is_none());
        let mut rx = supplier.spawn(timeouts, &graceful);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(rx.try_recv().is_err());

        let listener = TcpListener::bind(addr).await.unwrap();
        let conn = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("dialer should connect within one backoff interval")
            .unwrap();
        assert_eq!(conn.endpoint(), EndpointId::Two);
        assert_eq!(conn.peer_addr(), Some(addr));

        let (_server_side, _) = listener.accept().await.unwrap();
        graceful.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dialer_holds_at_most_one_pending_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let graceful = Graceful::new();
        let timeouts = Timeouts {
            connect: Duration::from_secs(1),
            reconnect: Duration::from_millis(50),
            ..Timeouts::default()
        };
        let supplier = Supplier::bind(EndpointId::One, &EndpointConfig::connect(addr.to_string()))
            .await
            .unwrap();
        let mut rx = supplier.spawn(timeouts, &graceful);

        let (_first, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("first connection should be dialed")
            .unwrap();

        // Nobody has taken the first connection, so no second one is made
        let second = tokio::time::timeout(Duration::from_millis(500), listener.accept()).await;
        assert!(second.is_err(), "dialed again while a connection was pending");

        let pending = rx.recv().await.unwrap();
        assert_eq!(pending.endpoint(), EndpointId::One);

        let (_next, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("taking the pending connection should free the slot")
            .unwrap();

        graceful.shutdown().await.unwrap();
    }
}
