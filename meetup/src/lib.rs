//! # meetup
//!
//! A micro proxy that connects two endpoints via TCP sockets. Either endpoint
//! may listen or connect.
//!
//! Example: a debugger extension on an application server wants to connect
//! back to your IDE on port 9000, but you are behind NAT.
//!
//! ```text
//! # on the application server
//! meetup -listen1=:9000 -listen2=:9001
//! # on your machine
//! meetup -connect1=appserver:9001 -connect2=localhost:9000
//! ```
//!
//! The first instance listens on two ports and, once a connection has arrived
//! on both, creates a bidirectional pipe between the two. The second instance
//! connects to the first one and to your local IDE and likewise pipes data in
//! both directions.
//!
//! A disconnect on one end of a pipe breaks the connection to the other end.
//! Connect mode retries forever, pausing between attempts.
//!
//! ## Library use
//!
//! ```rust,no_run
//! use meetup::{Config, EndpointConfig, Graceful, Meetup};
//!
//! # async fn example() -> eyre::Result<()> {
//! let config = Config::new(
//!     EndpointConfig::listen("127.0.0.1:9000"),
//!     EndpointConfig::connect("127.0.0.1:9001"),
//! );
//! let graceful = Graceful::new();
//! Meetup::bind(config).await?.run(&graceful).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
mod error;
mod graceful;
pub mod pairer;
pub mod pipe;
pub mod supplier;

use std::net::SocketAddr;

use eyre::WrapErr;

pub use config::{Args, Config, EndpointConfig, EndpointId, Timeouts, normalize_flag_args};
pub use connection::Connection;
pub use error::{ConfigError, PairError, PipeError, SupplyError};
pub use graceful::Graceful;
pub use pairer::Rendezvous;
pub use supplier::Supplier;

/// A proxy instance whose endpoints are ready to run
#[derive(Debug)]
pub struct Meetup {
    first: Supplier,
    second: Supplier,
    timeouts: Timeouts,
}

impl Meetup {
    /// Prepare both endpoints. Fails if a listen address cannot be bound.
    pub async fn bind(config: Config) -> eyre::Result<Self> {
        let first = Supplier::bind(EndpointId::One, &config.endpoint1)
            .await
            .wrap_err("cannot start endpoint 1")?;
        let second = Supplier::bind(EndpointId::Two, &config.endpoint2)
            .await
            .wrap_err("cannot start endpoint 2")?;

        Ok(Self {
            first,
            second,
            timeouts: config.timeouts,
        })
    }

    /// The bound address of a listening endpoint
    pub fn local_addr(&self, endpoint: EndpointId) -> Option<SocketAddr> {
        match endpoint {
            EndpointId::One => self.first.local_addr(),
            EndpointId::Two => self.second.local_addr(),
        }
    }

    /// Supply, pair and pipe connections until `graceful` is cancelled
    pub async fn run(self, graceful: &Graceful) -> eyre::Result<()> {
        let first = self.first.spawn(self.timeouts, graceful);
        let second = self.second.spawn(self.timeouts, graceful);

        pairer::run(Rendezvous::new(first, second), self.timeouts, graceful)
            .await
            .wrap_err("pairing stopped")
    }
}
