// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use mysql_async::{Conn, Opts, OptsBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::MySqlError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Socket timeouts applied to backend connections.
///
/// `mysql_async` only takes the keepalive through its options; the other
/// bounds are enforced around the individual driver calls (see
/// [`crate::timed`]).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            tcp_keepalive: Some(DEFAULT_TCP_KEEPALIVE),
        }
    }
}

impl TimeoutConfig {
    /// Apply relevant timeout configurations to a `mysql_async::OptsBuilder`.
    pub fn apply_to_opts(&self, mut opts_builder: OptsBuilder) -> Result<OptsBuilder, MySqlError> {
        if let Some(tcp_keepalive) = self.tcp_keepalive {
            opts_builder = opts_builder.tcp_keepalive(Some(
                u32::try_from(tcp_keepalive.as_millis()).map_err(|e| {
                    MySqlError::InvalidClientConfig(format!(
                        "invalid tcp_keepalive duration: {}",
                        e
                    ))
                })?,
            ));
        }
        Ok(opts_builder)
    }
}

/// A live MySQL connection.
///
/// This wrapper is intended to be used in place of `mysql_async::Conn` so
/// that callers go through [`Config::connect`] and inherit its timeouts.
#[derive(Debug)]
pub struct MySqlConn {
    conn: Conn,
}

impl Deref for MySqlConn {
    type Target = Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for MySqlConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl MySqlConn {
    pub async fn disconnect(self) -> Result<(), MySqlError> {
        self.conn.disconnect().await?;
        Ok(())
    }
}

/// Configuration for MySQL connections.
///
/// This wraps [`mysql_async::Opts`] to attach the socket timeouts every
/// connection to that server must respect.
#[derive(Clone, Debug)]
pub struct Config {
    inner: Opts,
    timeouts: TimeoutConfig,
}

impl Config {
    pub fn new(inner: Opts, timeouts: TimeoutConfig) -> Self {
        Self { inner, timeouts }
    }

    /// The `host:port` this configuration points at, for log and error
    /// messages.
    pub fn address(&self) -> String {
        format!("{}:{}", self.inner.ip_or_hostname(), self.inner.tcp_port())
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    pub async fn connect(&self, task_name: &str) -> Result<MySqlConn, MySqlError> {
        let address = format!(
            "mysql://{}@{}:{}",
            self.inner.user().unwrap_or("<unknown-user>"),
            self.inner.ip_or_hostname(),
            self.inner.tcp_port(),
        );
        info!(%task_name, %address, "connecting");
        match self.connect_internal().await {
            Ok(t) => {
                info!(%task_name, %address, "connected");
                Ok(t)
            }
            Err(e) => {
                warn!(%task_name, %address, "connection failed: {e:#}");
                Err(e)
            }
        }
    }

    async fn connect_internal(&self) -> Result<MySqlConn, MySqlError> {
        let opts_builder = self
            .timeouts
            .apply_to_opts(OptsBuilder::from_opts(self.inner.clone()))?;
        let conn =
            crate::timed(self.timeouts.connect_timeout, Conn::new(opts_builder)).await?;
        Ok(MySqlConn { conn })
    }
}
