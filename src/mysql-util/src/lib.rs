// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! MySQL utility library.

use std::future::Future;
use std::time::Duration;

use mysql_async::prelude::Queryable;
use mysql_async::Conn;

mod config;
pub use config::{
    Config, MySqlConn, TimeoutConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
    DEFAULT_TCP_KEEPALIVE, DEFAULT_WRITE_TIMEOUT,
};

#[derive(Debug, thiserror::Error)]
pub enum MySqlError {
    #[error("invalid mysql client configuration: {0}")]
    InvalidClientConfig(String),
    #[error("request timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),
    /// Any other error we bail on.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
    /// A mysql_async error.
    #[error(transparent)]
    MySql(#[from] mysql_async::Error),
}

/// Access denied for the connecting account (bad credentials).
/// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html#error_er_access_denied_error
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;

/// SELECT denied on a table the account tried to read.
/// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html#error_er_tableaccess_denied_error
pub const ER_TABLEACCESS_DENIED_ERROR: u16 = 1142;

/// Returns the server-side error code carried by `err`, if it is one.
pub fn server_error_code(err: &MySqlError) -> Option<u16> {
    match err {
        MySqlError::MySql(mysql_async::Error::Server(e)) => Some(e.code),
        _ => None,
    }
}

/// Query a MySQL System Variable
pub async fn query_sys_var(conn: &mut Conn, name: &str) -> Result<String, MySqlError> {
    let value: Option<String> = conn.query_first(format!("SELECT @@{}", name)).await?;
    Ok(value.unwrap_or_default())
}

/// Bound a driver call by `limit`, mapping an overrun to
/// [`MySqlError::Timeout`].
pub async fn timed<T, F>(limit: Duration, fut: F) -> Result<T, MySqlError>
where
    F: Future<Output = Result<T, mysql_async::Error>>,
{
    Ok(tokio::time::timeout(limit, fut).await??)
}
