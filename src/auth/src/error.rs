// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors surfaced by the loader.

use turnstile_mysql_util::MySqlError;

/// A failure scoped to one backend server during a load pass. The loader
/// logs these and moves on to the next server.
#[derive(Debug, thiserror::Error)]
pub enum ServerLoadError {
    /// Network/TLS/credential failure while contacting the server.
    #[error("backend unreachable: {0}")]
    Unreachable(#[source] MySqlError),
    /// The service account lacks a required SELECT grant.
    #[error("{0}")]
    PermissionsMissing(String),
    /// The grant query or SHOW DATABASES failed.
    #[error("query failed: {0}")]
    QueryFailed(#[source] MySqlError),
}

/// The aggregate outcome of a load pass that produced no usable catalog.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// No backend yielded any users; the per-server failures are attached.
    #[error("unable to load any users from the backends{}", format_server_errors(.0))]
    NoBackendUsers(Vec<(String, ServerLoadError)>),
    /// Shutdown was requested mid-pass; the partial batch was discarded.
    #[error("user load cancelled by shutdown")]
    Cancelled,
}

fn format_server_errors(errors: &[(String, ServerLoadError)]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let details: Vec<String> = errors
        .iter()
        .map(|(address, err)| format!("{}: {}", address, err))
        .collect();
    format!(": {}", details.join("; "))
}
