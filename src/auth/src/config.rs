// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Listener-scoped options for user loading and authentication.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOptions {
    /// Load the root user from the backends.
    pub enable_root: bool,
    /// Load users from every backend server instead of stopping at the
    /// first one that yields any.
    pub users_from_all: bool,
    /// Strip backslash escape characters from database names in grants.
    pub strip_db_esc: bool,
    /// Skip the SELECT-privilege sanity checks run before the first load.
    pub skip_permission_checks: bool,
    /// Retry unmatched clients against their reverse-DNS hostname. The
    /// lookup blocks the handshake for as long as the OS resolver allows.
    pub match_client_hostname: bool,
    /// File the catalog is persisted to across restarts.
    pub persist_path: Option<PathBuf>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            enable_root: false,
            users_from_all: false,
            strip_db_esc: true,
            skip_permission_checks: false,
            match_client_hostname: true,
            persist_path: None,
        }
    }
}
