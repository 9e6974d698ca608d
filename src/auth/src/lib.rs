// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! User authentication catalog for a MySQL-compatible proxy.
//!
//! The proxy authenticates clients with the same credentials as its
//! backends, without forwarding each handshake: it keeps a periodically
//! refreshed snapshot of the backends' `mysql.user`, `mysql.db` and
//! `mysql.tables_priv` tables together with the known database names.
//!
//! [`AuthCatalog`] owns one listener's snapshot. The loader rebuilds it
//! from the backends ([`AuthCatalog::load`] / [`AuthCatalog::refresh`]),
//! every client handshake is decided against it
//! ([`AuthCatalog::authenticate`]), and it is carried across restarts
//! through a snapshot file ([`AuthCatalog::save`] /
//! [`AuthCatalog::load_from`]).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use turnstile_mysql_util::Config;

mod authenticator;
mod catalog;
mod config;
mod error;
mod host;
mod loader;
mod password;
mod persist;

pub use authenticator::{
    authenticate, AuthOutcome, AuthRequest, NoReverseResolver, ReverseResolver,
};
pub use catalog::{Catalog, DatabaseAccess, GrantRow, SharedCatalog};
pub use config::ServiceOptions;
pub use error::{LoadError, ServerLoadError};
pub use host::{HostPattern, HostPatternError};
pub use password::{check_native_password, SHA1_DIGEST_LEN};
pub use persist::PersistError;

/// One listener's authentication state: the configured backends, the
/// options, and the current catalog snapshot.
pub struct AuthCatalog {
    servers: Vec<Config>,
    options: ServiceOptions,
    snapshot: SharedCatalog,
    resolver: Box<dyn ReverseResolver>,
    shutdown: AtomicBool,
    permissions_checked: AtomicBool,
}

impl AuthCatalog {
    /// Create the catalog for one listener. `servers` are tried in order on
    /// every load pass.
    pub fn new(servers: Vec<Config>, options: ServiceOptions) -> AuthCatalog {
        AuthCatalog {
            servers,
            options,
            snapshot: SharedCatalog::new(),
            resolver: Box::new(NoReverseResolver),
            shutdown: AtomicBool::new(false),
            permissions_checked: AtomicBool::new(false),
        }
    }

    /// Use `resolver` for the hostname fallback on unmatched clients.
    pub fn with_resolver(mut self, resolver: Box<dyn ReverseResolver>) -> AuthCatalog {
        self.resolver = resolver;
        self
    }

    /// The current immutable snapshot. Handshakes in flight keep whichever
    /// snapshot they started with.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.snapshot.snapshot()
    }

    /// First load: restores a persisted snapshot when one exists (so the
    /// listener can authenticate before any backend answers), then runs a
    /// full load from the backends.
    pub async fn load(&self) -> Result<usize, LoadError> {
        if let Some(path) = &self.options.persist_path {
            if path.exists() {
                match self.load_from(path) {
                    Ok(users) => {
                        info!(%users, path = %path.display(), "restored persisted users")
                    }
                    Err(err) => {
                        warn!(path = %path.display(), "failed to restore persisted users: {err}")
                    }
                }
            }
        }
        self.reload().await
    }

    /// Full reload from the backends, swapping the snapshot on success. On
    /// failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<usize, LoadError> {
        self.reload().await
    }

    async fn reload(&self) -> Result<usize, LoadError> {
        // The permission sanity checks run once, before the first load.
        let check_permissions = !self.options.skip_permission_checks
            && !self.permissions_checked.swap(true, Ordering::SeqCst);
        let (catalog, summary) =
            loader::load_all(&self.servers, &self.options, &self.shutdown, check_permissions)
                .await?;
        let snapshot = self.snapshot.replace(catalog);
        info!(users = summary.users, "users catalog replaced");
        if let Some(path) = &self.options.persist_path {
            if let Err(err) = persist::save(&snapshot, path) {
                warn!(path = %path.display(), "failed to persist users: {err}");
            }
        }
        Ok(summary.users)
    }

    /// Decide one client handshake against the current snapshot.
    pub fn authenticate(&self, request: &AuthRequest<'_>) -> AuthOutcome {
        let snapshot = self.snapshot.snapshot();
        authenticator::authenticate(
            &snapshot,
            request,
            self.resolver.as_ref(),
            self.options.match_client_hostname,
        )
    }

    /// Serialize the current snapshot to `path`.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        persist::save(&self.snapshot.snapshot(), path)
    }

    /// Replace the snapshot with the contents of a file written by
    /// [`AuthCatalog::save`]. The in-memory snapshot is untouched on any
    /// error. Returns the number of rows restored.
    pub fn load_from(&self, path: &Path) -> Result<usize, PersistError> {
        let rows = persist::load(path)?;
        let mut catalog = Catalog::new();
        for row in rows {
            catalog.insert(row);
        }
        let users = catalog.len();
        self.snapshot.replace(catalog);
        Ok(users)
    }

    /// Ask an in-flight load to stop. A partially loaded batch is discarded
    /// rather than swapped in.
    pub fn initiate_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_with_no_backends_fails() {
        let catalog = AuthCatalog::new(vec![], ServiceOptions::default());
        let err = catalog.load().await.unwrap_err();
        assert!(matches!(err, LoadError::NoBackendUsers(ref errors) if errors.is_empty()));
    }

    #[tokio::test]
    async fn shutdown_cancels_a_load() {
        let opts = turnstile_mysql_util::TimeoutConfig::default();
        let server = Config::new(mysql_async::OptsBuilder::default().into(), opts);
        let catalog = AuthCatalog::new(vec![server], ServiceOptions::default());
        catalog.initiate_shutdown();
        let err = catalog.refresh().await.unwrap_err();
        assert!(matches!(err, LoadError::Cancelled));
    }

    #[tokio::test]
    async fn snapshots_survive_a_failed_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.snapshot");

        // Persist a catalog out of one instance...
        let source = AuthCatalog::new(vec![], ServiceOptions::default());
        {
            let mut seeded = Catalog::new();
            seeded.insert(GrantRow::new(
                "alice",
                HostPattern::Any,
                DatabaseAccess::Any,
                "abcd",
            ));
            source.snapshot.replace(seeded);
        }
        source.save(&path).unwrap();

        // ...restore it in another, and watch the backendless reload fail
        // without clobbering the restored snapshot.
        let restored = AuthCatalog::new(
            vec![],
            ServiceOptions {
                persist_path: Some(path),
                ..Default::default()
            },
        );
        assert!(restored.load().await.is_err());
        let snapshot = restored.snapshot();
        assert_eq!(snapshot.len(), 1);
        let row = snapshot
            .lookup("alice", "1.2.3.4".parse().unwrap(), "", None)
            .unwrap();
        assert_eq!(row.password_hash, "abcd");
    }
}
