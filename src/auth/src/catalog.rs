// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The in-memory grant catalog.
//!
//! A [`Catalog`] is an immutable snapshot of every grant row and known
//! database name for one listener. The loader builds a fresh catalog on
//! every pass and swaps it into the listener's [`SharedCatalog`]; the
//! authenticator reads whichever snapshot was current when its handshake
//! began.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::host::HostPattern;

/// Database access recorded for one grant row.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatabaseAccess {
    /// No database grant was recorded: deny any connection that names one.
    None,
    /// A global grant: any database is accepted.
    Any,
    /// An exact database name is required.
    Named(String),
}

impl DatabaseAccess {
    /// Whether this grant admits a connection naming `db` (empty when the
    /// client named none).
    fn admits(&self, db: &str) -> bool {
        if db.is_empty() {
            return true;
        }
        match self {
            DatabaseAccess::None => false,
            DatabaseAccess::Any => true,
            DatabaseAccess::Named(name) => name == db,
        }
    }

    fn is_named(&self) -> bool {
        matches!(self, DatabaseAccess::Named(_))
    }
}

/// One authorization record: who may connect, from where, to which database,
/// with which password.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantRow {
    pub user: String,
    pub host: HostPattern,
    pub database: DatabaseAccess,
    /// Hex double-SHA1 from `mysql.user`, without the 5.7-style leading `*`;
    /// empty for passwordless accounts.
    pub password_hash: String,
}

impl GrantRow {
    pub fn new(
        user: impl Into<String>,
        host: HostPattern,
        database: DatabaseAccess,
        password_hash: &str,
    ) -> GrantRow {
        let password_hash = password_hash
            .strip_prefix('*')
            .unwrap_or(password_hash)
            .to_string();
        GrantRow {
            user: user.into(),
            host,
            database,
            password_hash,
        }
    }
}

impl fmt::Display for GrantRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// An immutable snapshot of grant rows and database names.
#[derive(Clone, Debug, PartialEq)]
pub struct Catalog {
    rows: BTreeMap<String, Vec<GrantRow>>,
    databases: BTreeSet<String>,
    localhost_match_wildcard_host: bool,
    len: usize,
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog::new()
    }
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog {
            rows: BTreeMap::new(),
            databases: BTreeSet::new(),
            localhost_match_wildcard_host: true,
            len: 0,
        }
    }

    /// Insert one row, deduplicating on the full `(user, host, database)`
    /// key. Returns whether the row was new.
    pub fn insert(&mut self, row: GrantRow) -> bool {
        let rows = self.rows.entry(row.user.clone()).or_default();
        if rows
            .iter()
            .any(|r| r.host == row.host && r.database == row.database)
        {
            return false;
        }
        rows.push(row);
        self.len += 1;
        true
    }

    pub fn add_database(&mut self, name: impl Into<String>) {
        self.databases.insert(name.into());
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.contains(name)
    }

    /// Every database name returned by `SHOW DATABASES` at load time.
    pub fn databases(&self) -> impl Iterator<Item = &str> {
        self.databases.iter().map(String::as_str)
    }

    /// Number of grant rows.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether a literal `localhost` may match wildcard-host rows at session
    /// time. False when the backend carried an anonymous (empty) user.
    pub fn localhost_match_wildcard_host(&self) -> bool {
        self.localhost_match_wildcard_host
    }

    pub(crate) fn set_localhost_match_wildcard_host(&mut self, value: bool) {
        self.localhost_match_wildcard_host = value;
    }

    /// Every row, in user order, for persistence and diagnostics.
    pub fn dump(&self) -> impl Iterator<Item = &GrantRow> {
        self.rows.values().flatten()
    }

    /// Find the grant row governing `(user, client_ip, db)`.
    ///
    /// Numeric prefixes are tried first: the longest matching prefix wins,
    /// a database-specific row beats a global one on equal prefixes, and
    /// insertion order breaks what remains. Only when no numeric row admits
    /// the client are single-character wildcard patterns compared against
    /// the dotted client address, and hostname patterns against the
    /// caller-resolved `client_hostname` after that.
    pub fn lookup(
        &self,
        user: &str,
        client_ip: Ipv4Addr,
        db: &str,
        client_hostname: Option<&str>,
    ) -> Option<&GrantRow> {
        let rows = self.rows.get(user)?;
        let mut best: Option<(u8, bool, &GrantRow)> = None;
        for row in rows {
            let Some(bits) = row.host.prefix_match(client_ip) else {
                continue;
            };
            if !row.database.admits(db) {
                continue;
            }
            let rank = (bits, row.database.is_named());
            match &best {
                Some((bits, named, _)) if (*bits, *named) >= rank => {}
                _ => best = Some((rank.0, rank.1, row)),
            }
        }
        if let Some((_, _, row)) = best {
            return Some(row);
        }
        let client_addr = client_ip.to_string();
        if let Some(row) = rows
            .iter()
            .find(|r| r.host.single_char_match(&client_addr) && r.database.admits(db))
        {
            return Some(row);
        }
        if let Some(client_hostname) = client_hostname {
            if let Some(row) = rows
                .iter()
                .find(|r| r.host.hostname_match(client_hostname) && r.database.admits(db))
            {
                return Some(row);
            }
        }
        None
    }
}

/// The listener-scoped snapshot pointer.
///
/// Readers clone the [`Arc`] under the lock and then use the snapshot
/// lock-free; the loader swaps the pointer under the same lock. An old
/// snapshot stays valid for any in-flight handshake that still holds it.
#[derive(Debug, Default)]
pub struct SharedCatalog {
    inner: Mutex<Arc<Catalog>>,
}

impl SharedCatalog {
    pub fn new() -> SharedCatalog {
        SharedCatalog::default()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&self.inner.lock().expect("catalog snapshot lock poisoned"))
    }

    /// Swap in a freshly built catalog, returning its shared handle.
    pub fn replace(&self, next: Catalog) -> Arc<Catalog> {
        let next = Arc::new(next);
        let mut guard = self.inner.lock().expect("catalog snapshot lock poisoned");
        *guard = Arc::clone(&next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: &str, host: &str, database: DatabaseAccess, password_hash: &str) -> GrantRow {
        GrantRow::new(
            user,
            HostPattern::parse(host).unwrap(),
            database,
            password_hash,
        )
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn wildcard_host_without_database_grant() {
        let mut catalog = Catalog::new();
        catalog.insert(row("alice", "%", DatabaseAccess::None, "cafe"));
        // No database named: admitted.
        let matched = catalog.lookup("alice", ip("192.0.2.7"), "", None).unwrap();
        assert_eq!(matched.password_hash, "cafe");
        // Any named database: denied, the row has no database grant.
        assert!(catalog.lookup("alice", ip("192.0.2.7"), "sales", None).is_none());
    }

    #[test]
    fn class_c_host_with_required_database() {
        let mut catalog = Catalog::new();
        catalog.insert(row(
            "bob",
            "10.0.0.%",
            DatabaseAccess::Named("sales".into()),
            "beef",
        ));
        assert!(catalog.lookup("bob", ip("10.0.0.42"), "sales", None).is_some());
        assert!(catalog.lookup("bob", ip("10.0.0.42"), "marketing", None).is_none());
        assert!(catalog.lookup("bob", ip("10.1.0.42"), "sales", None).is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut catalog = Catalog::new();
        catalog.insert(row("u", "%", DatabaseAccess::Any, "00"));
        catalog.insert(row("u", "10.0.0.%", DatabaseAccess::Any, "24"));
        catalog.insert(row("u", "10.0.0.42", DatabaseAccess::Any, "32"));
        let pick = |addr: &str| {
            catalog
                .lookup("u", ip(addr), "", None)
                .unwrap()
                .password_hash
                .clone()
        };
        assert_eq!(pick("10.0.0.42"), "32");
        assert_eq!(pick("10.0.0.7"), "24");
        assert_eq!(pick("10.9.9.9"), "00");
    }

    #[test]
    fn specific_database_beats_global_on_equal_prefix() {
        let mut catalog = Catalog::new();
        catalog.insert(row("u", "10.0.0.%", DatabaseAccess::Any, "global"));
        catalog.insert(row(
            "u",
            "10.0.0.%",
            DatabaseAccess::Named("sales".into()),
            "specific",
        ));
        let matched = catalog.lookup("u", ip("10.0.0.5"), "sales", None).unwrap();
        assert_eq!(matched.password_hash, "specific");
    }

    #[test]
    fn single_char_wildcard_is_a_fallback() {
        let mut catalog = Catalog::new();
        catalog.insert(row("u", "192.168.1._", DatabaseAccess::Any, "wild"));
        catalog.insert(row("u", "192.168.1.5", DatabaseAccess::Any, "exact"));
        let exact = catalog.lookup("u", ip("192.168.1.5"), "", None).unwrap();
        assert_eq!(exact.password_hash, "exact");
        let wild = catalog.lookup("u", ip("192.168.1.7"), "", None).unwrap();
        assert_eq!(wild.password_hash, "wild");
        assert!(catalog.lookup("u", ip("192.168.1.42"), "", None).is_none());
    }

    #[test]
    fn hostname_rows_need_a_resolved_name() {
        let mut catalog = Catalog::new();
        catalog.insert(row("u", "app.internal", DatabaseAccess::Any, "host"));
        assert!(catalog.lookup("u", ip("10.9.9.9"), "", None).is_none());
        let matched = catalog
            .lookup("u", ip("10.9.9.9"), "", Some("app.internal"))
            .unwrap();
        assert_eq!(matched.password_hash, "host");
        assert!(catalog
            .lookup("u", ip("10.9.9.9"), "", Some("other.internal"))
            .is_none());
    }

    #[test]
    fn duplicate_rows_are_dropped() {
        let mut catalog = Catalog::new();
        assert!(catalog.insert(row("u", "%", DatabaseAccess::Any, "aa")));
        assert!(!catalog.insert(row("u", "%", DatabaseAccess::Any, "bb")));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn leading_star_is_stripped_from_password_hashes() {
        let r = row("u", "%", DatabaseAccess::Any, "*ABCD");
        assert_eq!(r.password_hash, "ABCD");
    }

    #[test]
    fn localhost_matches_wildcard_hosts_by_default() {
        let mut catalog = Catalog::new();
        assert!(catalog.localhost_match_wildcard_host());
        catalog.set_localhost_match_wildcard_host(false);
        assert!(!catalog.localhost_match_wildcard_host());
    }

    #[test]
    fn snapshots_are_stable_across_replacement() {
        let shared = SharedCatalog::new();
        let mut first = Catalog::new();
        first.insert(row("u", "%", DatabaseAccess::Any, "old"));
        shared.replace(first);

        let held = shared.snapshot();
        let mut second = Catalog::new();
        second.insert(row("u", "%", DatabaseAccess::Any, "new"));
        shared.replace(second);

        // The held snapshot still sees the old state; fresh readers the new.
        let old = held.lookup("u", ip("1.2.3.4"), "", None).unwrap();
        assert_eq!(old.password_hash, "old");
        let new = shared.snapshot();
        let new = new.lookup("u", ip("1.2.3.4"), "", None).unwrap();
        assert_eq!(new.password_hash, "new");
    }
}
