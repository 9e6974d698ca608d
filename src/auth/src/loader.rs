// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Loading users and grants from the backend servers.
//!
//! A load pass connects to each configured backend in turn, pulls the
//! contents of `mysql.user` joined with `mysql.db` and `mysql.tables_priv`
//! plus the output of `SHOW DATABASES`, and builds a fresh [`Catalog`] from
//! the result. Database-name wildcards in grants are expanded against the
//! known-database set here, at load time, so that the handshake path only
//! ever compares literals.

use std::sync::atomic::{AtomicBool, Ordering};

use mysql_async::prelude::Queryable;
use regex::RegexBuilder;
use tracing::{debug, error, warn};

use turnstile_mysql_util::{
    query_sys_var, server_error_code, timed, Config, MySqlConn, TimeoutConfig,
    ER_TABLEACCESS_DENIED_ERROR,
};

use crate::catalog::{Catalog, DatabaseAccess, GrantRow};
use crate::config::ServiceOptions;
use crate::error::{LoadError, ServerLoadError};
use crate::host::HostPattern;

/// Normal password column name.
const MYSQL_PASSWORD: &str = "password";

/// MySQL 5.7 password column name.
const MYSQL57_PASSWORD: &str = "authentication_string";

/// One `(user, host, db, select_priv, password)` row of the grant query.
type UserRow = (String, String, Option<String>, Option<String>, Option<String>);

/// What one load pass produced.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LoadSummary {
    /// The largest per-server user count.
    pub users: usize,
    /// False when any backend carried an anonymous (empty) user, in which
    /// case localhost must not match wildcard hosts at session time.
    pub localhost_match_wildcard_host: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct ServerLoad {
    users: usize,
    anonymous_seen: bool,
}

fn password_column(server_version: &str) -> &'static str {
    if server_version.contains("5.7.") {
        MYSQL57_PASSWORD
    } else {
        MYSQL_PASSWORD
    }
}

/// The grant query: a UNION of `mysql.user` joined with `mysql.db` and with
/// `mysql.tables_priv`. The password column was renamed in MySQL 5.7, so the
/// query is built against the reported server version.
fn users_query(server_version: &str, enable_root: bool) -> String {
    let password = password_column(server_version);
    let with_root = if enable_root {
        ""
    } else {
        "WHERE u.user NOT IN ('root')"
    };
    format!(
        "SELECT u.user, u.host, d.db, u.select_priv, u.{password} \
         FROM mysql.user AS u LEFT JOIN mysql.db AS d \
         ON (u.user=d.user AND u.host=d.host) {with_root} \
         UNION \
         SELECT u.user, u.host, t.db, u.select_priv, u.{password} \
         FROM mysql.user AS u LEFT JOIN mysql.tables_priv AS t \
         ON (u.user=t.user AND u.host=t.host) {with_root}"
    )
}

/// Expand a `%` database grant against the known-database set: `%` becomes
/// `.*` and the result is matched case-insensitively anywhere in the name,
/// one literal row per match.
fn expand_database_wildcard(grant: &str, catalog: &Catalog) -> Vec<String> {
    let mut pattern = String::with_capacity(grant.len() * 2);
    for c in grant.chars() {
        match c {
            '%' => pattern.push_str(".*"),
            c => pattern.push(c),
        }
    }
    let re = match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(re) => re,
        Err(err) => {
            error!("failed to compile regex when resolving wildcard database grant '{grant}': {err}");
            return Vec::new();
        }
    };
    catalog
        .databases()
        .filter(|db| re.is_match(db))
        .map(str::to_string)
        .collect()
}

/// Remove backslash escape characters from a grant's database name.
fn strip_escape_chars(db: &str) -> String {
    db.chars().filter(|c| *c != '\\').collect()
}

fn insert_row(
    catalog: &mut Catalog,
    user: &str,
    host: &HostPattern,
    database: DatabaseAccess,
    password: &str,
) -> usize {
    let row = GrantRow::new(user, host.clone(), database, password);
    let entry = row.to_string();
    if catalog.insert(row) {
        debug!("added user: {entry}");
        1
    } else {
        0
    }
}

/// Fold the grant-query rows of one server into the catalog. Returns `None`
/// when shutdown was requested mid-batch.
fn apply_user_rows(
    catalog: &mut Catalog,
    rows: Vec<UserRow>,
    options: &ServiceOptions,
    shutdown: &AtomicBool,
    address: &str,
) -> Option<ServerLoad> {
    let mut load = ServerLoad::default();
    for (user, host, db, select_priv, password) in rows {
        if shutdown.load(Ordering::SeqCst) {
            return None;
        }
        if user.is_empty() {
            // Empty username is used for the anonymous user. This means
            // that localhost does not match wildcard host.
            load.anonymous_seen = true;
        }
        let host_pattern = match HostPattern::parse(&host) {
            Ok(pattern) => pattern,
            Err(err) => {
                warn!(%address, %user, %host, "skipping grant row with malformed host: {err}");
                continue;
            }
        };
        let password = password.unwrap_or_default();
        let anydb = select_priv.as_deref() == Some("Y");
        let db = db.map(|db| {
            if options.strip_db_esc {
                strip_escape_chars(&db)
            } else {
                db
            }
        });
        load.users += match (anydb, db) {
            (true, _) => insert_row(catalog, &user, &host_pattern, DatabaseAccess::Any, &password),
            (false, None) => {
                insert_row(catalog, &user, &host_pattern, DatabaseAccess::None, &password)
            }
            (false, Some(db)) if db.contains('%') => {
                let mut inserted = 0;
                for name in expand_database_wildcard(&db, catalog) {
                    inserted += insert_row(
                        catalog,
                        &user,
                        &host_pattern,
                        DatabaseAccess::Named(name),
                        &password,
                    );
                }
                inserted
            }
            (false, Some(db)) => insert_row(
                catalog,
                &user,
                &host_pattern,
                DatabaseAccess::Named(db),
                &password,
            ),
        };
    }
    Some(load)
}

/// Probe the tables the service account must be able to read. A missing
/// SELECT on `mysql.user` is fatal for this server; on `mysql.db` or
/// `mysql.tables_priv` it only degrades database-name enforcement. Other
/// query failures are logged and treated as unverifiable, not broken.
async fn check_server_permissions(
    conn: &mut MySqlConn,
    server_version: &str,
    address: &str,
    timeouts: &TimeoutConfig,
) -> Result<(), ServerLoadError> {
    let query = format!(
        "SELECT user, host, {}, Select_priv FROM mysql.user LIMIT 1",
        password_column(server_version)
    );
    if let Err(err) = timed(timeouts.read_timeout, conn.query_drop(query)).await {
        if server_error_code(&err) == Some(ER_TABLEACCESS_DENIED_ERROR) {
            return Err(ServerLoadError::PermissionsMissing(format!(
                "service account is missing SELECT privileges on mysql.user: {err}"
            )));
        }
        error!(%address, "failed to query mysql.user when checking permissions: {err}");
    }
    for table in ["mysql.db", "mysql.tables_priv"] {
        let query = format!("SELECT user, host, db FROM {table} LIMIT 1");
        if let Err(err) = timed(timeouts.read_timeout, conn.query_drop(query)).await {
            if server_error_code(&err) == Some(ER_TABLEACCESS_DENIED_ERROR) {
                warn!(
                    %address,
                    "service account is missing SELECT privileges on {table}; \
                     database names will be ignored in authentication: {err}"
                );
            } else {
                error!(%address, "failed to query {table} when checking permissions: {err}");
            }
        }
    }
    Ok(())
}

/// Load users and databases from one backend into `catalog`. Returns
/// `Ok(None)` when shutdown was requested mid-batch.
async fn load_from_server(
    server: &Config,
    options: &ServiceOptions,
    shutdown: &AtomicBool,
    check_permissions: bool,
    catalog: &mut Catalog,
) -> Result<Option<ServerLoad>, ServerLoadError> {
    let address = server.address();
    let read_timeout = server.timeouts().read_timeout;
    let mut conn = server
        .connect("load users")
        .await
        .map_err(ServerLoadError::Unreachable)?;

    let server_version = query_sys_var(&mut conn, "version")
        .await
        .map_err(ServerLoadError::QueryFailed)?;
    debug!(%address, %server_version, "loading users");

    if check_permissions {
        check_server_permissions(&mut conn, &server_version, &address, server.timeouts()).await?;
    }

    let rows: Vec<UserRow> = timed(
        read_timeout,
        conn.query(users_query(&server_version, options.enable_root)),
    )
    .await
    .map_err(ServerLoadError::QueryFailed)?;

    let databases: Vec<String> = timed(read_timeout, conn.query("SHOW DATABASES"))
        .await
        .map_err(ServerLoadError::QueryFailed)?;

    if let Err(err) = conn.disconnect().await {
        debug!(%address, "error disconnecting after user load: {err}");
    }

    // Databases first: wildcard grants expand against them.
    for db in databases {
        catalog.add_database(db);
    }
    Ok(apply_user_rows(catalog, rows, options, shutdown, &address))
}

/// One full load pass over every configured backend.
///
/// Servers are tried in order. With `users_from_all` unset the pass stops at
/// the first server that yields users; otherwise rows from every server are
/// unioned and the largest per-server count is reported. The pass fails only
/// when no server yielded any users.
pub(crate) async fn load_all(
    servers: &[Config],
    options: &ServiceOptions,
    shutdown: &AtomicBool,
    check_permissions: bool,
) -> Result<(Catalog, LoadSummary), LoadError> {
    let mut catalog = Catalog::new();
    let mut errors = Vec::new();
    let mut users = 0usize;
    let mut anonymous_seen = false;

    for server in servers {
        if shutdown.load(Ordering::SeqCst) {
            return Err(LoadError::Cancelled);
        }
        match load_from_server(server, options, shutdown, check_permissions, &mut catalog).await {
            Ok(None) => return Err(LoadError::Cancelled),
            Ok(Some(load)) => {
                users = users.max(load.users);
                anonymous_seen |= load.anonymous_seen;
                if load.users > 0 && !options.users_from_all {
                    break;
                }
            }
            Err(err) => {
                warn!(server = %server.address(), "failed to load users: {err}");
                errors.push((server.address(), err));
            }
        }
    }

    if users == 0 {
        return Err(LoadError::NoBackendUsers(errors));
    }

    catalog.set_localhost_match_wildcard_host(!anonymous_seen);
    Ok((
        catalog,
        LoadSummary {
            users,
            localhost_match_wildcard_host: !anonymous_seen,
        },
    ))
}
