// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-handshake authentication decision.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::catalog::Catalog;
use crate::password::{check_native_password, SHA1_DIGEST_LEN};

/// One client handshake to decide.
#[derive(Clone, Debug)]
pub struct AuthRequest<'a> {
    pub user: &'a str,
    pub client_ip: Ipv4Addr,
    /// Database named in the handshake; empty when the client named none.
    pub db: &'a str,
    /// The client's auth-token reply: 20 bytes, or empty when it sent none.
    pub token: &'a [u8],
    /// The scramble issued in the server greeting.
    pub scramble: &'a [u8],
}

/// Outcome of one handshake. Failures are values the proxy maps onto the
/// matching MySQL error packet, not errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authenticated; `password_sha1` is what the proxy replays in the
    /// backend handshake.
    Ok { password_sha1: [u8; SHA1_DIGEST_LEN] },
    /// A grant row matched but the token was wrong. `used_password` selects
    /// the `Using password: YES/NO` variant of the error message.
    BadPassword { used_password: bool },
    /// No grant row matched the user/address/database triple.
    UnknownUser,
    /// Credentials were fine but the named database does not exist.
    NoSuchDatabase,
}

/// Reverse DNS as consumed from the host. Implementations may block; the OS
/// resolver timeout is the only bound.
pub trait ReverseResolver: Send + Sync {
    /// The hostname for `addr`, or `None` when resolution fails.
    fn reverse_lookup(&self, addr: Ipv4Addr) -> Option<String>;
}

/// A resolver that never resolves, for hosts without hostname grants.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReverseResolver;

impl ReverseResolver for NoReverseResolver {
    fn reverse_lookup(&self, _addr: Ipv4Addr) -> Option<String> {
        None
    }
}

/// Decide one handshake against `catalog`.
///
/// The catalog is consulted by address first. Only when nothing matches and
/// `match_client_hostname` is set is the client's address resolved and the
/// lookup retried with the hostname; the resolution is a slow blocking call,
/// so it is strictly a last resort.
pub fn authenticate(
    catalog: &Catalog,
    request: &AuthRequest<'_>,
    resolver: &dyn ReverseResolver,
    match_client_hostname: bool,
) -> AuthOutcome {
    let mut row = catalog.lookup(request.user, request.client_ip, request.db, None);
    if row.is_none() && match_client_hostname {
        if let Some(hostname) = resolver.reverse_lookup(request.client_ip) {
            debug!(client = %request.client_ip, %hostname, "retrying lookup with client hostname");
            row = catalog.lookup(request.user, request.client_ip, request.db, Some(&hostname));
        }
    }
    let Some(row) = row else {
        return AuthOutcome::UnknownUser;
    };
    let (authenticated, password_sha1) =
        check_native_password(&row.password_hash, request.token, request.scramble);
    if !authenticated {
        return AuthOutcome::BadPassword {
            used_password: !request.token.is_empty(),
        };
    }
    if !request.db.is_empty() && !catalog.database_exists(request.db) {
        return AuthOutcome::NoSuchDatabase;
    }
    AuthOutcome::Ok { password_sha1 }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sha1::{Digest, Sha1};

    use super::*;
    use crate::catalog::{DatabaseAccess, GrantRow};
    use crate::host::HostPattern;

    struct TableResolver(BTreeMap<Ipv4Addr, String>);

    impl ReverseResolver for TableResolver {
        fn reverse_lookup(&self, addr: Ipv4Addr) -> Option<String> {
            self.0.get(&addr).cloned()
        }
    }

    fn sha1(bytes: &[u8]) -> [u8; 20] {
        Sha1::digest(bytes).into()
    }

    fn stored_hex(password: &[u8]) -> String {
        hex::encode(sha1(&sha1(password)))
    }

    fn client_token(password: &[u8], scramble: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(scramble);
        hasher.update(sha1(&sha1(password)));
        let mask: [u8; 20] = hasher.finalize().into();
        let mut token = sha1(password);
        for (t, m) in token.iter_mut().zip(&mask) {
            *t ^= m;
        }
        token
    }

    const SCRAMBLE: [u8; 20] = [7; 20];

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog.insert(GrantRow::new(
            "alice",
            HostPattern::Any,
            DatabaseAccess::None,
            &stored_hex(b"s3cret"),
        ));
        catalog.insert(GrantRow::new(
            "bob",
            HostPattern::parse("10.0.0.%").unwrap(),
            DatabaseAccess::Named("sales".into()),
            &stored_hex(b"pw"),
        ));
        catalog.insert(GrantRow::new(
            "carol",
            HostPattern::parse("app.internal").unwrap(),
            DatabaseAccess::Any,
            &stored_hex(b"hunter2"),
        ));
        catalog.insert(GrantRow::new(
            "nopass",
            HostPattern::Any,
            DatabaseAccess::Any,
            "",
        ));
        catalog.add_database("sales");
        catalog
    }

    fn no_resolver() -> NoReverseResolver {
        NoReverseResolver
    }

    #[test]
    fn authenticates_wildcard_host_user() {
        let catalog = catalog();
        let token = client_token(b"s3cret", &SCRAMBLE);
        let outcome = authenticate(
            &catalog,
            &AuthRequest {
                user: "alice",
                client_ip: ip("192.0.2.7"),
                db: "",
                token: &token,
                scramble: &SCRAMBLE,
            },
            &no_resolver(),
            true,
        );
        assert_eq!(
            outcome,
            AuthOutcome::Ok {
                password_sha1: sha1(b"s3cret")
            }
        );
    }

    #[test]
    fn reports_bad_password_with_token_flag() {
        let catalog = catalog();
        let mut token = client_token(b"s3cret", &SCRAMBLE);
        token[0] ^= 0xff;
        let request = AuthRequest {
            user: "alice",
            client_ip: ip("192.0.2.7"),
            db: "",
            token: &token,
            scramble: &SCRAMBLE,
        };
        assert_eq!(
            authenticate(&catalog, &request, &no_resolver(), true),
            AuthOutcome::BadPassword {
                used_password: true
            }
        );
        let request = AuthRequest {
            token: &[],
            ..request
        };
        assert_eq!(
            authenticate(&catalog, &request, &no_resolver(), true),
            AuthOutcome::BadPassword {
                used_password: false
            }
        );
    }

    #[test]
    fn reports_unknown_user_without_a_grant() {
        let catalog = catalog();
        let token = client_token(b"pw", &SCRAMBLE);
        // Wrong network for bob's class C grant.
        let outcome = authenticate(
            &catalog,
            &AuthRequest {
                user: "bob",
                client_ip: ip("10.1.0.42"),
                db: "sales",
                token: &token,
                scramble: &SCRAMBLE,
            },
            &no_resolver(),
            true,
        );
        assert_eq!(outcome, AuthOutcome::UnknownUser);
        // Database not covered by any grant.
        let outcome = authenticate(
            &catalog,
            &AuthRequest {
                user: "bob",
                client_ip: ip("10.0.0.42"),
                db: "marketing",
                token: &token,
                scramble: &SCRAMBLE,
            },
            &no_resolver(),
            true,
        );
        assert_eq!(outcome, AuthOutcome::UnknownUser);
    }

    #[test]
    fn reports_missing_databases_after_the_password() {
        let mut catalog = catalog();
        let token = client_token(b"pw", &SCRAMBLE);
        let request = AuthRequest {
            user: "bob",
            client_ip: ip("10.0.0.42"),
            db: "sales",
            token: &token,
            scramble: &SCRAMBLE,
        };
        assert!(matches!(
            authenticate(&catalog, &request, &no_resolver(), true),
            AuthOutcome::Ok { .. }
        ));
        // Same grant, but the database is gone from SHOW DATABASES.
        catalog = {
            let mut rebuilt = Catalog::new();
            for row in catalog.dump() {
                rebuilt.insert(row.clone());
            }
            rebuilt
        };
        assert_eq!(
            authenticate(&catalog, &request, &no_resolver(), true),
            AuthOutcome::NoSuchDatabase
        );
    }

    #[test]
    fn falls_back_to_the_client_hostname() {
        let catalog = catalog();
        let token = client_token(b"hunter2", &SCRAMBLE);
        let resolver = TableResolver(BTreeMap::from([(
            ip("10.9.9.9"),
            "app.internal".to_string(),
        )]));
        let request = AuthRequest {
            user: "carol",
            client_ip: ip("10.9.9.9"),
            db: "",
            token: &token,
            scramble: &SCRAMBLE,
        };
        assert!(matches!(
            authenticate(&catalog, &request, &resolver, true),
            AuthOutcome::Ok { .. }
        ));
        // The fallback is a config switch.
        assert_eq!(
            authenticate(&catalog, &request, &resolver, false),
            AuthOutcome::UnknownUser
        );
        // And an unresolvable client stays unknown.
        let request = AuthRequest {
            client_ip: ip("10.9.9.8"),
            ..request
        };
        assert_eq!(
            authenticate(&catalog, &request, &resolver, true),
            AuthOutcome::UnknownUser
        );
    }

    #[test]
    fn passwordless_accounts_accept_empty_tokens() {
        let catalog = catalog();
        let outcome = authenticate(
            &catalog,
            &AuthRequest {
                user: "nopass",
                client_ip: ip("192.0.2.1"),
                db: "",
                token: &[],
                scramble: &SCRAMBLE,
            },
            &no_resolver(),
            true,
        );
        assert_eq!(
            outcome,
            AuthOutcome::Ok {
                password_sha1: [0u8; 20]
            }
        );
    }
}
