// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Parsing and matching of MySQL host patterns.
//!
//! The `host` column of `mysql.user` admits several shapes: exact IPv4
//! addresses, trailing `%`-wildcarded octets (`10.0.0.%`), address/netmask
//! pairs (`10.1.0.0/255.255.0.0`), single-character `_` wildcards and
//! literal hostnames. [`HostPattern::parse`] canonicalizes each shape;
//! matching dispatches on the resulting variant.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HostPatternError {
    #[error("empty host pattern")]
    Empty,
    #[error("invalid address byte in host pattern '{0}'")]
    InvalidOctet(String),
    #[error("malformed host pattern '{0}'")]
    Malformed(String),
    #[error("unsupported netmask in host pattern '{0}'")]
    UnsupportedNetmask(String),
}

/// Canonical form of one `mysql.user` host pattern.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostPattern {
    /// `%`: every client address matches.
    Any,
    /// A numeric IPv4 prefix. `bits == 32` is an exact address; lower values
    /// come from trailing `%` octets or a netmask. The low `32 - bits` bits
    /// of `addr` are always zero.
    Prefix { addr: Ipv4Addr, bits: u8 },
    /// An address pattern with `_` single-character wildcards, kept
    /// verbatim. Never matches numerically.
    SingleChar(String),
    /// A literal hostname, compared against the client's reverse-DNS name.
    /// Never matches numerically.
    Hostname(String),
}

/// The bitmask selecting the top `bits` bits of an address.
pub(crate) fn prefix_mask(bits: u8) -> u32 {
    match bits {
        0 => 0,
        32 => u32::MAX,
        b => u32::MAX << (32 - b),
    }
}

fn is_address_shape(host: &str) -> bool {
    host.bytes()
        .all(|b| b.is_ascii_digit() || b == b'.' || b == b'_' || b == b'%')
}

/// Rewrite a `addr/mask` pair into wildcard form: octets masked by `255` are
/// kept, a `0` mask octet over a `0` address octet becomes `%`. Any other
/// combination, or mismatched octet counts, is unsupported.
fn merge_netmask(host: &str) -> Result<String, HostPatternError> {
    let Some((addr, mask)) = host.split_once('/') else {
        return Ok(host.to_string());
    };
    let addr_octets: Vec<&str> = addr.split('.').collect();
    let mask_octets: Vec<&str> = mask.split('.').collect();
    if addr_octets.len() != mask_octets.len() {
        return Err(HostPatternError::UnsupportedNetmask(host.to_string()));
    }
    let mut merged = Vec::with_capacity(addr_octets.len());
    for (a, m) in addr_octets.iter().zip(&mask_octets) {
        match *m {
            "255" => merged.push(*a),
            "0" if *a == "0" => merged.push("%"),
            _ => return Err(HostPatternError::UnsupportedNetmask(host.to_string())),
        }
    }
    Ok(merged.join("."))
}

impl HostPattern {
    /// Parse the `host` column of one `mysql.user` row.
    pub fn parse(input: &str) -> Result<HostPattern, HostPatternError> {
        if input.is_empty() {
            return Err(HostPatternError::Empty);
        }
        if input == "%" {
            return Ok(HostPattern::Any);
        }
        // An address shape with `_` wildcards (and no `%`: the combination
        // is invalid) keeps its literal pattern and must never match
        // through the numeric path.
        if is_address_shape(input) && input.contains('_') && !input.contains('%') {
            return Ok(HostPattern::SingleChar(input.to_string()));
        }
        let merged = merge_netmask(input)?;
        let tokens: Vec<&str> = merged.split('.').collect();
        // A token that is neither numeric nor `%` means this is not an
        // address at all; keep the literal for the hostname fallback.
        if tokens
            .iter()
            .any(|t| *t != "%" && !(!t.is_empty() && t.bytes().all(|b| b.is_ascii_digit())))
        {
            return Ok(HostPattern::Hostname(input.to_string()));
        }
        if tokens.len() > 4 {
            return Err(HostPatternError::Malformed(input.to_string()));
        }
        let mut octets = [0u8; 4];
        let mut bits: u8 = 0;
        let mut seen_wildcard = false;
        for (i, t) in tokens.iter().enumerate() {
            if *t == "%" {
                seen_wildcard = true;
            } else {
                let octet: u8 = t
                    .parse()
                    .map_err(|_| HostPatternError::InvalidOctet(input.to_string()))?;
                if !seen_wildcard {
                    octets[i] = octet;
                    bits += 8;
                }
            }
        }
        if !seen_wildcard {
            if tokens.len() != 4 {
                return Err(HostPatternError::Malformed(input.to_string()));
            }
            return Ok(HostPattern::Prefix {
                addr: Ipv4Addr::from(octets),
                bits: 32,
            });
        }
        if bits == 0 {
            return Ok(HostPattern::Any);
        }
        // Unnamed trailing octets are wildcards; the tail is already zero.
        Ok(HostPattern::Prefix {
            addr: Ipv4Addr::from(u32::from(Ipv4Addr::from(octets)) & prefix_mask(bits)),
            bits,
        })
    }

    /// Numeric prefix match: the prefix length, for ranking, when the client
    /// address falls inside the pattern's network.
    pub fn prefix_match(&self, client: Ipv4Addr) -> Option<u8> {
        match self {
            HostPattern::Any => Some(0),
            HostPattern::Prefix { addr, bits } => {
                (u32::from(client) & prefix_mask(*bits) == u32::from(*addr)).then_some(*bits)
            }
            HostPattern::SingleChar(_) | HostPattern::Hostname(_) => None,
        }
    }

    /// Byte-wise comparison of the client's dotted address against a `_`
    /// pattern. Both sides must be non-empty and the same length; `_`
    /// matches exactly one byte.
    pub fn single_char_match(&self, client_addr: &str) -> bool {
        let HostPattern::SingleChar(pattern) = self else {
            return false;
        };
        !client_addr.is_empty()
            && pattern.len() == client_addr.len()
            && pattern
                .bytes()
                .zip(client_addr.bytes())
                .all(|(p, c)| p == b'_' || p == c)
    }

    /// Compare a literal hostname pattern against the client's reverse-DNS
    /// name.
    pub fn hostname_match(&self, client_hostname: &str) -> bool {
        let HostPattern::Hostname(name) = self else {
            return false;
        };
        !client_hostname.is_empty() && name.eq_ignore_ascii_case(client_hostname)
    }

    /// The numeric form recorded on disk. Single-char wildcards record
    /// `0.0.0.0/0` so that numeric matching never admits them; hostnames
    /// record `0.0.0.0/32`, which no real client carries.
    pub fn numeric_form(&self) -> (Ipv4Addr, u8) {
        match self {
            HostPattern::Any => (Ipv4Addr::UNSPECIFIED, 0),
            HostPattern::Prefix { addr, bits } => (*addr, *bits),
            HostPattern::SingleChar(_) => (Ipv4Addr::UNSPECIFIED, 0),
            HostPattern::Hostname(_) => (Ipv4Addr::UNSPECIFIED, 32),
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Any => f.write_str("%"),
            HostPattern::Prefix { addr, bits } => {
                let o = addr.octets();
                match bits {
                    32 => write!(f, "{}", addr),
                    24 => write!(f, "{}.{}.{}.%", o[0], o[1], o[2]),
                    16 => write!(f, "{}.{}.%.%", o[0], o[1]),
                    8 => write!(f, "{}.%.%.%", o[0]),
                    // Prefix lengths that are not octet-aligned cannot be
                    // spelled as a MySQL pattern; they only arise from
                    // persisted files.
                    bits => write!(f, "{}/{}", addr, bits),
                }
            }
            HostPattern::SingleChar(s) | HostPattern::Hostname(s) => f.write_str(s),
        }
    }
}

impl FromStr for HostPattern {
    type Err = HostPatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HostPattern::parse(s)
    }
}
