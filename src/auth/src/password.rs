// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! MySQL native-password verification.
//!
//! The client's handshake reply is
//! `SHA1(password) XOR SHA1(scramble ‖ SHA1(SHA1(password)))`, and
//! `mysql.user` stores `SHA1(SHA1(password))`. Knowing the scramble and the
//! stored digest we can peel `SHA1(password)` out of the reply, hash it once
//! more and compare against the store. The recovered `SHA1(password)` is
//! also what the proxy needs to replay the handshake to a backend.

use sha1::{Digest, Sha1};

/// Length of a SHA1 digest, and so of every scramble and token.
pub const SHA1_DIGEST_LEN: usize = 20;

fn sha1_1(bytes: impl AsRef<[u8]>) -> [u8; SHA1_DIGEST_LEN] {
    Sha1::digest(bytes).into()
}

fn sha1_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; SHA1_DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    hasher.finalize().into()
}

fn xor(
    mut left: [u8; SHA1_DIGEST_LEN],
    right: &[u8; SHA1_DIGEST_LEN],
) -> [u8; SHA1_DIGEST_LEN] {
    for (l, r) in left.iter_mut().zip(right) {
        *l ^= r;
    }
    left
}

/// Verify a client's native-password reply against the stored double-SHA1.
///
/// `stored_hex` is the hex digest from `mysql.user` (empty for passwordless
/// accounts), `token` the client's 20-byte reply (empty when it sent none)
/// and `scramble` the nonce issued in the greeting. Returns the verdict
/// together with the recovered `SHA1(password)`.
pub fn check_native_password(
    stored_hex: &str,
    token: &[u8],
    scramble: &[u8],
) -> (bool, [u8; SHA1_DIGEST_LEN]) {
    let mut stored = [0u8; SHA1_DIGEST_LEN];
    if !stored_hex.is_empty() {
        match hex::decode(stored_hex) {
            Ok(bytes) if bytes.len() == SHA1_DIGEST_LEN => stored.copy_from_slice(&bytes),
            _ => return (false, [0u8; SHA1_DIGEST_LEN]),
        }
    }
    if token.is_empty() {
        // An empty reply is only good for an account with no password.
        return (stored_hex.is_empty(), [0u8; SHA1_DIGEST_LEN]);
    }
    if token.len() != SHA1_DIGEST_LEN {
        return (false, [0u8; SHA1_DIGEST_LEN]);
    }
    let step1 = sha1_2(scramble, stored);
    let mut password_sha1 = [0u8; SHA1_DIGEST_LEN];
    password_sha1.copy_from_slice(token);
    let password_sha1 = xor(password_sha1, &step1);
    let candidate = sha1_1(password_sha1);
    (candidate == stored, password_sha1)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn stored_hex(password: &[u8]) -> String {
        hex::encode(sha1_1(sha1_1(password)))
    }

    fn client_token(password: &[u8], scramble: &[u8]) -> [u8; SHA1_DIGEST_LEN] {
        xor(
            sha1_1(password),
            &sha1_2(scramble, sha1_1(sha1_1(password))),
        )
    }

    const SCRAMBLE: [u8; 20] = [
        0x4e, 0x52, 0x33, 0x48, 0x50, 0x3a, 0x71, 0x49, 0x59, 0x61, 0x5f, 0x39, 0x3d, 0x64,
        0x62, 0x3f, 0x53, 0x64, 0x7b, 0x60,
    ];

    #[test]
    fn accepts_correct_token() {
        let stored = stored_hex(b"s3cret");
        let token = client_token(b"s3cret", &SCRAMBLE);
        let (ok, password_sha1) = check_native_password(&stored, &token, &SCRAMBLE);
        assert!(ok);
        assert_eq!(password_sha1, sha1_1(b"s3cret"));
    }

    #[test]
    fn rejects_wrong_token() {
        let stored = stored_hex(b"s3cret");
        let mut token = client_token(b"s3cret", &SCRAMBLE);
        token[7] ^= 0xff;
        let (ok, _) = check_native_password(&stored, &token, &SCRAMBLE);
        assert!(!ok);
    }

    #[test]
    fn rejects_empty_token_for_account_with_password() {
        let stored = stored_hex(b"s3cret");
        let (ok, _) = check_native_password(&stored, &[], &SCRAMBLE);
        assert!(!ok);
    }

    #[test]
    fn accepts_passwordless_account() {
        let (ok, password_sha1) = check_native_password("", &[], &SCRAMBLE);
        assert!(ok);
        assert_eq!(password_sha1, [0u8; SHA1_DIGEST_LEN]);
    }

    #[test]
    fn rejects_token_of_wrong_length() {
        let stored = stored_hex(b"s3cret");
        let (ok, _) = check_native_password(&stored, &[0xab; 19], &SCRAMBLE);
        assert!(!ok);
    }

    #[test]
    fn rejects_malformed_stored_digest() {
        let token = client_token(b"s3cret", &SCRAMBLE);
        let (ok, _) = check_native_password("not hex at all", &token, &SCRAMBLE);
        assert!(!ok);
    }

    proptest! {
        #[test]
        fn recovers_password_sha1(password in any::<Vec<u8>>(), scramble in any::<[u8; 20]>()) {
            let stored = stored_hex(&password);
            let token = client_token(&password, &scramble);
            let (ok, password_sha1) = check_native_password(&stored, &token, &scramble);
            prop_assert!(ok);
            prop_assert_eq!(password_sha1, sha1_1(&password));
        }
    }
}
