// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group identifier rules.

use crate::config::GROUP_ID_MAX_LEN;
use crate::error::{Error, Result};

/// Characters that may not appear in a group identifier.
const FORBIDDEN: &[u8] = b";\"`'\\";

/// Check a group identifier: 1 to 64 bytes of printable ASCII, without
/// quotes, backquotes, backslashes, or semicolons.
pub fn validate_group_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("group id is empty".into()));
    }
    if id.len() > GROUP_ID_MAX_LEN {
        return Err(Error::InvalidArgument(format!(
            "group id longer than {} bytes",
            GROUP_ID_MAX_LEN
        )));
    }
    match id
        .bytes()
        .find(|b| !(b' '..=b'~').contains(b) || FORBIDDEN.contains(b))
    {
        Some(bad) => Err(Error::InvalidArgument(format!(
            "group id {:?} contains invalid byte {:#04x}",
            id, bad
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        for id in ["g1", "daos_server", "a b", "x".repeat(64).as_str(), "~!@#$%^&*()"] {
            assert!(validate_group_id(id).is_ok(), "{:?} should be valid", id);
        }
    }

    #[test]
    fn test_invalid_ids() {
        let too_long = "x".repeat(65);
        for id in ["", too_long.as_str(), "a;b", "a\"b", "a`b", "a'b", "a\\b", "tab\t", "é"] {
            assert!(
                matches!(validate_group_id(id), Err(Error::InvalidArgument(_))),
                "{:?} should be rejected",
                id
            );
        }
    }
}
