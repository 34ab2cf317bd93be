// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use hcrt::config::GROUP_ID_MAX_LEN;
use hcrt::group::validate_group_id;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(id) = std::str::from_utf8(data) else {
        return;
    };
    if validate_group_id(id).is_ok() {
        assert!(!id.is_empty() && id.len() <= GROUP_ID_MAX_LEN);
        assert!(id.bytes().all(|b| (b' '..=b'~').contains(&b)));
        assert!(!id.contains([';', '"', '`', '\'', '\\']));
    }
});
