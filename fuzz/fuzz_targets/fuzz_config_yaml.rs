// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use hcrt::RuntimeConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Whatever parses must also be a configuration a runtime accepts.
    if let Ok(cfg) = RuntimeConfig::from_yaml_str(text) {
        assert!(cfg.validate().is_ok());
    }
});
