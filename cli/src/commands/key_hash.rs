// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `localvc key-hash`: the value to put under `public_key_hashes` in the directory.

use anyhow::{Context, Result};
use std::path::Path;

use localvc_core::application::public_key_hash;

pub fn run(file: &Path) -> Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read public key {}", file.display()))?;
    let canonical = canonical_key(&content)
        .with_context(|| format!("{} does not contain an OpenSSH public key", file.display()))?;

    println!("{}", public_key_hash(&canonical));
    Ok(())
}

/// `<algorithm> <base64>` with the comment dropped.
fn canonical_key(line: &str) -> Option<String> {
    let mut fields = line.split_whitespace();
    let algorithm = fields.next()?;
    let blob = fields.next()?;
    Some(format!("{} {}", algorithm, blob))
}
