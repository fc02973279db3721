// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Upload-pack against a real bare repository, including a reader that goes
//! away mid-transfer. Requires a `git` binary on the PATH.

use git2::{Oid, Repository, Signature};
use localvc_core::infrastructure::pkt_line;
use localvc_core::infrastructure::ProtocolEngine;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

const BLOB_SIZE: usize = 2 * 1024 * 1024;

/// Bare repository whose only commit carries an incompressible blob.
fn large_repository(path: &Path) -> Oid {
    let repo = Repository::init_bare(path).unwrap();

    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut contents = Vec::with_capacity(BLOB_SIZE);
    while contents.len() < BLOB_SIZE {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        contents.extend_from_slice(&state.to_le_bytes());
    }

    let blob = repo.blob(&contents).unwrap();
    let mut builder = repo.treebuilder(None).unwrap();
    builder.insert("data.bin", blob, 0o100644).unwrap();
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    let signature = Signature::now("Test Student", "student@example.org").unwrap();
    repo.commit(Some("refs/heads/main"), &signature, &signature, "data", &tree, &[])
        .unwrap()
}

fn want(oid: Oid) -> Vec<u8> {
    let mut request = Vec::new();
    pkt_line::write_line(&mut request, &format!("want {}", oid)).unwrap();
    pkt_line::write_flush(&mut request);
    pkt_line::write_line(&mut request, "done").unwrap();
    request
}

#[tokio::test]
async fn test_upload_pack_streams_whole_pack() {
    let dir = tempfile::tempdir().unwrap();
    let tip = large_repository(dir.path());

    let mut output = Vec::new();
    ProtocolEngine::default()
        .upload_pack(dir.path(), &mut want(tip).as_slice(), &mut output, true)
        .await
        .unwrap();

    assert!(output.starts_with(b"0008NAK\n"));
    assert!(output.len() > BLOB_SIZE);
}

#[tokio::test]
async fn test_upload_pack_stops_when_reader_goes_away() {
    let dir = tempfile::tempdir().unwrap();
    let tip = large_repository(dir.path());
    let path = dir.path().to_path_buf();

    let (mut writer, mut reader) = tokio::io::duplex(16 * 1024);
    let task = tokio::spawn(async move {
        let request = want(tip);
        ProtocolEngine::default()
            .upload_pack(&path, &mut request.as_slice(), &mut writer, true)
            .await
    });

    let mut first = [0u8; 1024];
    let read = reader.read(&mut first).await.unwrap();
    assert!(read > 0);
    drop(reader);

    let result = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("upload-pack kept running without a reader")
        .unwrap();
    assert!(result.is_err());
}
