// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Git fixtures shared by the integration tests.
//!
//! A "client" is a non-bare repository where commits are made with git2; its
//! objects are shipped to the server as a pack built with `PackBuilder`.

#![allow(dead_code)]

use git2::{Oid, Repository, Signature};
use localvc_core::domain::push::ObjectId;
use localvc_core::infrastructure::pkt_line::{self, Packet};
use std::path::Path;

pub const ZERO: &str = "0000000000000000000000000000000000000000";

pub fn client_repository(dir: &Path) -> Repository {
    Repository::init(dir).unwrap()
}

/// Commit `file` with `contents` on top of `parent` without touching any ref.
pub fn commit(repo: &Repository, parent: Option<Oid>, file: &str, contents: &str) -> Oid {
    let signature = Signature::now("Test Student", "student@example.org").unwrap();
    let blob = repo.blob(contents.as_bytes()).unwrap();

    let parent_commit = parent.map(|oid| repo.find_commit(oid).unwrap());
    let parent_tree = parent_commit.as_ref().map(|c| c.tree().unwrap());
    let mut builder = repo.treebuilder(parent_tree.as_ref()).unwrap();
    builder.insert(file, blob, 0o100644).unwrap();
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();

    let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
    repo.commit(None, &signature, &signature, &format!("update {}", file), &tree, &parents)
        .unwrap()
}

/// Pack with every object reachable from `tip` but not from `have`.
pub fn pack(repo: &Repository, tip: Oid, have: Option<Oid>) -> Vec<u8> {
    let mut walk = repo.revwalk().unwrap();
    walk.push(tip).unwrap();
    if let Some(have) = have {
        walk.hide(have).unwrap();
    }
    let mut builder = repo.packbuilder().unwrap();
    builder.insert_walk(&mut walk).unwrap();
    let mut buf = git2::Buf::new();
    builder.write_buf(&mut buf).unwrap();
    buf.to_vec()
}

/// Receive-pack request body: commands, flush, then the optional pack.
pub fn push_request(commands: &[(&str, &str, &str)], pack: Option<Vec<u8>>) -> Vec<u8> {
    let mut body = Vec::new();
    for (index, (old, new, ref_name)) in commands.iter().enumerate() {
        let line = if index == 0 {
            format!("{} {} {}\0report-status agent=git/2.45.0", old, new, ref_name)
        } else {
            format!("{} {} {}", old, new, ref_name)
        };
        pkt_line::write_pkt(&mut body, line.as_bytes()).unwrap();
    }
    pkt_line::write_flush(&mut body);
    if let Some(pack) = pack {
        body.extend(pack);
    }
    body
}

/// Text lines of a pkt-line stream, flush packets dropped.
pub async fn pkt_lines(mut data: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(packet) = pkt_line::read_pkt(&mut data).await.unwrap() {
        if let Packet::Data(data) = packet {
            lines.push(String::from_utf8_lossy(pkt_line::trim_line(&data)).into_owned());
        }
    }
    lines
}

pub fn ref_target(repo_path: &Path, ref_name: &str) -> Option<String> {
    let repo = Repository::open_bare(repo_path).unwrap();
    repo.refname_to_id(ref_name).ok().map(|oid| oid.to_string())
}

pub fn object_id(oid: Oid) -> ObjectId {
    ObjectId::parse(&oid.to_string()).unwrap()
}
