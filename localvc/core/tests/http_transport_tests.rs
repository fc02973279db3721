// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Smart HTTP transport, driven through the axum router with `oneshot`.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::*;
use http_body_util::BodyExt;
use axum::extract::ConnectInfo;
use localvc_core::application::{
    AuthRateLimiter, BuildTrigger, PushPolicy, StandardAccessAuthorizer, StandardCredentialAuthenticator,
    TracingAccessLog,
};
use localvc_core::domain::build::{BuildJobRequest, BuildSubmitter, SchedulingRejection};
use localvc_core::domain::locator::RepositoryLocator;
use localvc_core::infrastructure::{FileDirectory, ProtocolEngine, RepositoryStore};
use localvc_core::presentation::{http, GitServices};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;
use url::Url;

// Passwords: ab12cde / secret123, prof / profpass1
const DIRECTORY: &str = r#"
users:
  - login: ab12cde
    password_sha256: fcf730b6d95236ecd3c9fc2d92d7b6b2bb061514961aec041d6c7a7192f592e4
    vcs_access_token_sha256: e29765eef04a42ae6ff435cdacf66ab04623b5a4821a06f0a897351bd626e55e
    vcs_access_token_expires: 2099-01-01T00:00:00Z
  - login: prof
    password_sha256: 57f07b3cc59738e09441d3aeef5ee17fab38820c79de103d2e51d59dc192e51d
courses:
  - short_name: eist24
    students: [ab12cde]
    instructors: [prof]
exercises:
  - project_key: PROG1
    course: eist24
    due_date: 2099-01-01T00:00:00Z
  - project_key: OFFLINE
    course: eist24
    allow_offline_ide: false
  - project_key: BRANCHY
    course: eist24
    allow_branching: true
    branch_regex: "feature/.*"
participations:
  - exercise: PROG1
    owner: template
  - exercise: PROG1
    owner: ab12cde
  - exercise: OFFLINE
    owner: ab12cde
  - exercise: BRANCHY
    owner: ab12cde
    vcs_access_tokens:
      ab12cde: 181cac0ab6fdd84dd6800950d9b09e7a8092c94c4c90a4d91d8c0db13b45cfb1
"#;

const USER_TOKEN: &str = "vcpat-Hq3wE7rT1yU5iO9pA2sD6fG0hJ4kL8zX3cV7bN1mQ5wE";
const BRANCHY_TOKEN: &str = "vcpat-Rt6yU0iO4pA8sD2fG6hJ0kL4zX8cV2bN6mQ0wE4rT8yU";

#[derive(Default)]
struct RecordingSubmitter {
    requests: Mutex<Vec<BuildJobRequest>>,
}

impl BuildSubmitter for RecordingSubmitter {
    fn submit(&self, request: BuildJobRequest) -> Result<(), SchedulingRejection> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

struct Server {
    root: TempDir,
    services: Arc<GitServices>,
    submitter: Arc<RecordingSubmitter>,
}

impl Server {
    fn new() -> Self {
        Self::with_limiter(AuthRateLimiter::unlimited())
    }

    fn with_limiter(auth_limiter: AuthRateLimiter) -> Self {
        let root = tempfile::tempdir().unwrap();
        let directory = Arc::new(FileDirectory::from_yaml_str(DIRECTORY).unwrap());
        let submitter = Arc::new(RecordingSubmitter::default());
        let services = Arc::new(GitServices {
            base_url: Url::parse("http://localhost:8080/git").unwrap(),
            store: RepositoryStore::new(root.path()),
            engine: ProtocolEngine::default(),
            authenticator: Arc::new(StandardCredentialAuthenticator::new(directory.clone())),
            authorizer: Arc::new(StandardAccessAuthorizer::new(directory.clone())),
            auth_limiter,
            access_log: Arc::new(TracingAccessLog),
            exercises: directory,
            policy: PushPolicy::new(),
            trigger: Arc::new(BuildTrigger::new(submitter.clone())),
        });
        Self {
            root,
            services,
            submitter,
        }
    }

    fn create(&self, path: &str) -> std::path::PathBuf {
        let locator = RepositoryLocator::from_path("/git", path).unwrap();
        self.services.store.create_bare(&locator).unwrap().path
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = http::router(self.services.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, headers, body)
    }
}

fn basic(login: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", login, password)))
}

fn info_refs(path: &str, service: &str, credentials: Option<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::get(format!("{}/info/refs?service={}", path, service));
    if let Some((login, password)) = credentials {
        builder = builder.header(header::AUTHORIZATION, basic(login, password));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_missing_credentials_challenge_with_basic() {
    let server = Server::new();
    let (status, headers, _) = server
        .send(info_refs("/git/PROG1/eist24/ab12cde.git", "git-upload-pack", None))
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers.get(header::WWW_AUTHENTICATE).unwrap(), "Basic");
}

#[tokio::test]
async fn test_wrong_password_is_unauthorized() {
    let server = Server::new();
    let (status, _, _) = server
        .send(info_refs("/git/PROG1/eist24/ab12cde.git", "git-upload-pack", Some(("ab12cde", "wrong-pw"))))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_path_is_bad_request() {
    let server = Server::new();
    let (status, _, _) = server
        .send(info_refs("/git/prog1/eist24/ab12cde.git", "git-upload-pack", Some(("ab12cde", "secret123"))))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_course_is_internal_error() {
    let server = Server::new();
    let (status, _, _) = server
        .send(info_refs("/git/PROG1/other24/ab12cde.git", "git-upload-pack", Some(("ab12cde", "secret123"))))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_offline_ide_disabled_forbids_every_role() {
    let server = Server::new();
    for credentials in [("ab12cde", "secret123"), ("prof", "profpass1")] {
        for service in ["git-upload-pack", "git-receive-pack"] {
            let (status, headers, _) = server
                .send(info_refs("/git/OFFLINE/eist24/ab12cde.git", service, Some(credentials)))
                .await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{} {}", credentials.0, service);
            assert_eq!(headers.get(header::WWW_AUTHENTICATE).unwrap(), "Basic");
        }
    }
}

#[tokio::test]
async fn test_student_cannot_push_to_template() {
    let server = Server::new();
    server.create("/git/PROG1/eist24/exercise.git");
    let (status, _, _) = server
        .send(info_refs("/git/PROG1/eist24/exercise.git", "git-receive-pack", Some(("ab12cde", "secret123"))))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_receive_pack_rpc_is_authorized_on_its_own() {
    let server = Server::new();
    let path = server.create("/git/PROG1/eist24/exercise.git");

    let client_dir = tempfile::tempdir().unwrap();
    let client = client_repository(client_dir.path());
    let first = commit(&client, None, "Main.java", "class Main {}");
    let body = push_request(&[(ZERO, &first.to_string(), "refs/heads/main")], Some(pack(&client, first, None)));

    // Skipping the advertisement does not skip the permission check.
    let (status, _, _) = server
        .send(receive_pack_to("/git/PROG1/eist24/exercise.git", ("ab12cde", "secret123"), body))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(ref_target(&path, "refs/heads/main"), None);
}

#[tokio::test]
async fn test_receive_pack_advertisement() {
    let server = Server::new();
    server.create("/git/PROG1/eist24/ab12cde.git");
    let (status, headers, body) = server
        .send(info_refs("/git/PROG1/eist24/ab12cde.git", "git-receive-pack", Some(("ab12cde", "secret123"))))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/x-git-receive-pack-advertisement"
    );
    assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-cache, max-age=0, must-revalidate");
    assert!(body.starts_with(b"001f# service=git-receive-pack\n0000"));
    assert!(String::from_utf8_lossy(&body).contains("report-status"));
}

#[tokio::test]
async fn test_missing_repository_is_not_found() {
    let server = Server::new();
    let (status, _, _) = server
        .send(info_refs("/git/PROG1/eist24/ab12cde.git", "git-upload-pack", Some(("ab12cde", "secret123"))))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_push_over_http_triggers_build() {
    let server = Server::new();
    let repo_path = server.create("/git/PROG1/eist24/ab12cde.git");

    let client_dir = tempfile::tempdir().unwrap();
    let client = client_repository(client_dir.path());
    let first = commit(&client, None, "Main.java", "class Main {}");

    let create = push_request(&[(ZERO, &first.to_string(), "refs/heads/main")], Some(pack(&client, first, None)));
    let (status, headers, body) = server.send(receive_pack_request(create)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/x-git-receive-pack-result");
    assert_eq!(pkt_lines(&body).await, vec!["unpack ok", "ok refs/heads/main"]);
    // Branch creation never builds.
    assert!(server.submitter.requests.lock().unwrap().is_empty());

    let second = commit(&client, Some(first), "Main.java", "class Main { int x; }");
    let update = push_request(
        &[(&first.to_string(), &second.to_string(), "refs/heads/main")],
        Some(pack(&client, second, Some(first))),
    );
    let (status, _, body) = server.send(receive_pack_request(update)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pkt_lines(&body).await, vec!["unpack ok", "ok refs/heads/main"]);
    assert_eq!(ref_target(&repo_path, "refs/heads/main"), Some(second.to_string()));

    let requests = server.submitter.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].commit_hash, object_id(second));
    assert!(requests[0].repository.path.starts_with(server.root.path()));
}

#[tokio::test]
async fn test_upload_pack_advertisement_streams_refs() {
    let server = Server::new();
    server.create("/git/PROG1/eist24/ab12cde.git");
    let (status, headers, body) = server
        .send(info_refs("/git/PROG1/eist24/ab12cde.git", "git-upload-pack", Some(("ab12cde", "secret123"))))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/x-git-upload-pack-advertisement"
    );
    assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
}

#[tokio::test]
async fn test_health_needs_no_credentials() {
    let server = Server::new();
    let request = Request::get("/health").body(Body::empty()).unwrap();
    let (status, _, body) = server.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("healthy"));
}

fn receive_pack_request(body: Vec<u8>) -> Request<Body> {
    receive_pack_to("/git/PROG1/eist24/ab12cde.git", ("ab12cde", "secret123"), body)
}

fn receive_pack_to(path: &str, (login, password): (&str, &str), body: Vec<u8>) -> Request<Body> {
    Request::post(format!("{}/git-receive-pack", path))
        .header(header::AUTHORIZATION, basic(login, password))
        .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_user_access_token_in_place_of_password() {
    let server = Server::new();
    server.create("/git/PROG1/eist24/ab12cde.git");

    let (status, _, _) = server
        .send(info_refs("/git/PROG1/eist24/ab12cde.git", "git-upload-pack", Some(("ab12cde", USER_TOKEN))))
        .await;
    assert_eq!(status, StatusCode::OK);

    // Someone else's token is just a wrong password.
    let (status, _, _) = server
        .send(info_refs("/git/PROG1/eist24/ab12cde.git", "git-upload-pack", Some(("prof", USER_TOKEN))))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_participation_token_only_opens_its_repository() {
    let server = Server::new();
    server.create("/git/BRANCHY/eist24/ab12cde.git");
    server.create("/git/PROG1/eist24/ab12cde.git");

    let (status, _, _) = server
        .send(info_refs("/git/BRANCHY/eist24/ab12cde.git", "git-receive-pack", Some(("ab12cde", BRANCHY_TOKEN))))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, _) = server
        .send(info_refs("/git/PROG1/eist24/ab12cde.git", "git-upload-pack", Some(("ab12cde", BRANCHY_TOKEN))))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers.get(header::WWW_AUTHENTICATE).unwrap(), "Basic");
}

#[tokio::test]
async fn test_branch_creation_follows_exercise_pattern() {
    let server = Server::new();
    let path = "/git/BRANCHY/eist24/ab12cde.git";
    let repo_path = server.create(path);

    let client_dir = tempfile::tempdir().unwrap();
    let client = client_repository(client_dir.path());
    let first = commit(&client, None, "Main.java", "class Main {}");
    let head = first.to_string();

    for (branch, expected) in [
        ("refs/heads/main", "ok refs/heads/main"),
        ("refs/heads/feature/parser", "ok refs/heads/feature/parser"),
        ("refs/heads/topic", "ng refs/heads/topic branch name not allowed"),
        ("refs/heads/my-feature/x", "ng refs/heads/my-feature/x branch name not allowed"),
    ] {
        let body = push_request(&[(ZERO, &head, branch)], Some(pack(&client, first, None)));
        let (status, _, body) = server
            .send(receive_pack_to(path, ("ab12cde", "secret123"), body))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pkt_lines(&body).await, vec!["unpack ok", expected]);
    }
    assert_eq!(ref_target(&repo_path, "refs/heads/feature/parser"), Some(head));
    assert_eq!(ref_target(&repo_path, "refs/heads/topic"), None);
}

#[tokio::test]
async fn test_repeated_attempts_are_rate_limited_per_client() {
    let server = Server::with_limiter(AuthRateLimiter::per_minute(2));
    let request = |address: &str| {
        let mut request = info_refs("/git/PROG1/eist24/ab12cde.git", "git-upload-pack", Some(("ab12cde", "wrong-pw")));
        request
            .extensions_mut()
            .insert(ConnectInfo(address.parse::<SocketAddr>().unwrap()));
        request
    };

    for _ in 0..2 {
        let (status, _, _) = server.send(request("10.0.0.1:50000")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, _, _) = server.send(request("10.0.0.1:50001")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, _, _) = server.send(request("10.0.0.2:50000")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
