// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Credential Authenticator
//!
//! Turns transport credentials into an [`Identity`]:
//! - HTTP: `Authorization: Basic` header. The password is tried, in order, as
//!   the build agent secret, a VCS access token (`vcpat-` prefix, user token
//!   first, then participation tokens) and finally a directory password.
//! - SSH: public key, looked up by the SHA-256 digest of its canonical form
//!
//! A participation token only proves the identity; the authorizer still checks
//! that the addressed repository is the token's participation.
//!
//! Every failure is reported as [`GitAccessError::Authentication`]; the
//! distinction between "wrong password" and "unknown user" never leaves
//! this module except through logs.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::domain::access::GitAccessError;
use crate::domain::directory::{AccessTokenScope, DirectoryError, UserDirectory};
use crate::domain::identity::{CredentialProof, Identity};
use crate::domain::locator::is_valid_login;

pub const MAX_LOGIN_LENGTH: usize = 50;
pub const MAX_PASSWORD_LENGTH: usize = 100;
pub const TOKEN_PREFIX: &str = "vcpat-";
pub const ACCESS_TOKEN_LENGTH: usize = 50;

/// SHA-256 hex digest of a canonical `<algorithm> <base64 blob>` key string.
pub fn public_key_hash(canonical_key: &str) -> String {
    hex::encode(Sha256::digest(canonical_key.trim().as_bytes()))
}

#[async_trait]
pub trait CredentialAuthenticator: Send + Sync {
    /// Authenticate the raw value of an HTTP `Authorization` header.
    async fn authenticate_basic(&self, authorization: Option<&str>) -> Result<Identity, GitAccessError>;

    /// Authenticate an SSH public key given in canonical `<algorithm> <base64>` form.
    async fn authenticate_public_key(&self, ssh_user: &str, canonical_key: &str) -> Result<Identity, GitAccessError>;
}

/// Shared credentials build containers use to fetch repositories.
#[derive(Debug, Clone)]
pub struct BuildAgentCredentials {
    pub login: String,
    pub password_sha256: String,
}

impl BuildAgentCredentials {
    fn matches(&self, login: &str, password: &str) -> bool {
        let presented = hex::encode(Sha256::digest(password.as_bytes()));
        let stored = self.password_sha256.to_ascii_lowercase();
        login == self.login && bool::from(presented.as_bytes().ct_eq(stored.as_bytes()))
    }
}

pub struct StandardCredentialAuthenticator {
    users: Arc<dyn UserDirectory>,
    build_agent: Option<BuildAgentCredentials>,
}

impl StandardCredentialAuthenticator {
    pub fn new(users: Arc<dyn UserDirectory>) -> Self {
        Self {
            users,
            build_agent: None,
        }
    }

    pub fn with_build_agent(mut self, credentials: BuildAgentCredentials) -> Self {
        self.build_agent = Some(credentials);
        self
    }

    async fn authenticate_token(&self, login: &str, token: &str) -> Result<Option<Identity>, GitAccessError> {
        let scope = self.users.verify_access_token(login, token).await.map_err(lookup_failure)?;
        Ok(scope.map(|scope| {
            let proof = match scope {
                AccessTokenScope::User => CredentialProof::UserToken,
                AccessTokenScope::Participation(participation) => CredentialProof::ParticipationToken(participation),
            };
            Identity {
                login: login.to_string(),
                proof,
            }
        }))
    }
}

fn is_access_token(password: &str) -> bool {
    password.starts_with(TOKEN_PREFIX) && password.len() == ACCESS_TOKEN_LENGTH
}

/// Split a Basic header into login and password. Does not check the format.
fn decode_basic(header: &str) -> Result<(String, String), GitAccessError> {
    let (scheme, encoded) = header
        .trim()
        .split_once(' ')
        .ok_or_else(|| GitAccessError::Authentication("malformed Authorization header".to_string()))?;
    if scheme != "Basic" {
        return Err(GitAccessError::Authentication(format!(
            "unsupported authorization scheme '{}'",
            scheme
        )));
    }

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| GitAccessError::Authentication("credentials are not valid base64".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| GitAccessError::Authentication("credentials are not valid UTF-8".to_string()))?;

    let (login, password) = decoded
        .split_once(':')
        .ok_or_else(|| GitAccessError::Authentication("credentials lack a ':' separator".to_string()))?;
    Ok((login.to_string(), password.to_string()))
}

fn check_credential_format(login: &str, password: &str) -> Result<(), GitAccessError> {
    if login.is_empty() || login.len() > MAX_LOGIN_LENGTH || !is_valid_login(login) {
        return Err(GitAccessError::Authentication("malformed login".to_string()));
    }
    let password_length = password.chars().count();
    if password_length == 0 || password_length > MAX_PASSWORD_LENGTH {
        return Err(GitAccessError::Authentication("malformed password".to_string()));
    }
    Ok(())
}

fn lookup_failure(err: DirectoryError) -> GitAccessError {
    match err {
        DirectoryError::Unexpected(msg) => GitAccessError::Internal(msg),
        DirectoryError::NotFound(msg) | DirectoryError::Forbidden(msg) => GitAccessError::Authentication(msg),
    }
}

#[async_trait]
impl CredentialAuthenticator for StandardCredentialAuthenticator {
    async fn authenticate_basic(&self, authorization: Option<&str>) -> Result<Identity, GitAccessError> {
        let header = authorization
            .ok_or_else(|| GitAccessError::Authentication("missing Authorization header".to_string()))?;
        let (login, password) = decode_basic(header)?;
        check_credential_format(&login, &password)?;

        if self.build_agent.as_ref().is_some_and(|agent| agent.matches(&login, &password)) {
            debug!("Authenticated build agent '{}'", login);
            return Ok(Identity::build_agent(login));
        }

        if is_access_token(&password) {
            if let Some(identity) = self.authenticate_token(&login, &password).await? {
                debug!("Authenticated '{}' via {}", identity.login, identity.proof.mechanism());
                return Ok(identity);
            }
            debug!("No access token of '{}' matched, trying it as a password", login);
        }

        let verified = self.users.verify_password(&login, &password).await.map_err(lookup_failure)?;
        if !verified {
            warn!("Password check failed for user '{}'", login);
            return Err(GitAccessError::Authentication(format!("invalid credentials for '{}'", login)));
        }

        let user = self.users.find_user_by_login(&login).await.map_err(lookup_failure)?;
        debug!("Authenticated '{}' via HTTP Basic", user.login);
        Ok(Identity::with_password(user.login))
    }

    async fn authenticate_public_key(&self, ssh_user: &str, canonical_key: &str) -> Result<Identity, GitAccessError> {
        let key_hash = public_key_hash(canonical_key);
        let user = self.users.find_user_by_key_hash(&key_hash).await.map_err(|e| {
            warn!("No user for public key {} (ssh user '{}'): {}", key_hash, ssh_user, e);
            lookup_failure(e)
        })?;
        debug!("Authenticated '{}' via public key {}", user.login, key_hash);
        Ok(Identity::with_public_key(user.login, key_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::directory::User;
    use std::sync::Mutex;

    // Records which directory calls were made, in order.
    struct MockUserDirectory {
        password: &'static str,
        known_user: bool,
        key_hash: String,
        calls: Mutex<Vec<&'static str>>,
    }

    impl MockUserDirectory {
        fn new(password: &'static str, known_user: bool) -> Self {
            Self {
                password,
                known_user,
                key_hash: public_key_hash("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExample"),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    const TOKEN: &str = "vcpat-Lw4nQ8rT2vX6zB0dF3hJ7kM1pS5uY9aC2eG6iK0oR4tW";

    #[async_trait]
    impl UserDirectory for MockUserDirectory {
        async fn verify_password(&self, _login: &str, password: &str) -> Result<bool, DirectoryError> {
            self.calls.lock().unwrap().push("verify_password");
            Ok(password == self.password)
        }

        async fn verify_access_token(&self, _login: &str, token: &str) -> Result<Option<AccessTokenScope>, DirectoryError> {
            self.calls.lock().unwrap().push("verify_access_token");
            Ok((token == TOKEN).then_some(AccessTokenScope::User))
        }

        async fn find_user_by_login(&self, login: &str) -> Result<User, DirectoryError> {
            self.calls.lock().unwrap().push("find_user_by_login");
            if self.known_user {
                Ok(User { login: login.to_string(), name: None })
            } else {
                Err(DirectoryError::NotFound(login.to_string()))
            }
        }

        async fn find_user_by_key_hash(&self, key_hash: &str) -> Result<User, DirectoryError> {
            if key_hash == self.key_hash {
                Ok(User { login: "ab12cde".to_string(), name: None })
            } else {
                Err(DirectoryError::NotFound(key_hash.to_string()))
            }
        }
    }

    fn basic(credentials: &str) -> String {
        format!("Basic {}", STANDARD.encode(credentials))
    }

    #[tokio::test]
    async fn test_valid_credentials() {
        let users = Arc::new(MockUserDirectory::new("s3cret:pw", true));
        let auth = StandardCredentialAuthenticator::new(users.clone());

        // Password may itself contain ':'
        let identity = auth.authenticate_basic(Some(&basic("ab12cde:s3cret:pw"))).await.unwrap();
        assert_eq!(identity.login, "ab12cde");
        assert_eq!(identity.proof, CredentialProof::Password);
        assert_eq!(users.calls(), vec!["verify_password", "find_user_by_login"]);
    }

    #[tokio::test]
    async fn test_missing_or_foreign_scheme() {
        let auth = StandardCredentialAuthenticator::new(Arc::new(MockUserDirectory::new("pw", true)));
        assert!(matches!(auth.authenticate_basic(None).await, Err(GitAccessError::Authentication(_))));
        assert!(matches!(
            auth.authenticate_basic(Some("Bearer abc")).await,
            Err(GitAccessError::Authentication(_))
        ));
        assert!(matches!(
            auth.authenticate_basic(Some("Basic !!!")).await,
            Err(GitAccessError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_format_checked_before_directory() {
        let users = Arc::new(MockUserDirectory::new("pw", true));
        let auth = StandardCredentialAuthenticator::new(users.clone());

        let long_login = "a".repeat(MAX_LOGIN_LENGTH + 1);
        for creds in [":pw".to_string(), "user:".to_string(), format!("{}:pw", long_login), "bad login:pw".to_string()] {
            assert!(matches!(
                auth.authenticate_basic(Some(&basic(&creds))).await,
                Err(GitAccessError::Authentication(_))
            ));
        }
        assert!(users.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_password_skips_user_lookup() {
        let users = Arc::new(MockUserDirectory::new("pw", true));
        let auth = StandardCredentialAuthenticator::new(users.clone());
        assert!(auth.authenticate_basic(Some(&basic("ab12cde:nope"))).await.is_err());
        assert_eq!(users.calls(), vec!["verify_password"]);
    }

    #[tokio::test]
    async fn test_verified_but_unknown_user() {
        let auth = StandardCredentialAuthenticator::new(Arc::new(MockUserDirectory::new("pw", false)));
        assert!(matches!(
            auth.authenticate_basic(Some(&basic("ab12cde:pw"))).await,
            Err(GitAccessError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_public_key() {
        let auth = StandardCredentialAuthenticator::new(Arc::new(MockUserDirectory::new("pw", true)));
        let identity = auth
            .authenticate_public_key("git", "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExample")
            .await
            .unwrap();
        assert_eq!(identity.login, "ab12cde");
        assert!(matches!(identity.proof, CredentialProof::PublicKey(_)));

        assert!(auth.authenticate_public_key("git", "ssh-ed25519 AAAAother").await.is_err());
    }

    #[tokio::test]
    async fn test_access_token_skips_password_check() {
        let users = Arc::new(MockUserDirectory::new("pw", true));
        let auth = StandardCredentialAuthenticator::new(users.clone());

        let identity = auth.authenticate_basic(Some(&basic(&format!("ab12cde:{}", TOKEN)))).await.unwrap();
        assert_eq!(identity.proof, CredentialProof::UserToken);
        assert_eq!(users.calls(), vec!["verify_access_token"]);
    }

    #[tokio::test]
    async fn test_unknown_token_falls_back_to_password() {
        let other = "vcpat-Pq7sV1xZ5bD9fH3jL6nR0tV4wY8aC1eG5iK9mO2qS6uX";
        let users = Arc::new(MockUserDirectory::new(other, true));
        let auth = StandardCredentialAuthenticator::new(users.clone());

        let identity = auth.authenticate_basic(Some(&basic(&format!("ab12cde:{}", other)))).await.unwrap();
        assert_eq!(identity.proof, CredentialProof::Password);
        assert_eq!(users.calls(), vec!["verify_access_token", "verify_password", "find_user_by_login"]);

        // Too short for a token: never sent to the token check.
        let users = Arc::new(MockUserDirectory::new("pw", true));
        let auth = StandardCredentialAuthenticator::new(users.clone());
        assert!(auth.authenticate_basic(Some(&basic("ab12cde:vcpat-short"))).await.is_err());
        assert_eq!(users.calls(), vec!["verify_password"]);
    }

    #[tokio::test]
    async fn test_build_agent_credentials() {
        let users = Arc::new(MockUserDirectory::new("pw", true));
        let auth = StandardCredentialAuthenticator::new(users.clone()).with_build_agent(BuildAgentCredentials {
            login: "buildagent".to_string(),
            password_sha256: hex::encode(Sha256::digest(b"agent-secret")).to_uppercase(),
        });

        let identity = auth.authenticate_basic(Some(&basic("buildagent:agent-secret"))).await.unwrap();
        assert_eq!(identity.proof, CredentialProof::BuildAgent);
        assert!(users.calls().is_empty());

        // A wrong secret is an ordinary password attempt.
        assert!(auth.authenticate_basic(Some(&basic("buildagent:guess"))).await.is_err());
        assert_eq!(users.calls(), vec!["verify_password"]);
    }

    #[test]
    fn test_public_key_hash_is_hex_sha256() {
        let hash = public_key_hash("ssh-ed25519 AAAA");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, public_key_hash("  ssh-ed25519 AAAA\n"));
    }
}
