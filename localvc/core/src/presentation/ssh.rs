// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! SSH transport.
//!
//! Sessions authenticate with a public key only; the key owner becomes the
//! session identity and the SSH user name is ignored. A connection counts
//! once against its client's authentication limit. Each session channel
//! accepts one exec command (`git-upload-pack '<path>'` or
//! `git-receive-pack '<path>'`), authorized on its own, and runs it on a
//! worker task that is cancelled when the channel closes.
//!
//! ```text
//! client data ─▶ mpsc ─▶ StreamReader ─▶ ProtocolEngine ─▶ duplex ─▶ Handle::data
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use russh::server::{self, Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::access::GitAccessError;
use crate::domain::build::RepositoryHandle;
use crate::domain::identity::Identity;
use crate::domain::locator::RepositoryLocator;
use crate::infrastructure::protocol::{GitService, ProtocolError};
use crate::presentation::GitServices;

const ACCESS_DENIED: &str = "fatal: access denied\n";
const CHANNEL_BUFFER: usize = 32 * 1024;
const INPUT_QUEUE: usize = 16;
const STDERR: u32 = 1;

/// Canonical `<algorithm> <base64 blob>` form of a public key.
pub fn canonical_public_key(key: &PublicKey) -> String {
    format!("{} {}", key.name(), key.public_key_base64())
}

/// Split `git-receive-pack '/PROG1/...'` into the service and its path argument.
pub fn parse_command(command: &str) -> Option<(GitService, &str)> {
    let (operation, argument) = command.trim().split_once(' ')?;
    let service = GitService::from_name(operation)?;
    let argument = argument.trim();
    (!argument.is_empty()).then_some((service, argument))
}

pub fn load_host_key(path: &Path) -> anyhow::Result<KeyPair> {
    russh_keys::load_secret_key(path, None).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load SSH host key {}: {}\n\nGenerate one with: ssh-keygen -t ed25519 -N '' -f {}",
            path.display(),
            e,
            path.display()
        )
    })
}

pub struct SshServer {
    services: Arc<GitServices>,
    config: Arc<server::Config>,
    limiter: Option<Arc<Semaphore>>,
}

impl SshServer {
    pub fn new(services: Arc<GitServices>, host_key: KeyPair, max_concurrent_commands: Option<usize>) -> Self {
        let config = server::Config {
            methods: MethodSet::PUBLICKEY,
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        Self {
            services,
            config: Arc::new(config),
            limiter: max_concurrent_commands.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        info!("SSH transport listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            let _ = stream.set_nodelay(true);

            let session = SshSession::new(self.services.clone(), self.limiter.clone(), Some(peer));
            let config = self.config.clone();
            tokio::spawn(async move {
                match server::run_stream(config, stream, session).await {
                    Ok(running) => {
                        if let Err(e) = running.await {
                            debug!("SSH session with {} ended: {}", peer, e);
                        }
                    }
                    Err(e) => debug!("SSH handshake with {} failed: {}", peer, e),
                }
            });
        }
        info!("SSH transport stopped");
        Ok(())
    }
}

struct ChannelState {
    input: Option<mpsc::Sender<Bytes>>,
    cancel: CancellationToken,
}

struct SshSession {
    services: Arc<GitServices>,
    limiter: Option<Arc<Semaphore>>,
    peer: Option<SocketAddr>,
    identity: Option<Identity>,
    /// Set by the first authentication attempt: whether the client is over its limit.
    rate_limited: Option<bool>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SshSession {
    fn new(services: Arc<GitServices>, limiter: Option<Arc<Semaphore>>, peer: Option<SocketAddr>) -> Self {
        Self {
            services,
            limiter,
            peer,
            identity: None,
            rate_limited: None,
            channels: HashMap::new(),
        }
    }

    /// SSH paths may omit the HTTP base path (`/PROG1/course/repo.git`).
    fn locate(&self, argument: &str) -> Result<RepositoryLocator, GitAccessError> {
        self.services
            .locate(argument)
            .or_else(|_| RepositoryLocator::from_path("", argument).map_err(GitAccessError::from))
    }

    async fn prepare(&self, command: &str) -> Result<(GitService, RepositoryHandle, Identity), GitAccessError> {
        let identity = self
            .identity
            .clone()
            .ok_or_else(|| GitAccessError::Authentication("session has no identity".to_string()))?;
        let (service, argument) = parse_command(command)
            .ok_or_else(|| GitAccessError::BadRequest(format!("unsupported command '{}'", command)))?;
        let locator = self.locate(argument)?;

        self.services
            .authorize(&identity, &locator, service.action(), self.peer.map(|peer| peer.ip()))
            .await?;

        let repository = self.services.store.open(&locator).map_err(|e| match e {
            ProtocolError::RepositoryNotFound(name) => GitAccessError::BadRequest(format!("no repository {}", name)),
            other => GitAccessError::Internal(other.to_string()),
        })?;
        Ok((service, repository, identity))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        for state in self.channels.values() {
            state.cancel.cancel();
        }
    }
}

#[async_trait]
impl server::Handler for SshSession {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let rate_limited = match self.rate_limited {
            Some(limited) => limited,
            None => {
                let checked = self.services.auth_limiter.check(self.peer.map(|peer| peer.ip()));
                if let Err(e) = &checked {
                    debug!("Refusing SSH authentication from {:?}: {}", self.peer, e);
                    metrics::counter!("localvc_git_access_denied_total", "transport" => "ssh", "reason" => e.kind())
                        .increment(1);
                }
                *self.rate_limited.insert(checked.is_err())
            }
        };
        if rate_limited {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        let canonical = canonical_public_key(public_key);
        match self.services.authenticator.authenticate_public_key(user, &canonical).await {
            Ok(identity) => {
                info!("SSH session from {:?} authenticated as {}", self.peer, identity.login);
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            Err(e) => {
                debug!("Rejected public key from {:?}: {}", self.peer, e);
                metrics::counter!("localvc_git_access_denied_total", "transport" => "ssh", "reason" => e.kind())
                    .increment(1);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            ChannelState {
                input: None,
                cancel: CancellationToken::new(),
            },
        );
        Ok(true)
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        session.channel_success(channel);

        let already_running = self.channels.get(&channel).is_none_or(|state| state.input.is_some());
        let prepared = if already_running {
            Err(GitAccessError::BadRequest("one command per channel".to_string()))
        } else {
            self.prepare(&command).await
        };

        let (service, repository, identity) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Denied SSH command '{}' from {:?}: {}", command, self.peer, e);
                metrics::counter!("localvc_git_access_denied_total", "transport" => "ssh", "reason" => e.kind())
                    .increment(1);
                session.extended_data(channel, STDERR, CryptoVec::from_slice(ACCESS_DENIED.as_bytes()));
                session.exit_status_request(channel, 1);
                session.eof(channel);
                session.close(channel);
                return Ok(());
            }
        };

        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        let (tx, rx) = mpsc::channel(INPUT_QUEUE);
        state.input = Some(tx);

        metrics::counter!("localvc_git_requests_total", "transport" => "ssh", "service" => service.name()).increment(1);
        info!("{} runs {} on {}", identity.login, service.name(), repository.locator);

        let command = SshCommand {
            services: self.services.clone(),
            limiter: self.limiter.clone(),
            handle: session.handle(),
            channel,
            service,
            repository,
        };
        tokio::spawn(command.run(rx, state.cancel.clone()));
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(input) = self.channels.get(&channel).and_then(|state| state.input.clone()) {
            // The worker may already be gone; late data is dropped.
            let _ = input.send(Bytes::copy_from_slice(data)).await;
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.input = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.remove(&channel) {
            state.cancel.cancel();
        }
        Ok(())
    }
}

/// One authorized git command bound to a channel.
struct SshCommand {
    services: Arc<GitServices>,
    limiter: Option<Arc<Semaphore>>,
    handle: Handle,
    channel: ChannelId,
    service: GitService,
    repository: RepositoryHandle,
}

impl SshCommand {
    async fn run(self, input: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
        let _permit = match &self.limiter {
            Some(limiter) => tokio::select! {
                _ = cancel.cancelled() => return,
                permit = limiter.clone().acquire_owned() => permit.ok(),
            },
            None => None,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{} on {} cancelled by channel close", self.service.name(), self.repository.locator);
                return;
            }
            result = self.stream(input) => result,
        };

        let status = match result {
            Ok(()) => 0,
            Err(e) => {
                warn!("{} on {} failed: {}", self.service.name(), self.repository.locator, e);
                let _ = self
                    .handle
                    .extended_data(self.channel, STDERR, CryptoVec::from_slice(ACCESS_DENIED.as_bytes()))
                    .await;
                1
            }
        };
        let _ = self.handle.exit_status_request(self.channel, status).await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }

    async fn stream(&self, input: mpsc::Receiver<Bytes>) -> Result<(), ProtocolError> {
        let mut input = StreamReader::new(ReceiverStream::new(input).map(Ok::<_, std::io::Error>));
        let (writer, reader) = tokio::io::duplex(CHANNEL_BUFFER);

        let work = async {
            let mut writer = writer;
            match self.service {
                GitService::UploadPack => {
                    self.services
                        .engine
                        .upload_pack(&self.repository.path, &mut input, &mut writer, false)
                        .await
                }
                GitService::ReceivePack => self
                    .services
                    .receive_pack(&self.repository, &mut input, &mut writer, true)
                    .await
                    .map(|_| ()),
            }
        };

        let forward = async {
            let mut reader = reader;
            let mut buf = vec![0u8; CHANNEL_BUFFER];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if self.handle.data(self.channel, CryptoVec::from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        };

        let (result, ()) = tokio::join!(work, forward);
        result
    }
}
