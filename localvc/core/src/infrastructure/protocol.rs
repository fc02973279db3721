// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Git protocol engine shared by the HTTP and SSH transports.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Fetch:** delegated to `git upload-pack` (stateless over HTTP, streaming over SSH)
//! - **Push:** receive-pack implemented here so policy runs between object
//!   ingestion and ref updates
//!
//! ## Receive-pack
//!
//! ```text
//! commands ─▶ pack ─▶ quarantine (git index-pack)
//!                         │
//!                         ▼
//!            classify (git2, quarantine as alternate)
//!                         │
//!                pre-receive hook ──▶ any rejected? ──▶ abort all, report
//!                         │ no
//!                         ▼
//!        migrate packs ─▶ ref transaction ─▶ report ─▶ post-receive hook
//! ```
//!
//! A push is atomic: if any command is rejected, no ref is updated and no
//! object leaves quarantine.

use git2::{ErrorCode, Oid, Repository};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::identity::RepositoryAction;
use crate::domain::push::{
    CommandResult, ObjectId, RefInspectError, RefInspector, RefUpdateCommand, RefUpdateType,
};
use crate::infrastructure::pkt_line::{self, Packet};

pub const AGENT: &str = concat!("localvc/", env!("CARGO_PKG_VERSION"));
const RECEIVE_CAPABILITIES: &str = "report-status delete-refs ofs-delta";
const ABORTED: &str = "aborted: another ref update was rejected";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("git subprocess failed: {0}")]
    Subprocess(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    pub fn action(&self) -> RepositoryAction {
        match self {
            Self::UploadPack => RepositoryAction::Read,
            Self::ReceivePack => RepositoryAction::Write,
        }
    }
}

/// Closures run by [`ProtocolEngine::receive_pack`].
///
/// `pre_receive` sees every command before anything is applied and records
/// rejections on them. `post_receive` sees the applied commands once refs
/// are durable and the client report has been written.
pub struct ReceiveHooks<Pre, Post> {
    pub pre_receive: Pre,
    pub post_receive: Post,
}

impl<Pre, Post> ReceiveHooks<Pre, Post>
where
    Pre: FnOnce(&mut [RefUpdateCommand], &dyn RefInspector) + Send + 'static,
    Post: FnOnce(&[RefUpdateCommand]) + Send,
{
    pub fn new(pre_receive: Pre, post_receive: Post) -> Self {
        Self {
            pre_receive,
            post_receive,
        }
    }
}

/// Outcome of one receive-pack exchange.
#[derive(Debug, Clone)]
pub struct ReceiveReport {
    pub unpack_error: Option<String>,
    pub commands: Vec<RefUpdateCommand>,
}

impl ReceiveReport {
    pub fn applied(&self) -> Vec<RefUpdateCommand> {
        self.commands
            .iter()
            .filter(|c| c.result == CommandResult::Ok)
            .cloned()
            .collect()
    }

    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        match &self.unpack_error {
            None => pkt_line::write_line(&mut buf, "unpack ok")?,
            Some(err) => pkt_line::write_line(&mut buf, &format!("unpack {}", err))?,
        }
        for command in &self.commands {
            let line = match &command.result {
                CommandResult::Ok => format!("ok {}", command.ref_name),
                CommandResult::Rejected(reason) => format!("ng {} {}", command.ref_name, reason),
                CommandResult::NotAttempted => format!("ng {} not attempted", command.ref_name),
            };
            pkt_line::write_line(&mut buf, &line)?;
        }
        pkt_line::write_flush(&mut buf);
        Ok(buf)
    }
}

/// Current ref state read through git2.
struct RepositoryRefs<'r>(&'r Repository);

impl RefInspector for RepositoryRefs<'_> {
    fn current(&self, ref_name: &str) -> Result<Option<ObjectId>, RefInspectError> {
        match self.0.refname_to_id(ref_name) {
            Ok(oid) => Ok(ObjectId::parse(&oid.to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(RefInspectError {
                ref_name: ref_name.to_string(),
                message: e.message().to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolEngine {
    git_binary: PathBuf,
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new("git")
    }
}

impl ProtocolEngine {
    pub fn new(git_binary: impl Into<PathBuf>) -> Self {
        Self {
            git_binary: git_binary.into(),
        }
    }

    /// Ref advertisement for the smart HTTP `info/refs` endpoint, including
    /// the `# service=` header packet.
    pub async fn http_advertisement(&self, repo_path: &Path, service: GitService) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        pkt_line::write_line(&mut buf, &format!("# service={}", service.name()))?;
        pkt_line::write_flush(&mut buf);

        match service {
            GitService::UploadPack => {
                let mut cmd = self.git_command();
                cmd.arg("upload-pack")
                    .arg("--stateless-rpc")
                    .arg("--advertise-refs")
                    .arg(repo_path);
                let mut input = tokio::io::empty();
                let (status, stderr) = run_piped(cmd, &mut input, &mut buf).await?;
                check_status("upload-pack --advertise-refs", status, &stderr)?;
            }
            GitService::ReceivePack => buf.extend(receive_advertisement(repo_path)?),
        }
        Ok(buf)
    }

    /// Serve a fetch. `stateless` selects the HTTP (`--stateless-rpc`) mode; over
    /// SSH git writes its own advertisement first.
    pub async fn upload_pack<R, W>(
        &self,
        repo_path: &Path,
        input: &mut R,
        output: &mut W,
        stateless: bool,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut cmd = self.git_command();
        cmd.arg("upload-pack");
        if stateless {
            cmd.arg("--stateless-rpc");
        }
        cmd.arg(repo_path);

        let (status, stderr) = run_piped(cmd, input, output).await?;
        output.flush().await?;
        check_status("upload-pack", status, &stderr)
    }

    /// Serve a push. With `advertise` the ref advertisement is written first
    /// (SSH); over HTTP it was served by `info/refs` already.
    pub async fn receive_pack<R, W, Pre, Post>(
        &self,
        repo_path: &Path,
        input: &mut R,
        output: &mut W,
        advertise: bool,
        hooks: ReceiveHooks<Pre, Post>,
    ) -> Result<ReceiveReport, ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        Pre: FnOnce(&mut [RefUpdateCommand], &dyn RefInspector) + Send + 'static,
        Post: FnOnce(&[RefUpdateCommand]) + Send,
    {
        if advertise {
            output.write_all(&receive_advertisement(repo_path)?).await?;
            output.flush().await?;
        }

        let (mut commands, report_status) = read_commands(input).await?;
        if commands.is_empty() {
            debug!("Client sent no ref updates for {:?}", repo_path);
            return Ok(ReceiveReport {
                unpack_error: None,
                commands,
            });
        }

        let quarantine = tempfile::Builder::new()
            .prefix("incoming-")
            .tempdir_in(repo_path.join("objects"))?;
        std::fs::create_dir_all(quarantine.path().join("pack"))?;

        let needs_pack = commands.iter().any(|c| !c.new_id.is_zero());
        let unpack_error = if needs_pack {
            self.index_pack(repo_path, quarantine.path(), input).await.err()
        } else {
            None
        };

        match &unpack_error {
            Some(err) => {
                warn!("Unpacking push into {:?} failed: {}", repo_path, err);
                for command in commands.iter_mut() {
                    command.reject("unpacker error");
                }
                drop(quarantine);
            }
            None => {
                // The quarantine moves along so it outlives the worker even if this future is dropped.
                let repository = repo_path.to_path_buf();
                let pre_receive = hooks.pre_receive;
                commands = tokio::task::spawn_blocking(move || {
                    let mut commands = commands;
                    decide_and_apply(&repository, quarantine.path(), &mut commands, pre_receive).map(|()| commands)
                })
                .await
                .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))??;
            }
        }

        let report = ReceiveReport {
            unpack_error: unpack_error.map(|e| e.to_string().replace('\n', " ")),
            commands,
        };
        if report_status {
            output.write_all(&report.encode()?).await?;
            output.flush().await?;
        }

        let applied = report.applied();
        if !applied.is_empty() {
            (hooks.post_receive)(&applied);
        }
        Ok(report)
    }

    async fn index_pack<R>(&self, repo_path: &Path, quarantine: &Path, input: &mut R) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut cmd = self.git_command();
        cmd.arg("index-pack")
            .arg("--stdin")
            .arg("--fix-thin")
            .env("GIT_DIR", repo_path)
            .env("GIT_OBJECT_DIRECTORY", quarantine)
            .env("GIT_ALTERNATE_OBJECT_DIRECTORIES", repo_path.join("objects"));

        let mut stdout = Vec::new();
        let (status, stderr) = run_piped(cmd, input, &mut stdout).await?;
        check_status("index-pack", status, &stderr)?;
        debug!("index-pack: {}", String::from_utf8_lossy(&stdout).trim());
        Ok(())
    }

    fn git_command(&self) -> Command {
        let mut cmd = Command::new(&self.git_binary);
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Receive-pack ref advertisement, terminated by a flush packet.
pub fn receive_advertisement(repo_path: &Path) -> Result<Vec<u8>, ProtocolError> {
    let repo = open(repo_path)?;
    let mut refs: Vec<(String, Oid)> = Vec::new();
    for reference in repo.references()? {
        let reference = reference?;
        if let (Some(name), Some(target)) = (reference.name(), reference.target()) {
            refs.push((name.to_string(), target));
        }
    }
    refs.sort();

    let capabilities = format!("{} agent={}", RECEIVE_CAPABILITIES, AGENT);
    let mut buf = Vec::new();
    if refs.is_empty() {
        let first = format!("{} capabilities^{{}}\0{}", ObjectId::zero(), capabilities);
        pkt_line::write_line(&mut buf, &first)?;
    }
    for (index, (name, oid)) in refs.iter().enumerate() {
        let line = if index == 0 {
            format!("{} {}\0{}", oid, name, capabilities)
        } else {
            format!("{} {}", oid, name)
        };
        pkt_line::write_line(&mut buf, &line)?;
    }
    pkt_line::write_flush(&mut buf);
    Ok(buf)
}

fn open(repo_path: &Path) -> Result<Repository, ProtocolError> {
    Repository::open_bare(repo_path).map_err(|e| match e.code() {
        ErrorCode::NotFound => ProtocolError::RepositoryNotFound(repo_path.display().to_string()),
        _ => ProtocolError::Git(e),
    })
}

/// Parse the command list up to the flush packet.
/// Returns the commands and whether the client asked for `report-status`.
async fn read_commands<R>(input: &mut R) -> Result<(Vec<RefUpdateCommand>, bool), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut commands = Vec::new();
    let mut report_status = false;

    loop {
        let data = match pkt_line::read_pkt(input).await? {
            Some(Packet::Flush) => break,
            Some(Packet::Data(data)) => data,
            Some(other) => return Err(ProtocolError::Malformed(format!("unexpected {:?} packet", other))),
            None if commands.is_empty() => break,
            None => return Err(ProtocolError::Malformed("command list ended without flush".to_string())),
        };

        let line = pkt_line::trim_line(&data);
        if line.starts_with(b"shallow ") {
            continue;
        }
        let (line, capabilities) = match line.iter().position(|&b| b == 0) {
            Some(nul) => (&line[..nul], Some(&line[nul + 1..])),
            None => (line, None),
        };
        if let Some(capabilities) = capabilities {
            let capabilities = String::from_utf8_lossy(capabilities);
            report_status = capabilities.split(' ').any(|c| c == "report-status");
        }

        let line = std::str::from_utf8(line)
            .map_err(|_| ProtocolError::Malformed("command is not UTF-8".to_string()))?;
        let mut parts = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(ref_name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ProtocolError::Malformed(format!("invalid command '{}'", line)));
        };
        let old_id = ObjectId::parse(old).ok_or_else(|| ProtocolError::Malformed(format!("invalid old id '{}'", old)))?;
        let new_id = ObjectId::parse(new).ok_or_else(|| ProtocolError::Malformed(format!("invalid new id '{}'", new)))?;
        if !git2::Reference::is_valid_name(ref_name) {
            return Err(ProtocolError::Malformed(format!("invalid ref name '{}'", ref_name)));
        }

        // Type is provisional until the objects are available.
        let update_type = if new_id.is_zero() {
            RefUpdateType::Delete
        } else if old_id.is_zero() {
            RefUpdateType::Create
        } else {
            RefUpdateType::Update
        };
        commands.push(RefUpdateCommand::new(ref_name, old_id, new_id, update_type));
    }

    Ok((commands, report_status))
}

/// Classify, run the pre-receive hook and, if nothing was rejected, make the
/// push durable. Blocking; runs on the blocking pool.
fn decide_and_apply<Pre>(
    repo_path: &Path,
    quarantine: &Path,
    commands: &mut [RefUpdateCommand],
    pre_receive: Pre,
) -> Result<(), ProtocolError>
where
    Pre: FnOnce(&mut [RefUpdateCommand], &dyn RefInspector),
{
    {
        let repo = open(repo_path)?;
        let quarantine_str = quarantine
            .to_str()
            .ok_or_else(|| ProtocolError::Malformed("quarantine path is not UTF-8".to_string()))?;
        repo.odb()?.add_disk_alternate(quarantine_str)?;

        for command in commands.iter_mut() {
            classify(&repo, command);
        }
        pre_receive(commands, &RepositoryRefs(&repo));
    }

    if commands.iter().any(RefUpdateCommand::is_rejected) {
        for command in commands.iter_mut().filter(|c| !c.is_rejected()) {
            command.reject(ABORTED);
        }
        return Ok(());
    }

    migrate_packs(quarantine, &repo_path.join("objects").join("pack"))?;

    let repo = open(repo_path)?;
    if let Err(e) = apply_refs(&repo, commands) {
        warn!("Ref transaction on {:?} failed: {}", repo_path, e);
        for command in commands.iter_mut().filter(|c| !c.is_rejected()) {
            command.reject(format!("failed to update ref: {}", e.message()));
        }
        return Ok(());
    }

    for command in commands.iter_mut() {
        command.result = CommandResult::Ok;
        info!("Updated {} {} -> {}", command.ref_name, command.old_id, command.new_id);
    }
    Ok(())
}

fn classify(repo: &Repository, command: &mut RefUpdateCommand) {
    if command.new_id.is_zero() {
        command.update_type = RefUpdateType::Delete;
        return;
    }
    let Ok(new) = Oid::from_str(command.new_id.as_str()) else {
        command.reject("invalid object id");
        return;
    };
    if repo.find_object(new, None).is_err() {
        command.reject("missing necessary objects");
        return;
    }
    if command.old_id.is_zero() {
        command.update_type = RefUpdateType::Create;
        return;
    }

    let fast_forward = Oid::from_str(command.old_id.as_str())
        .ok()
        .map(|old| old == new || repo.graph_descendant_of(new, old).unwrap_or(false))
        .unwrap_or(false);
    command.update_type = if fast_forward {
        RefUpdateType::Update
    } else {
        RefUpdateType::UpdateNonFastForward
    };
}

/// Move quarantined packs into the repository. The `.idx` goes last so a
/// concurrent reader never sees an index without its pack.
fn migrate_packs(quarantine: &Path, pack_dir: &Path) -> Result<(), ProtocolError> {
    std::fs::create_dir_all(pack_dir)?;
    let mut files: Vec<PathBuf> = std::fs::read_dir(quarantine.join("pack"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    files.sort_by_key(|path| match path.extension().and_then(|e| e.to_str()) {
        Some("pack") => 0,
        Some("idx") => 2,
        _ => 1,
    });

    for file in files {
        if let Some(name) = file.file_name() {
            std::fs::rename(&file, pack_dir.join(name))?;
        }
    }
    Ok(())
}

fn apply_refs(repo: &Repository, commands: &[RefUpdateCommand]) -> Result<(), git2::Error> {
    let mut tx = repo.transaction()?;
    for command in commands {
        tx.lock_ref(&command.ref_name)?;

        let current = match repo.refname_to_id(&command.ref_name) {
            Ok(oid) => Some(oid),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e),
        };
        let expected = if command.old_id.is_zero() {
            None
        } else {
            Some(Oid::from_str(command.old_id.as_str())?)
        };
        if current != expected {
            return Err(git2::Error::from_str(&format!("{} changed during push", command.ref_name)));
        }

        if command.update_type == RefUpdateType::Delete {
            tx.remove(&command.ref_name)?;
        } else {
            let new = Oid::from_str(command.new_id.as_str())?;
            tx.set_target(&command.ref_name, new, None, "push")?;
        }
    }
    tx.commit()
}

/// Run a git subprocess with `input` on stdin and stdout copied to `output`.
///
/// Input is pumped until the child exits, not until `input` ends: an SSH
/// channel stays open after the client has sent everything. If `output`
/// fails, the reader is gone and the child is killed.
async fn run_piped<R, W>(mut cmd: Command, input: &mut R, output: &mut W) -> Result<(ExitStatus, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProtocolError::Subprocess(format!("failed to spawn git: {}", e)))?;

    let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(ProtocolError::Subprocess("git stdio was not captured".to_string()));
    };

    let feed = async move {
        if let Err(e) = tokio::io::copy(input, &mut stdin).await {
            debug!("Stopped feeding git: {}", e);
        }
        drop(stdin);
        std::future::pending::<Infallible>().await
    };
    tokio::pin!(feed);

    let mut stderr_buf = Vec::new();
    let streams = async {
        let drain = async {
            let drained = tokio::io::copy(&mut stdout, output).await;
            if let Err(e) = &drained {
                debug!("Output of git closed early, killing it: {}", e);
                let _ = child.start_kill();
            }
            drop(stdout);
            drained
        };
        tokio::join!(drain, stderr.read_to_end(&mut stderr_buf))
    };
    let (drained, collected) = tokio::select! {
        done = streams => done,
        never = &mut feed => match never {},
    };
    let status = tokio::select! {
        status = child.wait() => status?,
        never = &mut feed => match never {},
    };
    drained?;
    collected?;
    Ok((status, stderr_buf))
}

fn check_status(what: &str, status: ExitStatus, stderr: &[u8]) -> Result<(), ProtocolError> {
    if status.success() {
        Ok(())
    } else {
        Err(ProtocolError::Subprocess(format!(
            "git {} exited with {}: {}",
            what,
            status,
            String::from_utf8_lossy(stderr).trim()
        )))
    }
}
