//! The local control socket: a Unix domain socket accepting line-based
//! commands from `vaultsyncd`'s own CLI front-end, mirroring the shape of
//! the sibling daemons' admin sockets in this stack.
//!
//! Commands: `sync`, `force-sync`, `reload`, `terminate`, `wait-for-sync`,
//! `wait-for-end`, `quit`. Every command gets exactly one `ok` or
//! `error <message>` reply line. The daemon may additionally push
//! unsolicited `state N` / `start-sync` / `finish-sync` lines to any
//! connected peer — callers that only want the reply should stop reading
//! after the first line.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::mpsc::Sender;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ControlSocketError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognised command: {0}")]
    UnknownCommand(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sync,
    ForceSync,
    Reload,
    Terminate,
    WaitForSync,
    WaitForEnd,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, ControlSocketError> {
        match line.trim() {
            "sync" => Ok(Command::Sync),
            "force-sync" => Ok(Command::ForceSync),
            "reload" => Ok(Command::Reload),
            "terminate" => Ok(Command::Terminate),
            "wait-for-sync" => Ok(Command::WaitForSync),
            "wait-for-end" => Ok(Command::WaitForEnd),
            "quit" => Ok(Command::Quit),
            other => Err(ControlSocketError::UnknownCommand(other.to_string())),
        }
    }
}

/// Unsolicited status lines the daemon pushes to listeners, independent
/// of any particular command's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    State(u32),
    StartSync,
    FinishSync,
}

impl StatusLine {
    fn render(&self) -> String {
        match self {
            StatusLine::State(n) => format!("state {n}"),
            StatusLine::StartSync => "start-sync".to_string(),
            StatusLine::FinishSync => "finish-sync".to_string(),
        }
    }
}

/// Binds the socket at `path`, removing a stale file left by a prior
/// unclean shutdown first. Each accepted connection is handled by
/// `handle`, which receives the parsed command and the peer's Unix
/// credentials where the platform supports the lookup.
pub fn serve(
    path: &Path,
    commands: Sender<Command>,
    mut handle_reply: impl FnMut(&Command) -> String,
) -> Result<(), ControlSocketError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(socket = %path.display(), "control socket listening");

    for stream in listener.incoming() {
        let stream = stream?;
        if let Err(e) = handle_connection(stream, &commands, &mut handle_reply) {
            warn!(error = %e, "control socket connection failed");
        }
    }
    Ok(())
}

fn handle_connection(
    stream: UnixStream,
    commands: &Sender<Command>,
    handle_reply: &mut impl FnMut(&Command) -> String,
) -> Result<(), ControlSocketError> {
    if !peer_is_same_user(&stream) {
        warn!("rejected control socket connection from a different user");
        return Ok(());
    }

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(());
    }

    let reply = match Command::parse(&line) {
        Ok(cmd) => {
            let text = handle_reply(&cmd);
            let _ = commands.send(cmd);
            format!("ok {text}\n")
        }
        Err(e) => format!("error {e}\n"),
    };
    writer.write_all(reply.as_bytes())?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn peer_is_same_user(stream: &UnixStream) -> bool {
    use std::os::unix::io::AsRawFd;
    // SAFETY: `fd` is a valid, live socket fd for the lifetime of this call
    // (it borrows `stream`), and `getsockopt(SO_PEERCRED)` only reads into
    // a correctly-sized, stack-allocated `libc::ucred`.
    unsafe {
        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let rc = libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        );
        rc == 0 && cred.uid == libc::getuid()
    }
}

#[cfg(not(target_os = "linux"))]
fn peer_is_same_user(_stream: &UnixStream) -> bool {
    true
}
