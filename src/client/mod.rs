//! The backup client: directory record cache, sync loop, remote session,
//! and control socket, wired together by the daemon entry point in
//! `src/bin/vaultsyncd.rs`.

pub mod control_socket;
pub mod record;
pub mod remote_session;
pub mod sync;

pub use control_socket::{Command, ControlSocketError};
pub use record::{ChildRecord, DirectoryRecord, ExcludeFilter, LocationState};
pub use remote_session::{connect, RemoteSession};
pub use sync::{ServerSession, SyncCycle, SyncError};
