use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use vaultsync::client::record::DirectoryRecord;
use vaultsync::client::sync::{ServerSession, SyncCycle};
use vaultsync::client::{control_socket, remote_session, Command as ControlCommand, ExcludeFilter, LocationState};
use vaultsync::config::Config;
use vaultsync::crypto::KeySet;
use vaultsync::logging;

#[derive(Parser)]
#[command(name = "vaultsyncd", version, about = "vaultsync backup client daemon")]
struct Cli {
    /// Path to the client configuration file
    #[arg(short, long, default_value = "/etc/vaultsync/vaultsyncd.conf")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run continuously, syncing on the configured interval
    Run,
    /// Run a single sync cycle across all locations and exit
    SyncNow,
    /// Send a command to an already-running daemon over its control socket
    Control {
        #[arg(value_enum)]
        command: ControlAction,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum ControlAction {
    Sync,
    ForceSync,
    Reload,
    Terminate,
    WaitForSync,
    WaitForEnd,
    Quit,
}

impl From<ControlAction> for ControlCommand {
    fn from(action: ControlAction) -> Self {
        match action {
            ControlAction::Sync => ControlCommand::Sync,
            ControlAction::ForceSync => ControlCommand::ForceSync,
            ControlAction::Reload => ControlCommand::Reload,
            ControlAction::Terminate => ControlCommand::Terminate,
            ControlAction::WaitForSync => ControlCommand::WaitForSync,
            ControlAction::WaitForEnd => ControlCommand::WaitForEnd,
            ControlAction::Quit => ControlCommand::Quit,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    logging::init(config.extended_logging);

    match cli.command {
        Commands::Run => run_forever(&config),
        Commands::SyncNow => sync_once(&config),
        Commands::Control { command } => send_control(&config, command.into()),
    }
}

/// Runs the sync loop forever, waking early on whatever the control socket
/// receives (or on the configured interval, whichever comes first).
fn run_forever(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(locations = config.backup_locations.len(), "vaultsyncd starting");

    let (commands_tx, commands_rx) = std::sync::mpsc::channel::<ControlCommand>();
    let socket_path = config.command_socket.clone();
    std::thread::spawn(move || {
        if let Err(e) = control_socket::serve(&socket_path, commands_tx, |cmd| format!("{cmd:?} accepted")) {
            tracing::warn!(error = %e, "control socket exited");
        }
    });

    loop {
        sync_once(config)?;
        match commands_rx.recv_timeout(Duration::from_secs(config.update_store_interval_secs)) {
            Ok(ControlCommand::Terminate) | Ok(ControlCommand::Quit) => {
                tracing::info!("control socket requested shutdown");
                return Ok(());
            }
            Ok(ControlCommand::Reload) => {
                tracing::info!("control socket requested a config reload; restart the daemon to pick it up");
            }
            Ok(_) => {
                // Sync/ForceSync/WaitForSync/WaitForEnd all just fall through
                // to the next loop iteration's sync_once call.
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("control socket thread ended, continuing on the timer alone");
            }
        }
    }
}

fn sync_once(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let keys = Arc::new(KeySet::load(&config.keys_file)?);

    for (name, location) in &config.backup_locations {
        tracing::info!(location = %name, path = %location.path.display(), "starting sync cycle");
        let state_path = config.data_directory.join(format!("{name}.record.json"));
        let mut state = LocationState::load(&state_path).unwrap_or_else(|_| {
            LocationState::new(vaultsync::store::object_id::ROOT_DIRECTORY_ID, ExcludeFilter::new(location.exclude.clone()))
        });

        let mut session = match remote_session::connect(&config.store_hostname, config.account_number, true, keys.clone()) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(location = %name, error = %e, "could not reach the store, skipping this cycle");
                continue;
            }
        };

        let cycle = SyncCycle {
            location_name: name,
            minimum_file_age_secs: config.minimum_file_age_secs,
            max_upload_wait_secs: config.max_upload_wait_secs,
            file_tracking_size_threshold: config.file_tracking_size_threshold,
            diffing_upload_size_threshold: config.diffing_upload_size_threshold,
            maximum_diffing_time_secs: config.maximum_diffing_time_secs,
        };

        let now_us = now_micros()?;
        let root_container_id = state.root.server_object_id;
        match sync_recursive(&cycle, &mut session, &location.path, &mut state, root_container_id, now_us) {
            Ok(()) => state.last_sync_end_us = now_us,
            Err(e) => tracing::warn!(location = %name, error = %e, "sync cycle failed"),
        }

        if let Err(e) = session.finish() {
            tracing::warn!(location = %name, error = %e, "error closing store connection");
        }
        state.save(&state_path)?;
    }
    Ok(())
}

/// Runs one location's sync cycle and recurses into every subdirectory
/// `sync_directory` reports, swapping in each subdirectory's own cached
/// record for the duration of its nested cycle and writing it back
/// afterward.
fn sync_recursive(
    cycle: &SyncCycle,
    session: &mut dyn ServerSession,
    local_dir: &Path,
    state: &mut LocationState,
    container_id: u64,
    now_us: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let subdirs = cycle.sync_directory(session, local_dir, state, container_id, now_us)?;

    for sub_path in subdirs {
        let name = match sub_path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => continue,
        };
        let server_id = match state.root.child(&name) {
            Some(record) => record.server_object_id,
            None => continue,
        };

        let child_record = state.root.remove_subdirectory(&name).unwrap_or_else(|| DirectoryRecord::new(server_id));
        let mut child_state = LocationState {
            root: child_record,
            exclude: state.exclude.clone(),
            last_sync_end_us: state.last_sync_end_us,
        };

        sync_recursive(cycle, session, &sub_path, &mut child_state, server_id, now_us)?;
        *state.root.ensure_subdirectory(&name, server_id) = child_state.root;
    }
    Ok(())
}

fn now_micros() -> Result<u64, Box<dyn std::error::Error>> {
    Ok(std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?.as_micros() as u64)
}

fn send_control(config: &Config, command: ControlCommand) -> Result<(), Box<dyn std::error::Error>> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let line = match command {
        ControlCommand::Sync => "sync\n",
        ControlCommand::ForceSync => "force-sync\n",
        ControlCommand::Reload => "reload\n",
        ControlCommand::Terminate => "terminate\n",
        ControlCommand::WaitForSync => "wait-for-sync\n",
        ControlCommand::WaitForEnd => "wait-for-end\n",
        ControlCommand::Quit => "quit\n",
    };
    let mut stream = UnixStream::connect(&config.command_socket)?;
    stream.write_all(line.as_bytes())?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    print!("{reply}");
    Ok(())
}
