use clap::Parser;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use vaultsync::crypto::KeySet;
use vaultsync::logging;
use vaultsync::server::context::AccountInfo;
use vaultsync::server::context::AccountLocks;
use vaultsync::server::run_housekeeping;
use vaultsync::server::session::{serve_connection, ServerState};
use vaultsync::store::object_id::ROOT_DIRECTORY_ID;
use vaultsync::store::object_store::FsObjectStore;
use vaultsync::store::object_store::ObjectStore;

#[derive(Parser)]
#[command(name = "vaultsync-store", version, about = "vaultsync backup store server")]
struct Cli {
    /// Directory holding one file per stored object
    #[arg(short, long)]
    data_directory: PathBuf,

    /// Key material file (role-separated keys, see crypto::keys)
    #[arg(long)]
    keys_file: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:2124")]
    listen: String,

    /// Run a single housekeeping pass and exit, instead of serving connections
    #[arg(long)]
    housekeeping_once: bool,

    /// Account soft limit in blocks
    #[arg(long, default_value_t = 1_000_000)]
    soft_limit: u64,

    /// Account hard limit in blocks
    #[arg(long, default_value_t = 1_300_000)]
    hard_limit: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(false);

    let store = FsObjectStore::open(cli.data_directory.clone())?;
    let keys = Arc::new(KeySet::load(&cli.keys_file)?);

    if !store.exists(ROOT_DIRECTORY_ID) {
        let empty_root = vaultsync::store::directory::Directory::new(ROOT_DIRECTORY_ID, 0);
        let mut buf = Vec::new();
        empty_root.serialize(&mut buf)?;
        store.put(ROOT_DIRECTORY_ID, &buf)?;
    }

    if cli.housekeeping_once {
        let mut account = AccountInfo {
            account_id: 1,
            soft_limit: cli.soft_limit,
            hard_limit: cli.hard_limit,
            ..Default::default()
        };
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_secs();
        run_housekeeping(
            &store,
            &mut account,
            ROOT_DIRECTORY_ID,
            now,
            keys.key_for(vaultsync::crypto::KeyRole::FileData),
            keys.key_for(vaultsync::crypto::KeyRole::BlockIndex),
        )?;
        return Ok(());
    }

    let account = AccountInfo {
        account_id: 1,
        soft_limit: cli.soft_limit,
        hard_limit: cli.hard_limit,
        ..Default::default()
    };
    let state = Arc::new(ServerState::new(
        Arc::new(store),
        account,
        AccountLocks::new(),
        keys,
        ROOT_DIRECTORY_ID,
    ));

    let listener = TcpListener::bind(&cli.listen)?;
    tracing::info!(listen = %cli.listen, data_directory = %cli.data_directory.display(), "vaultsync-store listening");

    for incoming in listener.incoming() {
        let mut stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept connection");
                continue;
            }
        };
        let state = state.clone();
        std::thread::spawn(move || {
            let peer = stream.peer_addr().ok();
            if let Err(e) = serve_connection(&mut stream, &state) {
                tracing::warn!(?peer, error = %e, "connection ended with error");
            }
        });
    }

    Ok(())
}
