use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use llfc::bus::{Bus, LocalBus};
use llfc::chain::Chain;
use llfc::chain_store::ChainStore;
use llfc::crypto::Hash;
use llfc::events::EventHub;
use llfc::genesis::GenesisConfig;
use llfc::keystore::{self, KeystoreError};
use llfc::node::{prepare_node, NoopSyncer};
use llfc::state::StateStore;
use llfc::storage::RocksDb;

#[derive(Parser)]
#[command(name = "llfc", about = "LLFC consensus node")]
struct Args {
    /// private-key directory, created when missing
    #[arg(short = 'd', long = "node-dir")]
    node_dir: Option<PathBuf>,

    /// keystore password
    #[arg(short = 's', long)]
    seed: Option<String>,

    /// genesis constants file, defaults to <node-dir>/genesis.json
    #[arg(long)]
    genesis: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();
    match run(Args::parse()).await {
        Ok(code) => code,
        Err(err) => {
            log::error!("{}", err);
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let seed = match args.seed {
        Some(seed) if !seed.is_empty() => seed,
        _ => return Err(Box::new(KeystoreError::NotInputSeed)),
    };
    let node_dir = args.node_dir.unwrap_or_else(|| PathBuf::from("./node"));
    std::fs::create_dir_all(&node_dir)?;
    let signer = keystore::load_or_create(&node_dir, &seed)?;

    let db_dir = node_dir.join("db");
    let chain_db = Arc::new(RocksDb::open(db_dir.join("chaindb"))?);
    let state_db = Arc::new(RocksDb::open(db_dir.join("statedb"))?);

    let store = ChainStore::new(chain_db);
    let state = Arc::new(Mutex::new(StateStore::new(state_db, Hash::none())));
    let chain = Arc::new(Chain::new(store, state, signer));
    log::info!("login-user  : {}", chain.nodebase());

    let genesis_path = args
        .genesis
        .unwrap_or_else(|| node_dir.join("genesis.json"));
    let config = GenesisConfig::load(&genesis_path)?;
    if chain.block_from_genesis(&config)? {
        log::info!("genesis declared: {}", config.block_hash);
    } else {
        chain.align_state_root()?;
    }

    let bus: Arc<dyn Bus> = Arc::new(LocalBus::default());
    let hub = EventHub::new();
    let (count, faults) = chain.get_validator_count()?;
    hub.set_info(count, count - faults);

    let node = prepare_node(chain, hub, bus, Arc::new(NoopSyncer))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            Ok(ExitCode::SUCCESS)
        }
        result = node.run() => match result {
            Ok(()) => Ok(ExitCode::SUCCESS),
            Err(err) => {
                log::error!("node stopped: {}", err);
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
