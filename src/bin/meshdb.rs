/*
 * meshdb is a replicated transactional database node. It takes configuration
 * via a configuration file and environment variables, connects to the
 * configured peer cluster, and takes part in leader election and commit
 * replication. The command server that feeds it application commands runs
 * out of process and is stubbed here with a logger.
 */

#![warn(clippy::all)]

use meshdb::cluster::transport::Tcp;
use meshdb::cluster::{Command, CommandServer, Options, Peers, Server};
use meshdb::error::Result;
use meshdb::store::{Memory, Pool, Store};

use serde_derive::Deserialize;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("Starts a meshdb replication node.")
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/meshdb.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("meshdb");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let (id, peers) = Peers::parse(&cfg.peers, &cfg.name)?;
    let store: Arc<dyn Store> = Arc::new(Memory::new());
    let pool = Arc::new(Pool::new(store.as_ref(), cfg.replication_pool));
    let transport = Arc::new(Tcp::new(&cfg.listen, &peers)?);
    let opts = Options {
        parallel_replication: cfg.parallel_replication,
        quorum_checkpoint: Duration::from_secs(cfg.quorum_checkpoint_secs),
        ..Options::default()
    };
    let (server, _handle) = Server::new(
        id,
        &cfg.name,
        env!("CARGO_PKG_VERSION"),
        cfg.priority,
        &cfg.command_address,
        peers,
        store,
        pool,
        Arc::new(LogCommands),
        transport,
        opts,
    )?;
    server.serve()
}

/// A placeholder command server that logs commands. The real command server
/// runs outside this crate and feeds the node through the same trait.
struct LogCommands;

impl CommandServer for LogCommands {
    fn accept_command(&self, command: Command) {
        log::info!("Accepted command {}: {}", command.id, command.request);
    }

    fn complete_command(&self, command: Command) {
        log::info!("Completed command {}", command.id);
    }
}

#[derive(Debug, Deserialize)]
struct Config {
    name: String,
    listen: String,
    command_address: String,
    peers: String,
    priority: i64,
    log_level: String,
    parallel_replication: bool,
    replication_pool: usize,
    quorum_checkpoint_secs: u64,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("listen", "0.0.0.0:9705")?
            .set_default("command_address", "localhost:9605")?
            .set_default("priority", 100)?
            .set_default("log_level", "info")?
            .set_default("parallel_replication", true)?
            .set_default("replication_pool", 8)?
            .set_default("quorum_checkpoint_secs", 60)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("MESHDB"))
            .build()?
            .try_deserialize()?)
    }
}
