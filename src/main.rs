//! `pvsw-master` daemon entry point.
//!
//! Wires the adapters to the control core: SocketCAN for the slave bus,
//! the file store for the supervisory channel, and (until the board
//! sensor drivers land) the scripted simulation adapters for the local
//! analog and discrete I/O.


use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use pvsw_master::adapters::files::FileStore;
use pvsw_master::adapters::sim::{SimGpio, SimSensors};
use pvsw_master::adapters::socketcan::SocketCanBus;
use pvsw_master::bus::{CanTransport, SlaveKind, SlaveLink};
use pvsw_master::config::SystemConfig;
use pvsw_master::error::Error;
use pvsw_master::master::PvswMaster;
use pvsw_master::params::ParameterStore;
use pvsw_master::seismic;

#[derive(Debug, Parser)]
#[command(name = "pvsw-master", about = "Photovoltaic switch-box fleet master")]
struct Args {
    /// CAN interface (overrides the configured channel)
    #[arg(short = 'i', long = "iface")]
    iface: Option<String>,

    /// Directory holding config.json and the parameter definition files
    #[arg(short = 'c', long = "config", default_value = "./Config")]
    config_dir: PathBuf,

    /// Stop after this many seconds (0 = run forever)
    #[arg(short = 'e', long = "expire", default_value_t = 0)]
    expire_secs: u64,

    /// Increase verbosity (can be repeated: -v, -vv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = env_logger::Env::default().default_filter_or(level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    info!("pvsw-master v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SystemConfig::load(&args.config_dir);
    config.file_config.config_path = args.config_dir.to_string_lossy().into_owned();
    let channel = args
        .iface
        .unwrap_or_else(|| config.can_config.channel.clone());

    let _worker = seismic::worker::spawn();

    let bus = SocketCanBus::open(&channel).map_err(Error::from)?;
    let transport = Rc::new(CanTransport::new(bus, &config.j1939_config));

    let (store, addresses) = ParameterStore::from_config_dir(&config.file_config);
    let store = Rc::new(RefCell::new(store));
    let reply_timeout = Duration::from_millis(u64::from(config.pvsw_config.reply_timeout_ms));
    let links = addresses
        .into_iter()
        .map(|address| {
            SlaveLink::new(
                address,
                SlaveKind::Rsd,
                Rc::clone(&transport),
                Rc::clone(&store),
                reply_timeout,
            )
        })
        .collect();

    let files = FileStore::new(config.file_config.clone());
    // Sim adapters stand in for the board I/O until the I2C sensor and
    // GPIO drivers are ported.
    let (sensors, _sensor_handles) = SimSensors::new();
    let (gpio, _gpio_handles) = SimGpio::new();

    let master = Rc::new(PvswMaster::new(
        config, transport, store, links, sensors, gpio, files,
    ));
    let expire = (args.expire_secs > 0).then(|| Duration::from_secs(args.expire_secs));
    master.run(expire)?;
    info!("stopped");
    Ok(())
}
