mod alarm;
mod api;
mod config;
mod controller;
mod error;
mod logging;
mod output;
mod protocol;
mod remote;
mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, info};

use crate::alarm::model::JsonFileRepository;
use crate::alarm::queue::processing_queue;
use crate::alarm::store::AlarmStore;
use crate::api::{ApiServer, ApiServerConfig};
use crate::config::load_config;
use crate::controller::Controller;
use crate::output::{LightOutput, LoggedLight, LoggedSound};
use crate::protocol::{CommandRegistry, LineServer};
use crate::remote::Remote;
use crate::shutdown::ShutdownSignal;

#[derive(Parser, Debug)]
#[command(
    name = "wakeclock",
    version,
    about = "Wake-up alarm daemon with sound and light fading"
)]
struct Cli {
    #[arg(long, default_value = "wakeclock.json")]
    config: PathBuf,

    #[arg(long, default_value = "alarms.json")]
    alarms: PathBuf,

    /// Overrides network.command_port; 0 disables the line protocol.
    #[arg(long)]
    command_port: Option<u16>,

    /// Overrides network.http_port; 0 disables HTTP.
    #[arg(long)]
    http_port: Option<u16>,

    #[arg(long)]
    bind: Option<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Load configuration and alarms, print a summary and exit.
    #[arg(long)]
    check: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    if cli.poll_ms == 0 {
        bail!("--poll-ms must be greater than zero");
    }
    let log = logging::init(&cli.log_level)?;

    let mut config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(port) = cli.command_port {
        config.network.command_port = port;
    }
    if let Some(port) = cli.http_port {
        config.network.http_port = port;
    }
    if let Some(bind) = cli.bind {
        config.network.bind = bind;
    }
    debug!("configuration:\n{}", config.dump());

    let repository = JsonFileRepository::new(&cli.alarms);
    debug!("alarms are stored in {}", repository.path().display());
    let (notifier, queue) = processing_queue();
    let store = Arc::new(AlarmStore::open(
        &config.alarm,
        config.sounds.clone(),
        Box::new(repository),
        notifier.clone(),
    ));

    if cli.check {
        print!("{}", config.dump());
        println!("stored alarms: {}", store.list().len());
        return Ok(());
    }

    let lights = config
        .lights
        .iter()
        .map(|light| {
            Box::new(LoggedLight::new(light.id, light.name.clone(), light.kind))
                as Box<dyn LightOutput>
        })
        .collect();
    let controller = Controller::new(
        Arc::clone(&store),
        queue,
        notifier,
        Box::new(LoggedSound::default()),
        lights,
        config.volume_default,
    );
    let shutdown = ShutdownSignal::install()?;
    let remote = Remote::new(Arc::clone(&store), controller.controls());
    let controller = controller.spawn(Duration::from_millis(cli.poll_ms))?;

    let network = &config.network;
    let line_server = if network.command_port == 0 {
        info!("command server disabled");
        None
    } else {
        let registry = Arc::new(CommandRegistry::standard(log)?);
        Some(LineServer::start(
            &network.bind,
            network.command_port,
            config.name.clone(),
            registry,
            remote.clone(),
        )?)
    };
    let api_server = if network.http_port == 0 {
        info!("HTTP server disabled");
        None
    } else {
        Some(
            ApiServer::start(
                ApiServerConfig {
                    bind_addr: network.bind.clone(),
                    port: network.http_port,
                },
                config.name.clone(),
                remote,
            )
            .with_context(|| {
                format!(
                    "failed to start HTTP server at {}:{}",
                    network.bind, network.http_port
                )
            })?,
        )
    };

    info!("{} running with {} alarms", config.name, store.list().len());
    let signal = shutdown.wait()?;
    info!("{signal} received, shutting down");
    drop(api_server);
    drop(line_server);
    drop(controller);
    Ok(())
}
