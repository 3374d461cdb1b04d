use std::{env, io::Read, net::SocketAddr, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{runtime::Builder, signal, task::JoinSet};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};
use trafficgen::{
    api::{self, Api},
    config::{self, Config},
    control::Control,
    generator::{self, Generator},
    signals,
    sink::JsonLines,
};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to parse trafficgen config: {0}")]
    Config(#[from] config::Error),
    #[error("Generator could not be built: {0}")]
    Generator(#[from] generator::Error),
    #[error("Control API failed: {0}")]
    Api(#[from] api::Error),
    #[error("Prometheus exporter could not be installed: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

fn default_config_path() -> String {
    "/etc/trafficgen/trafficgen.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run trafficgen with specified configuration
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// address to bind the prometheus exporter to, no exporter if absent
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
    /// seconds to wait for tasks to finish at shutdown
    #[clap(long, default_value_t = 5)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var("TRAFFICGEN_CONFIG") {
        debug!("Using config from env var 'TRAFFICGEN_CONFIG'");
        Ok(env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {config_path}");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(|err| {
                error!("Could not read config file '{config_path}': {err}");
                err
            })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let contents = load_config_contents(config_path)?;
    let config = config::parse(&contents).map_err(|err| {
        error!("Configuration validation failed: {err}");
        err
    })?;
    info!("Configuration file is valid");
    Ok(config)
}

/// Load the configuration, degrading to defaults when it is missing or
/// invalid.
fn get_config(config_path: &str) -> Config {
    match load_config_contents(config_path).and_then(|contents| Ok(config::parse(&contents)?)) {
        Ok(config) => config,
        Err(err) => {
            warn!("Using default configuration: {err}");
            Config::default()
        }
    }
}

async fn inner_main(config: Config, prometheus_addr: Option<SocketAddr>) -> Result<(), Error> {
    if let Some(addr) = prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("prometheus exporter listening on {addr}");
    }

    let (shutdown_watcher, shutdown_broadcast) = signals::signal();
    let control = Control::new(
        config.enabled,
        config.min_interval,
        config.max_interval,
        Arc::new(config.region_table()),
    );

    let api = Api::bind(&config.api, control.clone(), shutdown_watcher.register()).await?;
    let generator = Generator::new(
        &config,
        control,
        JsonLines::stdout(),
        shutdown_watcher.register(),
    )?;
    // A watcher left alive here would stall `signal_and_wait` below.
    drop(shutdown_watcher);

    let mut api_joinset = JoinSet::new();
    api_joinset.spawn(api.run());
    let mut gsrv_joinset = JoinSet::new();
    gsrv_joinset.spawn(generator.spin());

    let res = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
            Ok(())
        },
        Some(res) = api_joinset.join_next() => {
            match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!("Control API shut down unexpectedly: {err}");
                    Err(Error::Api(err))
                }
                Err(err) => {
                    error!("Could not join the spawned API task: {err}");
                    Ok(())
                }
            }
        },
        Some(res) = gsrv_joinset.join_next() => {
            if let Err(err) = res {
                error!("Could not join the spawned generator task: {err}");
            }
            Ok(())
        },
    };
    shutdown_broadcast.signal_and_wait().await;
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting trafficgen {version}.");

    let args = match Cli::parse().command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(config_check_cmd) => {
            match validate_config(&config_check_cmd.config_path) {
                Ok(_) => std::process::exit(0),
                Err(_) => std::process::exit(1),
            }
        }
    };

    let config = get_config(&args.config_path);
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, args.prometheus_addr));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
