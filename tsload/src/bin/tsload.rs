use std::{
    env,
    net::SocketAddr,
    num::NonZeroUsize,
    path::Path,
};

use clap::{Args, Parser, Subcommand};
use http::Uri;
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    runtime::Builder,
    signal,
    time::{Duration, sleep},
};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};
use tsload::{
    config::{self, Config, Telemetry},
    controller::{self, Controller},
    sink,
};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to load tsload config: {0}")]
    Config(#[from] config::Error),
    #[error(transparent)]
    Controller(#[from] controller::Error),
    #[error("Failed to build the sink: {0}")]
    Sink(#[from] sink::Error),
    #[error("Invalid store address: {0}")]
    Addr(#[from] http::uri::InvalidUri),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

fn default_config_path() -> String {
    "/etc/tsload/tsload.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tsload with specified configuration
    Run(Box<RunCommand>),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// address of the store, `host:port` or a full `http://` URI
    #[clap(long)]
    addr: Option<String>,
    /// database to write to
    #[clap(long)]
    database: Option<String>,
    /// points per write
    #[clap(long)]
    batch_size: Option<NonZeroUsize>,
    /// pause after every write, in milliseconds
    #[clap(long)]
    batch_interval_millis: Option<u64>,
    /// number of simulated servers per data center
    #[clap(long)]
    server_count: Option<u32>,
    /// drop the database before creating it
    #[clap(long)]
    reset_database: bool,
    /// do not write response times back to the store
    #[clap(long)]
    no_self_metrics: bool,
    /// address to bind prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
    /// the time, in seconds, to run for; runs until interrupted if absent
    #[clap(long)]
    duration_seconds: Option<u64>,
    /// the maximum time to wait, in seconds, for the runtime to shut down
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config(config_path: &str) -> Result<Config, Error> {
    if let Ok(env_var_value) = env::var("TSLOAD_CONFIG") {
        debug!("Using config from env var 'TSLOAD_CONFIG'");
        return Ok(Config::from_yaml(&env_var_value)?);
    }
    let path = Path::new(config_path);
    if config_path == default_config_path() && !path.exists() {
        info!("No configuration file at {config_path}, using defaults");
        return Ok(Config::default());
    }
    debug!("Attempting to open configuration file at: {config_path}");
    Config::load(path).map_err(|err| {
        error!("Could not load config file '{config_path}': {err}");
        Error::Config(err)
    })
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let config = load_config(config_path)?;
    info!(
        "Configuration file is valid, {} series over {} kinds",
        config.series_count(),
        config.kinds.len()
    );
    Ok(config)
}

fn store_uri(addr: &str) -> Result<Uri, Error> {
    let uri = if addr.contains("://") {
        addr.parse()?
    } else {
        format!("http://{addr}").parse()?
    };
    Ok(uri)
}

fn get_config(args: &RunCommand, contents: Option<String>) -> Result<Config, Error> {
    let mut config = if let Some(contents) = contents {
        Config::from_yaml(&contents)?
    } else {
        load_config(&args.config_path)?
    };

    if let Some(ref addr) = args.addr {
        let uri = store_uri(addr)?;
        match config.sink {
            sink::Config::Http(ref mut http) => http.uri = uri,
            sink::Config::Discard => {
                config.sink = sink::Config::Http(sink::http::Config {
                    uri,
                    ..sink::http::Config::default()
                });
            }
        }
    }
    if let Some(ref database) = args.database {
        config.database.name.clone_from(database);
    }
    if let Some(size) = args.batch_size {
        config.batch.size = size;
    }
    if let Some(interval) = args.batch_interval_millis {
        config.batch.interval_millis = interval;
    }
    if let Some(count) = args.server_count {
        config.set_dimension_count("server", count)?;
    }
    if args.reset_database {
        config.database.reset = true;
    }
    if args.no_self_metrics {
        config.self_metrics.enabled = false;
    }
    if let Some(addr) = args.prometheus_addr {
        let global_labels = match config.telemetry.take() {
            Some(Telemetry::Prometheus { global_labels, .. }) => global_labels,
            None => Default::default(),
        };
        config.telemetry = Some(Telemetry::Prometheus {
            addr,
            global_labels,
        });
    }

    config.validate()?;
    Ok(config)
}

async fn inner_main(duration: Option<Duration>, config: Config) -> Result<(), Error> {
    if let Some(Telemetry::Prometheus {
        addr,
        ref global_labels,
    }) = config.telemetry
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        builder.install()?;
        info!("prometheus exporter listening on {addr}");
    }

    let sink = sink::Backend::new(config.sink.clone())?;
    let controller = Controller::new(config)?;

    let stop = async move {
        let interrupted = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("received ctrl-c"),
                Err(err) => error!("Could not listen for ctrl-c: {err}"),
            }
        };
        match duration {
            Some(duration) => {
                tokio::select! {
                    () = interrupted => {},
                    () = sleep(duration) => info!("run duration elapsed, signaling for shutdown"),
                }
            }
            None => interrupted.await,
        }
    };

    let report = controller.run_until(sink, stop).await?;
    match report.stats {
        Some(stats) => info!(
            "{} series wrote {} points in {} batches, {} batches and {} response time batches lost to transient errors, {} points discarded at shutdown",
            report.series,
            stats.points_written,
            stats.batches_written,
            stats.transient_failures,
            stats.self_metric_failures,
            stats.points_discarded,
        ),
        None => info!(
            "{} series stopped, the final write was abandoned",
            report.series
        ),
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting tsload {version} run.");

    let args = match Cli::parse().command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(config_check_cmd) => {
            match validate_config(&config_check_cmd.config_path) {
                Ok(_) => std::process::exit(0),
                Err(err) => {
                    error!("Configuration validation failed: {err}");
                    std::process::exit(1)
                }
            }
        }
    };

    let config = get_config(&args, None)?;
    let duration = args.duration_seconds.map(Duration::from_secs);
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(duration, config));
    // Generators abandoned by a fatal error are still parked on the runtime.
    info!("Shutting down runtime with a {max_shutdown_delay:?} timeout");
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> Box<RunCommand> {
        let mut args = vec!["tsload", "run"];
        args.extend_from_slice(extra);
        match Cli::parse_from(args).command {
            Commands::Run(run_cmd) => run_cmd,
            Commands::ConfigCheck(_) => panic!("parsed the wrong subcommand"),
        }
    }

    #[test]
    fn overrides_apply_on_top_of_file() {
        let args = run_args(&[
            "--addr",
            "influx.local:9999",
            "--database",
            "load",
            "--batch-size",
            "100",
            "--batch-interval-millis",
            "5",
            "--server-count",
            "10",
            "--reset-database",
            "--no-self-metrics",
        ]);
        let config = get_config(&args, Some("sink: discard\n".to_string()))
            .expect("Could not convert to valid Config");

        match &config.sink {
            sink::Config::Http(http) => {
                assert_eq!(http.uri, Uri::from_static("http://influx.local:9999"));
            }
            sink::Config::Discard => panic!("--addr did not select the http sink"),
        }
        assert_eq!(config.database.name, "load");
        assert_eq!(config.batch.size.get(), 100);
        assert_eq!(config.batch.interval_millis, 5);
        assert_eq!(config.series_count(), 6 * 9 * 4 * 3 * 10);
        assert!(config.database.reset);
        assert!(!config.self_metrics.enabled);
    }

    #[test]
    fn no_overrides_keeps_defaults() {
        let args = run_args(&[]);
        let config = get_config(&args, Some("{}".to_string())).expect("valid config");
        assert_eq!(config, Config::default());
        assert_eq!(args.config_path, default_config_path());
        assert_eq!(args.max_shutdown_delay, 30);
        assert!(args.duration_seconds.is_none());
    }

    #[test]
    fn addr_accepts_full_uri() {
        let uri = store_uri("http://influx.example.com:8086").expect("valid uri");
        assert_eq!(uri.scheme_str(), Some("http"));
        assert_eq!(uri.port_u16(), Some(8086));
    }

    #[test]
    fn https_addr_fails_sink_construction() {
        let args = run_args(&["--addr", "https://influx.example.com:8086"]);
        let config = get_config(&args, Some("{}".to_string())).expect("valid config");
        assert!(matches!(
            sink::Backend::new(config.sink),
            Err(sink::Error::InvalidUri(_))
        ));
    }

    #[test]
    fn config_check_parses() {
        let cli = Cli::parse_from(["tsload", "config-check", "--config-path", "/tmp/x.yaml"]);
        match cli.command {
            Commands::ConfigCheck(cmd) => assert_eq!(cmd.config_path, "/tmp/x.yaml"),
            Commands::Run(_) => panic!("parsed the wrong subcommand"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inner_main_runs_for_duration() {
        let contents = r#"
sink: discard
dimensions:
  - name: "server"
    count: 4
kinds:
  - name: "cpu"
    interval_micros: 10000
    model:
      gauge: {}
batch:
  size: 10
"#;
        let config = get_config(&run_args(&[]), Some(contents.to_string()))
            .expect("Could not convert to valid Config");
        tokio::time::timeout(
            Duration::from_secs(10),
            inner_main(Some(Duration::from_millis(250)), config),
        )
        .await
        .expect("run did not stop")
        .expect("run failed");
    }
}
