use clap::Parser;
use log::{error, info, warn};
use podfleet::build_context::BuildContext;
use podfleet::channel::TcpChannel;
use podfleet::configuration::config::Config;
use podfleet::file_sync::DirectoryMirror;
use podfleet::fleet_management::FleetManager;
use podfleet::runtime::DockerCli;
use std::path::Path;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "podfleet")]
#[command(version)]
#[command(about = "Warm pools of sandboxed execution pods")]
struct Args {
    config_file: String,

    /// Remove every labeled container before starting and after shutting down
    #[arg(long)]
    clear: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    println!(
        "
==============================================================================
                               podfleet v{}
==============================================================================
",
        env!("CARGO_PKG_VERSION")
    );

    let args = Args::parse();

    if args.config_file.is_empty() {
        error!("No configuration file found");
        std::process::exit(1);
    }

    info!("Importing configuration");
    let config = match Config::from_file(Path::new(args.config_file.as_str())) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.work_dir) {
        error!(
            "Unable to create work dir {}: {}",
            config.work_dir.display(),
            e
        );
        std::process::exit(1);
    }

    let pod_binary = match config.pod_binary_path() {
        Ok(path) => path,
        Err(e) => {
            error!("Pods cannot be built: {}", e);
            std::process::exit(1);
        }
    };
    info!("Shipping {} in pod images", pod_binary.display());

    let channel = match TcpChannel::bind(&config.listen_address, config.public_url.clone()).await
    {
        Ok(channel) => channel,
        Err(e) => {
            error!("Unable to open the pod channel: {}", e);
            std::process::exit(1);
        }
    };

    let docker = DockerCli::new(config.docker_binary.as_str());
    if !docker.is_available().await {
        warn!(
            "{} does not answer, pods will fail to start until it does",
            config.docker_binary
        );
    }

    let manager = FleetManager::new(
        Arc::new(docker),
        Arc::new(channel),
        Arc::new(DirectoryMirror::new(config.sync_interval())),
        BuildContext::new(config.template_dir.clone()).with_pod_binary(pod_binary),
        config.fleet_settings(),
    );

    let clear = args.clear || config.clear_on_shutdown;
    if args.clear {
        if let Err(e) = manager.clear_containers().await {
            warn!("Unable to clear leftover containers: {}", e);
        }
    }

    for pool in &config.warm_pools {
        let fingerprint = pool.fingerprint();
        match manager
            .provision(pool.count, &fingerprint, pool.resources(), false)
            .await
        {
            Ok(started) => info!("Warm pool {} ready with {} pod(s)", fingerprint, started),
            Err(e) => error!("Warm pool {} could not be provisioned: {}", fingerprint, e),
        }
    }

    manager.start_reconciler();

    info!("podfleet running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for the shutdown signal: {}", e);
    }

    info!("Shutting down");
    manager.shutdown();
    if clear {
        if let Err(e) = manager.clear_containers().await {
            error!("Unable to clear containers on shutdown: {}", e);
            std::process::exit(1);
        }
    }
}
