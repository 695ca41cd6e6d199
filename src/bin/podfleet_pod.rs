use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use podfleet::channel::tcp_channel::connect_pod;
use podfleet::sandbox::{read_preload, Language, PodInstance, ScriptInterpreter};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Runtime {
    Python,
    Node,
}

impl From<Runtime> for Language {
    fn from(runtime: Runtime) -> Self {
        match runtime {
            Runtime::Python => Language::Python,
            Runtime::Node => Language::Node,
        }
    }
}

#[derive(Parser)]
#[command(name = "podfleet-pod")]
#[command(version)]
#[command(about = "Runs inside a pod and serves executions to the fleet manager")]
struct Args {
    /// Address of the fleet manager
    #[arg(long, env = "PODFLEET_URL")]
    url: String,

    /// Route the manager assigned to this pod
    #[arg(long, env = "PODFLEET_ROUTE")]
    route: String,

    #[arg(long, env = "PODFLEET_KEY", hide_env_values = true)]
    key: String,

    #[arg(long, env = "PODFLEET_POD_NAME")]
    name: Option<String>,

    /// File listing the modules to import before the first execution
    #[arg(long)]
    preload: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Runtime::Python)]
    language: Runtime,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();
    let name = args.name.as_deref().unwrap_or("pod");

    let preload = match &args.preload {
        Some(path) => match read_preload(path) {
            Ok(modules) => modules,
            Err(e) => {
                warn!("Unable to read preload list {}: {}", path.display(), e);
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let interpreter = match ScriptInterpreter::new(args.language.into(), &preload) {
        Ok(interpreter) => interpreter,
        Err(e) => {
            error!("Unable to set up the interpreter: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = interpreter.warm_up().await {
        error!("Unable to start the interpreter: {}", e);
        std::process::exit(1);
    }

    let instance = Arc::new(PodInstance::new(Box::new(interpreter)));
    let endpoint = match connect_pod(&args.url, &args.route, &args.key, instance).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("{} unable to reach the fleet manager: {}", name, e);
            std::process::exit(1);
        }
    };

    info!("{} ready", name);
    endpoint.run_until_stopped().await;
    info!("{} stopped", name);
}
