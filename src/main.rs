use cnbpack::builder::Builder;
use cnbpack::cli::commands::{BuildArgs, CliArgs, Commands, InspectBuilderArgs, PullArgs};
use cnbpack::cli::output::{ConsoleHandler, OutputFormatter};
use cnbpack::{
    init_logging, BuildCoordinator, CnbpackConfig, ContainerEngine, DockerEngine, LoggingConfig,
    VERSION,
};

use clap::Parser;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(LoggingConfig::for_cli(
        args.log_level.as_deref(),
        args.verbose,
        args.quiet,
    ));

    debug!("cnbpack v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = match &args.command {
        Commands::Build(build_args) => handle_build(build_args, args.quiet).await,
        Commands::Pull(pull_args) => handle_pull(pull_args).await,
        Commands::InspectBuilder(inspect_args) => handle_inspect_builder(inspect_args).await,
    };

    process::exit(exit_code);
}

fn load_config() -> Option<CnbpackConfig> {
    let config = CnbpackConfig::default();
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        eprintln!("\nPlease check your CNBPACK_* environment variables.");
        return None;
    }
    debug!("{}", config);
    Some(config)
}

async fn connect_engine() -> Option<Arc<DockerEngine>> {
    let engine = match DockerEngine::connect() {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to connect to Docker: {}", e);
            return None;
        }
    };
    match engine.check_available().await {
        Ok(api_version) => debug!("Connected to Docker (API {})", api_version),
        Err(e) => {
            error!("Docker is not available: {}", e);
            eprintln!("\nPossible solutions:");
            eprintln!("  - Ensure the Docker daemon is running");
            eprintln!("  - Check DOCKER_HOST if the daemon is not on the default socket");
            return None;
        }
    }
    Some(Arc::new(engine))
}

async fn handle_build(args: &BuildArgs, quiet: bool) -> i32 {
    info!("Starting build of {}", args.image);

    let request = match args.to_request() {
        Ok(request) => request,
        Err(e) => {
            error!("Invalid build arguments: {:#}", e);
            return 1;
        }
    };

    let Some(mut config) = load_config() else {
        return 1;
    };
    if args.timeout.is_some() {
        config.build_timeout_secs = args.timeout;
        if let Err(e) = config.validate() {
            error!("Configuration error: {}", e);
            return 1;
        }
    }

    let Some(engine) = connect_engine().await else {
        return 1;
    };

    let coordinator = BuildCoordinator::new(engine, config)
        .with_progress(Arc::new(ConsoleHandler::stdout(quiet)));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling build");
            on_interrupt.cancel();
        }
    });

    let result = match coordinator.build(&request, cancel).await {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{}", e.help_message());
            return 1;
        }
    };

    let formatter = OutputFormatter::new(args.format.into());
    match formatter.format_result(&result) {
        Ok(output) => {
            if !quiet || !result.success {
                println!("{}", output);
            }
        }
        Err(e) => {
            error!("Failed to format build result: {}", e);
            return 1;
        }
    }

    if result.success {
        0
    } else {
        if let Err(e) = result.into_result() {
            eprintln!("{}", e.help_message());
        }
        1
    }
}

async fn handle_pull(args: &PullArgs) -> i32 {
    let Some(config) = load_config() else {
        return 1;
    };
    let Some(engine) = connect_engine().await else {
        return 1;
    };

    let coordinator = BuildCoordinator::new(engine, config);
    match coordinator
        .pull_buildpack(&args.uri, args.buildpack_registry.as_deref())
        .await
    {
        Ok(buildpack) => {
            let formatter = OutputFormatter::new(cnbpack::cli::OutputFormat::Human);
            print!("{}", formatter.format_pulled(&args.uri, &buildpack));
            0
        }
        Err(e) => {
            eprintln!("{}", e.help_message());
            1
        }
    }
}

async fn handle_inspect_builder(args: &InspectBuilderArgs) -> i32 {
    let Some(config) = load_config() else {
        return 1;
    };
    let Some(engine) = connect_engine().await else {
        return 1;
    };

    let pull = match args.pull_policy {
        Some(policy) => config.pull_options_with(policy.into()),
        None => config.pull_options(),
    };
    let engine: Arc<dyn ContainerEngine> = engine;
    let builder = match Builder::fetch(engine.as_ref(), &args.image, &pull).await {
        Ok(builder) => builder,
        Err(e) => {
            error!("Failed to inspect builder {}: {}", args.image, e);
            return 1;
        }
    };

    let formatter = OutputFormatter::new(args.format.into());
    match formatter.format_builder(&builder) {
        Ok(output) => {
            println!("{}", output);
            0
        }
        Err(e) => {
            error!("Failed to format builder: {}", e);
            1
        }
    }
}
