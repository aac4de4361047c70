use crate::bench::{Driver, QuitReason};
use crate::cluster::Cluster;
use crate::error::Result;
use crate::report::Reporter;
use clap::ValueHint::FilePath;
use clap::{Args, Parser, Subcommand};
use log::{debug, warn};
use std::fs::read_to_string;
use std::process::ExitCode;

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(short = 's')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the cluster's TOML config file")]
    cluster_config: String,

    #[arg(short = 'b')]
    #[arg(value_hint = FilePath)]
    #[arg(help = "Path to the benchmark's TOML config file")]
    benchmark_config: String,
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a benchmark against a cluster")]
    Bench(BenchArgs),
    #[command(about = "List all registered cache engines")]
    List,
}

fn bench_cli(args: &BenchArgs) -> Result<()> {
    let opt: String = read_to_string(&args.cluster_config)?
        + "\n"
        + &read_to_string(&args.benchmark_config)?;

    let (cluster_opt, benchmark) = crate::bench::init(&opt)?;
    let driver = Driver::new(benchmark);
    let quit = driver.quit_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        // a second Ctrl-C does not wait for the workers
        if !quit.raise(QuitReason::Interrupted) {
            std::process::exit(130);
        }
        debug!("SIGINT received, stopping the workers");
    }) {
        warn!("Failed to set the Ctrl-C handler: {}", e);
    }

    let reporter = Reporter::new(driver.benchmark().report());
    reporter.echo(&cluster_opt.to_string());
    let (cluster, startup) = Cluster::start(&cluster_opt)?;
    reporter.echo(&startup.to_string());
    let summary = driver.run(&cluster);
    let failed = cluster.teardown();
    if failed > 0 {
        warn!("{} nodes failed to stop", failed);
    }
    summary.map(|_| ())
}

fn list_cli() {
    for name in crate::cluster::registered() {
        println!("Registered engine: {}", name);
    }
}

/// The default command line interface.
///
/// It is public so that a crate with its own engines can call it from its `main`: once the engine
/// constructors are registered, the resulting binary accepts the same arguments as `cachebench`.
/// The returned exit code is non-zero if the run failed before or while setting up the benchmark.
///
/// ## Usage
///
/// To get the usage of the command line interface, users can run:
///
/// ```bash
/// cachebench -h
/// ```
///
/// The interface supports two modes, `bench` and `list`.
///
/// ### Benchmark Mode
///
/// Usage:
///
/// ```bash
/// cachebench bench -s <CLUSTER_CONFIG> -b <BENCH_CONFIG>
/// ```
///
/// Where `CLUSTER_CONFIG` and `BENCH_CONFIG` are the paths to the cluster and benchmark
/// configuration files, respectively. For their format, you can refer to the documentations of
/// [`crate::cluster`] and [`crate::bench`].
///
/// The cluster is provisioned, the benchmark runs once it has fully formed, and all nodes are
/// stopped afterwards. Pressing Ctrl-C stops the measurement early and still prints the summary;
/// pressing it again exits immediately.
///
/// A configuration error, a cluster that does not form within its timeout, or a failure while
/// populating the cache ends the process with a non-zero exit code.
///
/// ### List mode
///
/// Usage:
/// ``` bash
/// cachebench list
/// ```
///
/// This command lists all registered cache engines' names.
pub fn cmdline() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    debug!("Starting cachebench with args: {:?}", cli);
    let result = match cli.command {
        Commands::Bench(args) => bench_cli(&args),
        Commands::List => {
            list_cli();
            Ok(())
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
