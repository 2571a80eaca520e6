//! update-bootstrap - CLI entry point
//!
//! Stages an update package, chooses the engine that executes it and exits
//! with a stable status code for scripting.

use clap::Parser;
use std::path::PathBuf;
use update_engine::bootstrap::Bootstrap;
use update_engine::config::Config;
use update_engine::error::exit;
use update_engine::logger;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the update package (.tar.gz)
    #[arg(value_name = "PACKAGE", required_unless_present = "staged_root")]
    package: Option<PathBuf>,

    /// Run against an already-staged tree (engine handoff; integrity was
    /// verified by the staging bootstrap)
    #[arg(long, value_name = "DIR", hide = true)]
    staged_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    // clap exits 2 on bad usage and 0 for --help/--version.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => e.exit(),
    };

    let config = Config::from_env();
    if let Err(e) = logger::init_with_file(&args.log_level, &config.logs_dir().join("bootstrap.log")) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(exit::USAGE);
    }

    tracing::info!(
        "update-bootstrap v{} (base dir: {})",
        env!("CARGO_PKG_VERSION"),
        config.base_dir.display()
    );

    let bootstrap = Bootstrap::new(config);
    let code = match (&args.staged_root, &args.package) {
        (Some(staged), _) => bootstrap.run_staged(staged).await,
        (None, Some(package)) => bootstrap.run(package).await,
        (None, None) => unreachable!("clap enforces one of package/staged-root"),
    };
    std::process::exit(code);
}
