use annex_bridge::{
    serve, AnnexIo, AnnexRepo, ArchiveRemote, Config, Engine, HttpDownloader, LocationCache,
    WebRemote,
};
use anyhow::Result;
use clap::{Parser, Subcommand};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "annex-bridge")]
#[command(version = VERSION)]
#[command(about = "git-annex special remotes for archive- and web-backed content")]
struct Cli {
    /// Enable debug logging (stderr)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the archive-backed special remote over stdin/stdout
    Archive,
    /// Serve the web special remote over stdin/stdout
    Web,
    /// Show or reset the configuration
    Config {
        /// Write the default configuration back out
        #[arg(long)]
        reset: bool,
    },
}

/// Log to stderr only: stdout carries the special-remote wire protocol.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .target(env_logger::Target::Stderr)
        .init();
}

fn serve_archive(config: &Config) -> Result<i32> {
    let cwd = std::env::current_dir()?;
    let repo = AnnexRepo::discover(&cwd)?.annex_bin(config.git_annex_bin.clone());
    let remote = ArchiveRemote::new(repo, config.extraction_root.clone())
        .with_cost(config.cost)
        .with_location_cache(LocationCache::new(config.location_cache_size));
    let mut engine = Engine::new(remote, AnnexIo::stdio());
    Ok(serve(&mut engine))
}

fn serve_web(config: &Config) -> Result<i32> {
    let remote = WebRemote::new(Box::new(HttpDownloader::new()?)).with_cost(config.cost);
    let mut engine = Engine::new(remote, AnnexIo::stdio());
    Ok(serve(&mut engine))
}

/// Map a serving result to an exit code. A startup failure still emits an
/// `ERROR` line on stdout so the host is not left waiting for the version
/// announcement.
fn exit_code(result: Result<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            log::error!("startup failed: {:#}", e);
            println!("ERROR {}", format!("{:#}", e).replace(['\n', '\r'], "; "));
            1
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Archive => {
            let config = Config::load()?;
            std::process::exit(exit_code(serve_archive(&config)));
        }
        Commands::Web => {
            let config = Config::load()?;
            std::process::exit(exit_code(serve_web(&config)));
        }
        Commands::Config { reset } => {
            let config = if reset {
                let config = Config::default();
                config.save()?;
                config
            } else {
                Config::load()?
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
