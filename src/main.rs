use clap::{Parser, Subcommand};
use log::info;
use reparto::config::{Config, ConfigError};
use reparto::Reparto;
use std::path::PathBuf;

// Pingora framework imports
use pingora_core::server::configuration::Opt;

#[derive(Parser)]
#[command(name = "reparto")]
#[command(about = "A sharding proxy for the PostgreSQL wire protocol")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reparto proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/reparto.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_reparto(config)?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

fn run_reparto(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("Failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config);

    info!("Starting reparto v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Listening on: {}", config.server.listen_addr);
    info!("Console on: {}", config.server.admin_addr);

    let mut reparto = Reparto::new(config);
    reparto
        .initialize(Some(Opt::default()))
        .map_err(|e| format!("Failed to initialize reparto: {}", e))?;

    info!("reparto initialized, starting server...");
    reparto
        .run()
        .map_err(|e| format!("Failed to run reparto: {}", e))?;

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output)
        .map_err(|e| format!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your shards and run:");
    println!("  reparto run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Console address: {}", config.server.admin_addr);
            println!("  Shards: {}", config.shards.len());
            for shard in &config.shards {
                println!(
                    "    {}: {} ({} max connections)",
                    shard.name,
                    shard.hosts.join(","),
                    shard.max_connections
                );
            }
            println!("  Rules: {}", config.rules.len());
            for rule in &config.rules {
                println!("    {} ({} pooling)", rule.ident(), rule.pooling_mode);
            }
            println!("  Routing entries: {}", config.routes.len());
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(Box::new(e));
        }
    }

    Ok(())
}

fn show_version() {
    println!("reparto v{}", env!("CARGO_PKG_VERSION"));
    println!("A sharding proxy for the PostgreSQL wire protocol");
    println!();
    println!("Features:");
    println!("  • Session and transaction pooling with per-rule selection");
    println!("  • Statement classification onto shards by table and key range");
    println!("  • Administrative console speaking the same wire protocol");
    println!("  • Bounded per-shard connection pools with health probing");
}

fn init_logging(config: &Config) {
    let log_level = match config.logging.level.as_str() {
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    info!("Logging initialized at level: {:?}", log_level);
}
