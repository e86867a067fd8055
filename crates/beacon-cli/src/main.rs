//! beacon command line.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Resource check scheduler", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, env = "BEACON_CONFIG", default_value = "beacon.kdl")]
    config: String,

    /// Overrides the database url from the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "BEACON_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scanner and checker until interrupted
    Run {
        /// Name this instance claims checks under
        #[arg(long, env = "BEACON_INSTANCE", default_value = "beacon")]
        instance: String,
    },
    /// Apply database migrations
    Migrate,
    /// Validate the system configuration
    Validate,
    /// Create a manually triggered check for a resource or resource type
    Trigger {
        pipeline: String,
        /// Resource (or resource type with --type) name
        name: String,
        #[arg(long = "type")]
        resource_type: bool,
        /// Version to check from, as key=value pairs
        #[arg(long = "from", value_parser = commands::parse_version_field)]
        from_version: Vec<(String, String)>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = commands::load_config(&cli.config, cli.database_url)?;

    match cli.command {
        Commands::Run { instance } => {
            commands::run::run(config, &instance).await?;
        }
        Commands::Migrate => {
            commands::migrate(&config).await?;
        }
        Commands::Validate => {
            commands::validate(&config);
        }
        Commands::Trigger {
            pipeline,
            name,
            resource_type,
            from_version,
        } => {
            let from_version = (!from_version.is_empty()).then(|| from_version.into_iter().collect());
            commands::trigger::trigger(&config, &pipeline, &name, resource_type, from_version)
                .await?;
        }
    }

    Ok(())
}
