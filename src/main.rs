use clap::Parser;
use ha_sidekick::config::Config;
use ha_sidekick::Sidekick;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "config.yaml")]
    config_path: String,

    /// Overrides `server.port` from the config file.
    #[arg(long)]
    port: Option<u16>,
}

fn init_log() {
    let timer = fmt::time::ChronoLocal::new("%H:%M:%S%.3f".to_string());

    // Configure a custom event formatter
    let format = fmt::format()
        .with_level(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_source_location(true)
        .with_timer(timer)
        .compact();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()
        .expect("RUST_LOG configuration is valid")
        .add_directive("rumqttc=info".parse().expect("Static directive is valid"))
        .add_directive("tungstenite=info".parse().expect("Static directive is valid"));

    fmt().event_format(format).with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_log();
    let args = Args::parse();

    let mut config = Config::from_file(&args.config_path)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let port = config.server.port;
    info!("Starting sidekick. Args: {:?} Namespace: {}", args, config.namespace);

    let sidekick = Sidekick::connect(config).await?;
    info!("{} initialized.", sidekick.namespace());

    tokio::select! {
        result = sidekick.serve(port) => {
            if let Err(err) = result {
                error!("HTTP server failed: {}", err);
                return Err(err.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }
    Ok(())
}
