use chatrelay::relay::{client, server};
use chatrelay::RelayConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = RelayConfig::from_env()?;
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        None | Some("server") => {
            info!("chatrelay server starting on port {}", config.port);
            server::run(config).await
        }
        Some("client") => match args.get(2) {
            Some(username) => client::run(&config, username).await,
            None => {
                eprintln!("usage: chatrelay client <username>");
                std::process::exit(2);
            }
        },
        Some(other) => {
            eprintln!("unknown mode: {other}");
            eprintln!("usage: chatrelay [server] | chatrelay client <username>");
            std::process::exit(2);
        }
    }
}
