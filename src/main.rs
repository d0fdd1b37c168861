use std::env;

use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> reliq::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = env::args().nth(1);
    let settings = reliq::config::Settings::load(config_path.as_deref())?;

    let manager = reliq::start(&settings)?;
    info!(port = settings.rpc.port, "broker starting");

    reliq::server::serve(manager, settings.rpc.clone()).await
}
