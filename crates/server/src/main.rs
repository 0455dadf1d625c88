use clap::Parser;
use ghostpixel_server::config::{Args, Settings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ghostpixel=info,ghostpixel_engine=info,ghostpixel_server=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args)?;

    eprintln!("[ghostpixel] server listening on http://{}", settings.addr);
    ghostpixel_server::serve(settings).await
}
