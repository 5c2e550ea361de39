//! `navsim-server`: the simulated navigation tool server on stdio.

use navlink::config::LogConfig;
use navlink::{logging, navsim};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = std::env::var("NAVSIM_LOG").unwrap_or_else(|_| "navlink=info,warn".to_string());
    logging::init_tracing(
        "navsim-server",
        &LogConfig {
            level,
            ..LogConfig::default()
        },
    )?;

    let options = navsim::SimOptions::from_env()?;
    navsim::serve(tokio::io::stdin(), tokio::io::stdout(), options).await
}
