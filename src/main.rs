use clap::Parser;
use tracing_subscriber::EnvFilter;

use authbridge::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    authbridge::bootstrap::load_bridge_env();
    init_tracing();

    let cli = Cli::parse();
    cli::run(cli).await
}

/// stderr logging, filtered by `RUST_LOG` (default `authbridge=info`).
/// `AUTHBRIDGE_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("authbridge=info"));
    let json = std::env::var("AUTHBRIDGE_LOG_FORMAT")
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}
