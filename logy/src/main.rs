use anyhow::Result;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod async_hid_impl;
mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr so that --json output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    cli::execute().await
}
