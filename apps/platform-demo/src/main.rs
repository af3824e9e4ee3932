//! Demo service: one gRPC listener, a REST gateway in front of it and a plain
//! HTTP listener, all stopped together on SIGINT/SIGTERM.

mod server;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    server::run().await
}
