pub mod admin;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

pub async fn run(cfg: config::Config) -> anyhow::Result<()> {
    app::run(cfg).await
}
