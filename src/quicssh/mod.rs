pub mod app;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod net;
pub mod relay;
pub mod shutdown;
pub mod tunnel;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    log_level: Option<String>,
    command: app::Command,
) -> anyhow::Result<()> {
    app::run(config_path, log_level, command).await
}
