//! `bmp serve`.

use anyhow::Result;

use bmp::config::PlatformConfig;
use bmp::platform::server::{ServerConfig, start_server};

pub async fn cmd_serve(config: PlatformConfig, port: Option<u16>, host: &str, dev: bool) -> Result<()> {
    let server = ServerConfig {
        port: port.unwrap_or(config.settings.platform.listen_port),
        host: host.to_string(),
        dev_mode: dev,
    };
    start_server(config, server).await
}
