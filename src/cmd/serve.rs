//! Management server command: `progeny serve`.

use anyhow::Result;

use progeny::config::ProgenyConfig;
use progeny::spinner::manager::LifecycleManager;
use progeny::spinner::server::{ServerConfig, start_server};

pub async fn cmd_serve(config: ProgenyConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!(%warning, "Configuration warning");
    }

    let mut server_config = ServerConfig::from_config(&config);
    if let Some(host) = host {
        server_config.host = host;
    }
    if let Some(port) = port {
        server_config.port = port;
    }

    let (manager, _) = LifecycleManager::open(&config).await?;
    start_server(server_config, manager).await
}
