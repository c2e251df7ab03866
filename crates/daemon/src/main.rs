//! CraftBlock daemon entry point

use craftblock_daemon::config::DaemonConfig;
use craftblock_daemon::logging::init_logging;
use craftblock_daemon::service::{self, BoxError};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_logging();

    info!("CraftBlock daemon starting...");

    let data_dir = service::default_data_dir();
    let config = DaemonConfig::load_or_init(&data_dir);

    service::run_daemon(config, data_dir).await
}
