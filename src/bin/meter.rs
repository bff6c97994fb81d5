use std::process::ExitCode;

use anyhow::Result;
use powerflow::{
    cli, env,
    env::ENV_CONFIG,
    env_broker_connector, log,
    meter::{ProducerLoop, RandomReadings},
    shutdown::ShutdownCoordinator,
};
use tracing::info;

async fn start() -> Result<()> {
    info!(
        broker_type = ENV_CONFIG.broker_type,
        queue = ENV_CONFIG.queue_name,
        "starting meter"
    );

    let connect = env_broker_connector()?;
    let coordinator = ShutdownCoordinator::with_execution_budget(ENV_CONFIG.must_exit_after_24h);
    coordinator.listen_for_signals();

    ProducerLoop::new(coordinator, connect, RandomReadings::new())
        .run()
        .await
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env::load_dotenv();
    log::init();

    cli::dispatch(std::env::args().collect(), start).await
}
