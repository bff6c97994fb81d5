use std::process::ExitCode;

use anyhow::Result;
use powerflow::{
    cli, env,
    env::ENV_CONFIG,
    env_broker_connector,
    interpolation::PowerCurve,
    log,
    pv::{ConsumerLoop, MessageProcessor},
    results::CsvFileSink,
    shutdown::ShutdownCoordinator,
};
use tracing::info;

async fn start() -> Result<()> {
    info!(
        broker_type = ENV_CONFIG.broker_type,
        queue = ENV_CONFIG.queue_name,
        results_path = %ENV_CONFIG.results_path.display(),
        "starting pv simulator"
    );

    let connect = env_broker_connector()?;
    let sink = CsvFileSink::open(&ENV_CONFIG.results_path)?;
    let processor = MessageProcessor::new(
        PowerCurve::reference(),
        sink,
        ENV_CONFIG.invalid_message_policy,
    );

    let coordinator = ShutdownCoordinator::with_execution_budget(ENV_CONFIG.must_exit_after_24h);
    coordinator.listen_for_signals();

    ConsumerLoop::new(coordinator, connect, processor)
        .run()
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env::load_dotenv();
    log::init();

    cli::dispatch(std::env::args().collect(), start).await
}
