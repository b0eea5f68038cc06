use quince::configuration::get_configuration;
use quince::startup::Application;
use quince::telemetry::get_subscriber;
use quince::telemetry::init_subscriber;

/// Initialise telemetry, load config, and start the server.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("quince", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration()?;

    Application::build(cfg).await?.run_until_stopped().await?;

    Ok(())
}
