use peerpod_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let (pod, router) = peerpod_api::setup::initialize_app(config.clone()).await?;

    peerpod_api::setup::server::start_server(&config, router).await?;

    pod.shutdown().await;
    peerpod_infra::shutdown_telemetry().await;

    Ok(())
}
