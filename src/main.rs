use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use aws_encryption_provider::config::Config;
use aws_encryption_provider::health::SharedHealthCheck;
use aws_encryption_provider::kms::{AwsKmsClient, KmsClient};
use aws_encryption_provider::plugin::{V1Plugin, V2Plugin};
use aws_encryption_provider::probe::{Checker, ProbeServer};
use aws_encryption_provider::server::ServerError;
use aws_encryption_provider::{server, shutdown};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .json()
        .init();

    info!("starting aws encryption provider");

    let config = Config::from_env()?;
    let kms: Arc<dyn KmsClient> = Arc::new(AwsKmsClient::new(&config.kms()).await?);

    let health_check = Arc::new(SharedHealthCheck::new(
        config.health_check_period,
        config.err_buf_size,
    ));
    let drain = {
        let health_check = health_check.clone();
        tokio::spawn(async move { health_check.start().await })
    };

    let v1 = V1Plugin::new(
        config.key_arn.clone(),
        kms.clone(),
        config.encryption_context.clone(),
        health_check.clone(),
    );
    let v2 = V2Plugin::new(
        config.key_arn.clone(),
        kms,
        config.encryption_context.clone(),
        health_check.clone(),
    );

    let checker = Arc::new(Checker::new(vec![v1.clone()], vec![v2.clone()]));
    let probe = Arc::new(ProbeServer::new(
        checker,
        config.healthz_path.clone(),
        config.livez_path.clone(),
        config.metrics_path.clone(),
    ));
    let probe_listener = TcpListener::bind(("0.0.0.0", config.health_port)).await?;
    info!(port = config.health_port, "probe server listening");

    let v1_server = server::serve_v1(&config.listen, v1, shutdown::wait_for_signal());
    let v2_server = server::serve_v2(&config.listen_v2, v2, shutdown::wait_for_signal());
    let probe_server = async {
        tokio::select! {
            result = probe.serve(probe_listener) => result.map_err(ServerError::Bind),
            () = shutdown::wait_for_signal() => Ok(()),
        }
    };

    tokio::try_join!(v1_server, v2_server, probe_server)?;

    info!("shutting down");
    health_check.stop().await;
    drain.await?;
    info!("exiting");

    Ok(())
}
