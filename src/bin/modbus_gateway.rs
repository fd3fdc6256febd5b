/// Modbus Gateway
///
/// Usage: `modbus_gateway <config.yml>`
///
/// Polls every configured point, reads newline-delimited JSON intents from
/// stdin and prints each result as one JSON line on stdout. Logs go to
/// stderr. Ctrl+C stops the gateway.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use voltage_modbus_gateway::logging::init_logging;
use voltage_modbus_gateway::{
    info as library_info, Gateway, GatewayConfig, NetworkTransportFactory, PointResult, ResultPublisher,
    StaticDirectory,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = match std::env::args().nth(1) {
        Some(path) => path,
        None => bail!("usage: modbus_gateway <config.yml>"),
    };

    let config = GatewayConfig::load(&path).with_context(|| format!("loading {}", path))?;
    init_logging(&config.log_level)?;
    info!("{}", library_info());
    info!("Loaded {} point(s) from {}", config.points.len(), path);

    let directory = Arc::new(StaticDirectory::new(config.points.clone())?);
    let factory = Arc::new(NetworkTransportFactory::from_config(&config));
    let publisher: Arc<dyn ResultPublisher> = Arc::new(|result: PointResult| match serde_json::to_string(&result) {
        Ok(line) => println!("{}", line),
        Err(e) => error!("Cannot serialise result for {}: {}", result.point, e),
    });

    let gateway = Gateway::start(&config, directory, factory, publisher)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Received interrupt signal, stopping gateway..."),
                    Err(e) => error!("Failed to listen for interrupt signal: {}", e),
                }
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = gateway.submit_intent(line) {
                        warn!("Intent dropped: {}", e);
                    }
                }
                Ok(None) => {
                    info!("stdin closed, polling continues until interrupted");
                    stdin_open = false;
                }
                Err(e) => {
                    error!("stdin read failed: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    gateway.shutdown().await;
    Ok(())
}
