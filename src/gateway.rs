//! Gateway assembly: one Request Manager, the response and write workers,
//! and the polling scheduler, started and stopped together.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::directory::PointDirectory;
use crate::error::{ModbusError, ModbusResult};
use crate::initiator::{PendingTable, RequestInitiator};
use crate::manager::RequestManager;
use crate::queue::ShutdownTrigger;
use crate::response::{ResponseProcessor, ResultPublisher};
use crate::scheduler::{PollingScheduler, TimeMapper};
use crate::transport::TransportFactory;
use crate::write_handler::WriteHandler;

/// Running gateway
pub struct Gateway {
    manager: Arc<RequestManager>,
    processor: Arc<ResponseProcessor>,
    write_handler: Arc<WriteHandler>,
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
}

fn polling_schedule(config: &GatewayConfig, directory: &dyn PointDirectory) -> ModbusResult<TimeMapper> {
    let mut mapper = TimeMapper::new(config.mode);
    for point in directory.points() {
        if point.polling_interval_ms.is_some() {
            mapper.register(point)?;
        }
    }
    Ok(mapper)
}

impl Gateway {
    /// Start the stack, register every polled point and spawn all workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &GatewayConfig,
        directory: Arc<dyn PointDirectory>,
        factory: Arc<dyn TransportFactory>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> ModbusResult<Self> {
        if factory.format() != config.mode {
            return Err(ModbusError::configuration(format!(
                "Transport speaks {} but the gateway is configured for {}",
                factory.format(),
                config.mode
            )));
        }

        // Schedule before the stack starts so a bad point leaves nothing running.
        let mapper = polling_schedule(config, directory.as_ref())?;

        let manager = Arc::new(RequestManager::new(factory, config.max_requests_in_flight));
        let status = manager.set_stack_config(config.stack_config());
        if !status.is_success() {
            return Err(ModbusError::configuration(format!("Stack configuration rejected: {}", status)));
        }
        let status = manager.start();
        if !status.is_success() {
            return Err(ModbusError::internal(format!("Stack failed to start: {}", status)));
        }

        let pending = Arc::new(PendingTable::new());
        let processor = ResponseProcessor::new(
            Arc::clone(&pending),
            Arc::clone(&publisher),
            config.max_requests_in_flight * 2,
        );
        let completion = processor.completion_handler();

        let initiator = Arc::new(RequestInitiator::new(
            Arc::clone(&manager),
            Arc::clone(&pending),
            Arc::clone(&completion),
            Arc::clone(&publisher),
        ));
        let write_handler = WriteHandler::new(
            config.write_queue_capacity,
            directory,
            Arc::clone(&manager),
            pending,
            completion,
            publisher,
        );

        let trigger = ShutdownTrigger::new();
        let shutdown = trigger.subscribe();
        let mut tasks = processor.spawn_workers(config.response_workers, &shutdown);
        tasks.extend(write_handler.spawn_workers(config.write_workers, &shutdown));
        tasks.push(tokio::spawn(PollingScheduler::new(mapper, initiator, shutdown).run()));

        info!(
            "Gateway started in {} mode: {} write worker(s), {} response worker(s)",
            config.mode, config.write_workers, config.response_workers
        );
        Ok(Self {
            manager,
            processor,
            write_handler,
            trigger,
            tasks,
        })
    }

    pub fn manager(&self) -> &Arc<RequestManager> {
        &self.manager
    }

    /// Queue a raw on-demand intent
    pub fn submit_intent(&self, raw: String) -> ModbusResult<()> {
        self.write_handler.submit(raw)
    }

    /// Stop the scheduler and workers, then drain the stack.
    ///
    /// Requests still in flight complete with a shutdown status and their
    /// results are published before this returns.
    pub async fn shutdown(self) {
        self.trigger.trigger();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!("Gateway task ended abnormally: {}", e);
            }
        }
        self.manager.shutdown().await;
        let flushed = self.processor.drain();
        info!("Gateway stopped ({} result(s) flushed)", flushed);
    }
}
