//! Time Mapper and polling scheduler.
//!
//! Points are grouped into one bucket per polling interval. A single clock
//! ticks at the greatest common divisor of all intervals (never below the
//! mode's floor) and adds the measured wall-clock delta to every bucket. A
//! bucket whose accumulated time reaches its interval is due; its counter is
//! reset to zero rather than reduced by the interval, so a late tick does not
//! carry drift into the next cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::directory::PointConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::FrameFormat;
use crate::initiator::RequestInitiator;
use crate::queue::Shutdown;
use crate::utils::{gcd_all, round_up_to_multiple};

/// Scheduler floor in TCP mode (ms)
pub const MIN_TICK_TCP_MS: u64 = 25;

/// Scheduler floor in RTU mode (ms)
pub const MIN_TICK_RTU_MS: u64 = 100;

pub fn min_tick_ms(mode: FrameFormat) -> u64 {
    match mode {
        FrameFormat::Tcp => MIN_TICK_TCP_MS,
        FrameFormat::Rtu => MIN_TICK_RTU_MS,
    }
}

/// Points sharing one polling interval
#[derive(Debug, Clone)]
pub struct PollingBucket {
    pub interval_ms: u64,
    pub points: Vec<Arc<PointConfig>>,
    elapsed: Duration,
    fired: u64,
}

impl PollingBucket {
    fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            points: Vec::new(),
            elapsed: Duration::ZERO,
            fired: 0,
        }
    }

    /// Number of times the bucket has been due
    pub fn fired(&self) -> u64 {
        self.fired
    }
}

/// Interval buckets and the tick that drives them
#[derive(Debug, Clone)]
pub struct TimeMapper {
    floor_ms: u64,
    buckets: BTreeMap<u64, PollingBucket>,
}

impl TimeMapper {
    pub fn new(mode: FrameFormat) -> Self {
        Self::with_floor(min_tick_ms(mode))
    }

    pub fn with_floor(floor_ms: u64) -> Self {
        Self {
            floor_ms: floor_ms.max(1),
            buckets: BTreeMap::new(),
        }
    }

    /// Add a point to the bucket of its interval.
    ///
    /// Intervals that are not a multiple of the floor are rounded up to the
    /// next multiple. Returns the interval the point was bucketed under.
    pub fn register(&mut self, point: Arc<PointConfig>) -> ModbusResult<u64> {
        let requested = match point.polling_interval_ms {
            Some(ms) if ms > 0 => ms,
            _ => {
                return Err(ModbusError::configuration(format!(
                    "Point {} has no polling interval",
                    point.key()
                )))
            }
        };

        let interval = round_up_to_multiple(requested, self.floor_ms);
        if interval != requested {
            warn!(
                "Point {}: polling interval {}ms rounded up to {}ms",
                point.key(),
                requested,
                interval
            );
        }

        self.buckets
            .entry(interval)
            .or_insert_with(|| PollingBucket::new(interval))
            .points
            .push(point);
        Ok(interval)
    }

    /// Clock period: gcd of every bucket interval, or the floor when empty
    pub fn tick(&self) -> Duration {
        let gcd = gcd_all(self.buckets.keys().copied());
        Duration::from_millis(gcd.max(self.floor_ms))
    }

    /// Add `elapsed` to every bucket and return the due intervals, shortest
    /// first
    pub fn advance(&mut self, elapsed: Duration) -> Vec<u64> {
        let mut due = Vec::new();
        for bucket in self.buckets.values_mut() {
            bucket.elapsed += elapsed;
            if bucket.elapsed >= Duration::from_millis(bucket.interval_ms) {
                bucket.elapsed = Duration::ZERO;
                bucket.fired += 1;
                due.push(bucket.interval_ms);
            }
        }
        due
    }

    pub fn bucket(&self, interval_ms: u64) -> Option<&PollingBucket> {
        self.buckets.get(&interval_ms)
    }

    pub fn intervals(&self) -> Vec<u64> {
        self.buckets.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Task that ticks the [`TimeMapper`] and hands due buckets to the initiator
pub struct PollingScheduler {
    mapper: TimeMapper,
    initiator: Arc<RequestInitiator>,
    shutdown: Shutdown,
}

impl PollingScheduler {
    pub fn new(mapper: TimeMapper, initiator: Arc<RequestInitiator>, shutdown: Shutdown) -> Self {
        Self {
            mapper,
            initiator,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        if self.mapper.is_empty() {
            info!("No periodic points registered, polling scheduler idle");
            return;
        }

        let tick = self.mapper.tick();
        info!(
            "Polling scheduler started: tick {:?}, buckets {:?}",
            tick,
            self.mapper.intervals()
        );

        let mut last = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                _ = sleep(tick) => {}
            }

            let now = Instant::now();
            let due = self.mapper.advance(now - last);
            last = now;

            for interval in due {
                if let Some(bucket) = self.mapper.bucket(interval) {
                    let issued = self.initiator.initiate(&bucket.points);
                    debug!("Bucket {}ms due: {} of {} read(s) issued", interval, issued, bucket.points.len());
                }
            }
        }
        info!("Polling scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DataType, RegisterType};

    fn point(metric: &str, interval_ms: u64) -> Arc<PointConfig> {
        Arc::new(PointConfig {
            wellhead: "PL0".to_string(),
            device: "flowmeter".to_string(),
            metric: metric.to_string(),
            endpoint: Some("127.0.0.1:1502".to_string()),
            unit_id: 1,
            register_type: RegisterType::Holding,
            address: 0,
            width: 1,
            data_type: DataType::Int,
            scale: 1.0,
            byte_swap: false,
            word_swap: false,
            polling_interval_ms: Some(interval_ms),
            priority: 1,
        })
    }

    #[test]
    fn test_buckets_fire_independently() {
        let mut mapper = TimeMapper::with_floor(100);
        mapper.register(point("Flow", 600)).unwrap();
        mapper.register(point("Pressure", 1000)).unwrap();
        mapper.register(point("Temperature", 600)).unwrap();
        assert_eq!(mapper.tick(), Duration::from_millis(200));
        assert_eq!(mapper.bucket(600).unwrap().points.len(), 2);

        let mut fired_600 = Vec::new();
        let mut fired_1000 = Vec::new();
        for now in (100..=3000).step_by(100) {
            for interval in mapper.advance(Duration::from_millis(100)) {
                match interval {
                    600 => fired_600.push(now),
                    1000 => fired_1000.push(now),
                    other => panic!("unexpected bucket {}", other),
                }
            }
        }

        assert_eq!(fired_600, vec![600, 1200, 1800, 2400, 3000]);
        assert_eq!(fired_1000, vec![1000, 2000, 3000]);
    }

    #[test]
    fn test_due_in_ascending_order() {
        let mut mapper = TimeMapper::with_floor(25);
        mapper.register(point("Slow", 100)).unwrap();
        mapper.register(point("Fast", 50)).unwrap();
        assert_eq!(mapper.advance(Duration::from_millis(100)), vec![50, 100]);
    }

    #[test]
    fn test_late_tick_resets_elapsed() {
        let mut mapper = TimeMapper::with_floor(100);
        mapper.register(point("Flow", 500)).unwrap();
        assert!(mapper.advance(Duration::from_millis(450)).is_empty());
        // A tick that arrives late fires once and does not carry the excess.
        assert_eq!(mapper.advance(Duration::from_millis(300)), vec![500]);
        assert!(mapper.advance(Duration::from_millis(400)).is_empty());
        assert_eq!(mapper.advance(Duration::from_millis(100)), vec![500]);
        assert_eq!(mapper.bucket(500).unwrap().fired(), 2);
    }

    #[test]
    fn test_interval_rounding_and_floor() {
        let mut tcp = TimeMapper::new(FrameFormat::Tcp);
        assert_eq!(tcp.register(point("A", 130)).unwrap(), 150);
        assert_eq!(tcp.register(point("B", 10)).unwrap(), 25);
        assert_eq!(tcp.tick(), Duration::from_millis(25));

        let mut rtu = TimeMapper::new(FrameFormat::Rtu);
        assert_eq!(rtu.tick(), Duration::from_millis(100));
        assert_eq!(rtu.register(point("C", 250)).unwrap(), 300);
        assert!(rtu.register(point("D", 0)).is_err());
        let mut unpolled = (*point("E", 1)).clone();
        unpolled.polling_interval_ms = None;
        assert!(rtu.register(Arc::new(unpolled)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_issues_reads() {
        use crate::initiator::PendingTable;
        use crate::manager::{CompletionHandler, RequestManager, StackResponse};
        use crate::response::{PointResult, ResultPublisher};
        use crate::transport::mock::{tcp_register_reply, MockFactory};

        let factory = MockFactory::new(
            FrameFormat::Tcp,
            Arc::new(|request: &[u8]| vec![tcp_register_reply(request, &[7])]),
        );
        let manager = Arc::new(RequestManager::new(Arc::new(factory.clone()), 16));
        assert!(manager.start().is_success());

        let pending = Arc::new(PendingTable::new());
        let completion_pending = Arc::clone(&pending);
        let completion: Arc<dyn CompletionHandler> = Arc::new(move |response: StackResponse| {
            completion_pending.take(response.app_transaction_id);
        });
        let publisher: Arc<dyn ResultPublisher> = Arc::new(|_: PointResult| {});
        let initiator = Arc::new(RequestInitiator::new(Arc::clone(&manager), pending, completion, publisher));

        let mut mapper = TimeMapper::new(FrameFormat::Tcp);
        mapper.register(point("Flow", 100)).unwrap();
        let trigger = crate::queue::ShutdownTrigger::new();
        let scheduler = tokio::spawn(PollingScheduler::new(mapper, initiator, trigger.subscribe()).run());

        tokio::time::sleep(Duration::from_millis(1050)).await;
        trigger.trigger();
        scheduler.await.unwrap();
        manager.shutdown().await;

        let reads = factory.sent_frames().len();
        assert!((9..=10).contains(&reads), "{} reads", reads);
    }
}
