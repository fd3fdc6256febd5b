//! Request Initiator and the pending request table.
//!
//! Every request the gateway issues on behalf of a point, periodic or on
//! demand, is recorded in the [`PendingTable`] under its application
//! reference id before it is handed to the Request Manager. The Response
//! Processor takes the record back out when the request completes.
//!
//! A periodic point has at most one request in flight. While its previous
//! read is outstanding the point is "awaiting", and a due cycle publishes a
//! placeholder result instead of issuing another read.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::directory::{PointConfig, RegisterType};
use crate::error::StackStatus;
use crate::frame::FrameFormat;
use crate::manager::{CompletionHandler, RequestManager, RequestTarget};
use crate::response::{PointResult, ResultPublisher};

/// Largest application reference id; ids cycle through `1..=MAX_REF_ID`
pub const MAX_REF_ID: u16 = 65534;

/// Why a request was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Periodic,
    OnDemandRead,
    OnDemandWrite,
}

/// Context needed to format the response of an issued request
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub point: Arc<PointConfig>,
    pub kind: PendingKind,
    pub app_seq: Option<String>,
    pub version: Option<String>,
    pub source_topic: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn periodic(point: Arc<PointConfig>) -> Self {
        Self {
            point,
            kind: PendingKind::Periodic,
            app_seq: None,
            version: None,
            source_topic: None,
            issued_at: Utc::now(),
        }
    }

    pub fn is_on_demand(&self) -> bool {
        self.kind != PendingKind::Periodic
    }
}

#[derive(Default)]
struct PendingInner {
    requests: HashMap<u16, PendingRequest>,
    awaiting: HashSet<String>,
    next_ref_id: u16,
}

impl PendingInner {
    fn allocate(&mut self) -> Option<u16> {
        if self.requests.len() >= MAX_REF_ID as usize {
            return None;
        }
        loop {
            self.next_ref_id = if self.next_ref_id >= MAX_REF_ID { 1 } else { self.next_ref_id + 1 };
            if !self.requests.contains_key(&self.next_ref_id) {
                return Some(self.next_ref_id);
            }
        }
    }
}

/// Requests issued for points and not yet answered, keyed by reference id.
///
/// Await flags of periodic points live under the same lock, so setting a
/// flag and recording the request are one step, as are clearing it and
/// taking the request back.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<PendingInner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a request under a fresh reference id.
    ///
    /// Returns `None` if a periodic point is still awaiting its previous
    /// response, or if every id is in use.
    pub fn register(&self, request: PendingRequest) -> Option<u16> {
        let mut inner = self.lock();
        let key = request.point.key();
        if request.kind == PendingKind::Periodic && inner.awaiting.contains(&key) {
            return None;
        }
        let ref_id = inner.allocate()?;
        if request.kind == PendingKind::Periodic {
            inner.awaiting.insert(key);
        }
        inner.requests.insert(ref_id, request);
        Some(ref_id)
    }

    /// Remove a request, clearing its point's await flag
    pub fn take(&self, ref_id: u16) -> Option<PendingRequest> {
        let mut inner = self.lock();
        let request = inner.requests.remove(&ref_id)?;
        if request.kind == PendingKind::Periodic {
            inner.awaiting.remove(&request.point.key());
        }
        Some(request)
    }

    pub fn is_awaiting(&self, point_key: &str) -> bool {
        self.lock().awaiting.contains(point_key)
    }

    pub fn contains(&self, ref_id: u16) -> bool {
        self.lock().requests.contains_key(&ref_id)
    }

    pub fn len(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Issue the read matching a point's register type
pub fn issue_read(
    manager: &RequestManager,
    target: RequestTarget,
    point: &PointConfig,
    handler: Arc<dyn CompletionHandler>,
) -> StackStatus {
    let handler = Some(handler);
    match point.register_type {
        RegisterType::Coil => manager.read_coils(target, point.address, point.width, handler),
        RegisterType::DiscreteInput => manager.read_discrete_inputs(target, point.address, point.width, handler),
        RegisterType::Holding => manager.read_holding_registers(target, point.address, point.width, handler),
        RegisterType::Input => manager.read_input_registers(target, point.address, point.width, handler),
    }
}

/// Turns due polling buckets into read requests
pub struct RequestInitiator {
    manager: Arc<RequestManager>,
    pending: Arc<PendingTable>,
    completion: Arc<dyn CompletionHandler>,
    publisher: Arc<dyn ResultPublisher>,
    mode: FrameFormat,
}

impl RequestInitiator {
    pub fn new(
        manager: Arc<RequestManager>,
        pending: Arc<PendingTable>,
        completion: Arc<dyn CompletionHandler>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        let mode = manager.format();
        Self {
            manager,
            pending,
            completion,
            publisher,
            mode,
        }
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// Issue one read per point of a due bucket. Returns how many were issued.
    pub fn initiate(&self, points: &[Arc<PointConfig>]) -> usize {
        let mut issued = 0;
        for point in points {
            if self.initiate_point(point) {
                issued += 1;
            }
        }
        issued
    }

    fn initiate_point(&self, point: &Arc<PointConfig>) -> bool {
        let device = match point.device_id(self.mode) {
            Ok(device) => device,
            Err(e) => {
                warn!("Skipping point {}: {}", point.key(), e);
                return false;
            }
        };

        let Some(ref_id) = self.pending.register(PendingRequest::periodic(Arc::clone(point))) else {
            debug!("Point {} still awaiting a response", point.key());
            self.publisher.publish(PointResult::no_response(point));
            return false;
        };

        let target = RequestTarget::new(ref_id, device).with_priority(point.priority);
        let status = issue_read(&self.manager, target, point, Arc::clone(&self.completion));
        if status.is_success() {
            return true;
        }

        warn!("Periodic read of {} not issued: {}", point.key(), status);
        if let Some(request) = self.pending.take(ref_id) {
            self.publisher.publish(PointResult::rejected(&request, status));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DataType;
    use crate::response::ResultStatus;

    fn point(metric: &str) -> Arc<PointConfig> {
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
            polling_interval_ms: Some(1000),
            priority: 1,
        })
    }

    #[test]
    fn test_one_periodic_request_per_point() {
        let pending = PendingTable::new();
        let flow = point("Flow");

        let first = pending.register(PendingRequest::periodic(Arc::clone(&flow))).unwrap();
        assert!(pending.is_awaiting("PL0/flowmeter/Flow"));
        assert!(pending.register(PendingRequest::periodic(Arc::clone(&flow))).is_none());
        assert!(pending.register(PendingRequest::periodic(point("Pressure"))).is_some());

        let taken = pending.take(first).unwrap();
        assert_eq!(taken.point.metric, "Flow");
        assert!(!pending.is_awaiting("PL0/flowmeter/Flow"));
        assert!(pending.take(first).is_none());
        assert!(pending.register(PendingRequest::periodic(flow)).is_some());
    }

    #[test]
    fn test_on_demand_does_not_block_periodic() {
        let pending = PendingTable::new();
        let flow = point("Flow");
        let mut on_demand = PendingRequest::periodic(Arc::clone(&flow));
        on_demand.kind = PendingKind::OnDemandRead;

        pending.register(on_demand.clone()).unwrap();
        pending.register(on_demand).unwrap();
        assert!(!pending.is_awaiting("PL0/flowmeter/Flow"));
        assert!(pending.register(PendingRequest::periodic(flow)).is_some());
        assert_eq!(pending.len(), 3);
    }

    #[test]
    fn test_ref_ids_wrap_and_skip_live() {
        let pending = PendingTable::new();
        pending.lock().next_ref_id = MAX_REF_ID - 1;
        let mut request = PendingRequest::periodic(point("Flow"));
        request.kind = PendingKind::OnDemandWrite;

        assert_eq!(pending.register(request.clone()), Some(MAX_REF_ID));
        assert_eq!(pending.register(request.clone()), Some(1));
        pending.lock().next_ref_id = MAX_REF_ID - 1;
        assert_eq!(pending.register(request), Some(2));
    }

    #[tokio::test]
    async fn test_placeholder_while_awaiting() {
        use crate::transport::mock::MockFactory;
        use std::sync::Mutex as StdMutex;

        let manager = Arc::new(RequestManager::new(Arc::new(MockFactory::silent(FrameFormat::Tcp)), 8));
        manager.set_stack_config(crate::config::StackConfig::from_millis(30_000, 0));
        assert!(manager.start().is_success());

        let published = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let publisher: Arc<dyn ResultPublisher> = Arc::new(move |result: PointResult| {
            sink.lock().unwrap().push(result);
        });
        let completion: Arc<dyn CompletionHandler> = Arc::new(|_: crate::manager::StackResponse| {});
        let pending = Arc::new(PendingTable::new());
        let initiator = RequestInitiator::new(Arc::clone(&manager), Arc::clone(&pending), completion, publisher);

        let points = vec![point("Flow")];
        assert_eq!(initiator.initiate(&points), 1);
        assert_eq!(initiator.initiate(&points), 0);
        assert_eq!(initiator.initiate(&points), 0);

        assert_eq!(manager.table().len(), 1);
        let results = published.lock().unwrap().clone();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == ResultStatus::NoResponse));
        manager.shutdown().await;
    }
}
