//! In-flight request bookkeeping.
//!
//! The [`RequestTable`] is the authoritative record of every transaction the
//! stack has accepted and not yet finished. A reservation is represented by a
//! [`Slot`]; dropping the slot removes the record, so whichever stage owns the
//! [`RequestEntry`] at the moment it finishes is the stage that frees it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CompletionStatus;
use crate::frame::ResponseFrame;
use crate::manager::{CompletionHandler, StackResponse};
use crate::protocol::{ModbusFunction, UnitId};

/// Identity of a device session.
///
/// In TCP mode every remote endpoint gets its own session; the serial line is
/// a single shared session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionKey {
    Tcp(SocketAddr),
    Serial,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Tcp(addr) => write!(f, "tcp://{}", addr),
            SessionKey::Serial => write!(f, "serial"),
        }
    }
}

/// Target device of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub session: SessionKey,
    pub unit_id: UnitId,
}

impl DeviceId {
    pub fn tcp(addr: SocketAddr, unit_id: UnitId) -> Self {
        Self { session: SessionKey::Tcp(addr), unit_id }
    }

    pub fn serial(unit_id: UnitId) -> Self {
        Self { session: SessionKey::Serial, unit_id }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.unit_id)
    }
}

/// Table view of an outstanding transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub transaction_id: u16,
    pub app_transaction_id: u16,
    pub function: ModbusFunction,
    pub device: DeviceId,
    pub received_at: DateTime<Utc>,
}

/// Bounded table of outstanding transactions
pub struct RequestTable {
    records: Mutex<HashMap<u16, RequestRecord>>,
    capacity: usize,
    max_transaction_id: u16,
    next_id: AtomicU16,
}

impl RequestTable {
    /// Create a table with `capacity` slots.
    ///
    /// Transaction ids cycle through `1..=max_transaction_id`; the id space is
    /// widened to `capacity + 1` if it would otherwise be smaller than the table.
    pub fn new(capacity: usize, max_transaction_id: u16) -> Arc<Self> {
        let capacity = capacity.clamp(1, u16::MAX as usize - 1);
        let max_transaction_id = max_transaction_id.max(capacity as u16 + 1);
        Arc::new(Self {
            records: Mutex::new(HashMap::with_capacity(capacity)),
            capacity,
            max_transaction_id,
            next_id: AtomicU16::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, RequestRecord>> {
        // A panic inside a short map operation leaves the map consistent.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_candidate(&self) -> u16 {
        let mut current = self.next_id.load(Ordering::Relaxed);
        loop {
            let next = if current >= self.max_transaction_id { 1 } else { current + 1 };
            match self
                .next_id
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserve a slot with a fresh transaction id.
    ///
    /// Returns `None` when every slot is taken. The id is never 0 and never
    /// equal to the id of a live record.
    pub fn reserve(
        self: &Arc<Self>,
        app_transaction_id: u16,
        function: ModbusFunction,
        device: DeviceId,
    ) -> Option<Slot> {
        let mut records = self.lock();
        if records.len() >= self.capacity {
            return None;
        }

        let transaction_id = loop {
            let candidate = self.next_candidate();
            if !records.contains_key(&candidate) {
                break candidate;
            }
        };

        records.insert(
            transaction_id,
            RequestRecord {
                transaction_id,
                app_transaction_id,
                function,
                device,
                received_at: Utc::now(),
            },
        );

        Some(Slot {
            table: Arc::clone(self),
            transaction_id,
        })
    }

    pub fn contains(&self, transaction_id: u16) -> bool {
        self.lock().contains_key(&transaction_id)
    }

    pub fn get(&self, transaction_id: u16) -> Option<RequestRecord> {
        self.lock().get(&transaction_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self, transaction_id: u16) {
        if self.lock().remove(&transaction_id).is_some() {
            debug!("Released transaction {}", transaction_id);
        }
    }
}

impl fmt::Debug for RequestTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTable")
            .field("capacity", &self.capacity)
            .field("max_transaction_id", &self.max_transaction_id)
            .field("live", &self.len())
            .finish()
    }
}

/// Live reservation in the [`RequestTable`], released on drop
pub struct Slot {
    table: Arc<RequestTable>,
    transaction_id: u16,
}

impl Slot {
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&self.transaction_id).finish()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.table.release(self.transaction_id);
    }
}

/// A framed request travelling from the Request Manager to a session.
///
/// The entry owns its frame buffer and its table slot. Finishing it through
/// [`RequestEntry::complete`] consumes it, so it can only finish once.
pub struct RequestEntry {
    slot: Slot,
    pub app_transaction_id: u16,
    pub function: ModbusFunction,
    pub device: DeviceId,
    pub start_address: u16,
    pub quantity: u16,
    pub byte_count: u16,
    /// Lower value is more urgent
    pub priority: i64,
    pub frame: Vec<u8>,
    pub received_at: DateTime<Utc>,
    handler: Arc<dyn CompletionHandler>,
}

impl RequestEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: Slot,
        app_transaction_id: u16,
        function: ModbusFunction,
        device: DeviceId,
        start_address: u16,
        quantity: u16,
        byte_count: u16,
        priority: i64,
        frame: Vec<u8>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Self {
        Self {
            slot,
            app_transaction_id,
            function,
            device,
            start_address,
            quantity,
            byte_count,
            priority,
            frame,
            received_at: Utc::now(),
            handler,
        }
    }

    pub fn transaction_id(&self) -> u16 {
        self.slot.transaction_id()
    }

    /// Finish the entry: release its slot and buffer, then notify the handler
    pub fn complete(self, status: CompletionStatus, response: Option<&ResponseFrame>) {
        let RequestEntry {
            slot,
            app_transaction_id,
            function,
            device,
            start_address,
            quantity,
            received_at,
            handler,
            ..
        } = self;

        let transaction_id = slot.transaction_id();
        drop(slot);

        let data = match (&status, response) {
            (CompletionStatus::Success, Some(frame)) => frame.data_bytes().to_vec(),
            _ => Vec::new(),
        };

        handler.complete(StackResponse {
            transaction_id,
            app_transaction_id,
            function,
            device,
            status,
            data,
            start_address,
            quantity,
            received_at,
            responded_at: Utc::now(),
        });
    }
}

impl fmt::Debug for RequestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEntry")
            .field("transaction_id", &self.transaction_id())
            .field("app_transaction_id", &self.app_transaction_id)
            .field("function", &self.function)
            .field("device", &self.device)
            .field("priority", &self.priority)
            .field("frame_len", &self.frame.len())
            .finish()
    }
}
