use crate::types::{Addr, FiberId, RequestId, ServiceId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Runtime events — the in-memory audit trail the `--trace-events`
/// surface prints and tests assert against. Lifecycle granularity, not
/// per-op.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    ModuleLoaded {
        name: String,
        version: [u8; 32],
    },
    ServiceCreated {
        service: ServiceId,
        name: String,
    },
    ServiceShuttingDown {
        service: ServiceId,
    },
    ServiceTerminated {
        service: ServiceId,
    },
    FiberSpawned {
        service: ServiceId,
        fiber: FiberId,
        caller: Option<FiberId>,
    },
    FiberStateChanged {
        fiber: FiberId,
        from: &'static str,
        to: &'static str,
    },
    MessageEnqueued {
        target: ServiceId,
        request: RequestId,
    },
    MessageRefused {
        target: ServiceId,
        request: RequestId,
    },
    ResponsePosted {
        target: ServiceId,
        request: RequestId,
        ok: bool,
    },
    /// A response arrived for a request whose futures were already
    /// resolved (e.g. after a timeout) and was dropped.
    ResponseDropped {
        request: RequestId,
    },
    ExceptionRaised {
        fiber: FiberId,
        kind: String,
        pc: Addr,
    },
    ExceptionCaught {
        fiber: FiberId,
        handler_pc: Addr,
    },
    UnhandledException {
        fiber: FiberId,
        kind: String,
    },
    TimeoutRaised {
        fiber: FiberId,
    },
    SingletonInitialized {
        identity: [u8; 32],
    },
    SingletonCircular {
        identity: [u8; 32],
    },
}

/// Append-only in-memory event log with monotonic sequence numbers.
pub struct EventLog {
    entries: Mutex<Vec<(u64, RuntimeEvent)>>,
    seq: AtomicU64,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Append an event and return its sequence number.
    pub fn append(&self, event: RuntimeEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut w = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        w.push((seq, event));
        seq
    }

    /// Events at or after a sequence number, in order.
    pub fn read_from(&self, from_seq: u64) -> Vec<(u64, RuntimeEvent)> {
        let r = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        r.iter().filter(|(s, _)| *s >= from_seq).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
