use crate::construct::construct_step;
use crate::container::ContainerShared;
use crate::deferred::{resolve_arguments, ContinuationChain};
use crate::dispatch::{self, PropRead, PropWrite};
use crate::errors::{ExceptionKind, FaultKind, VmError, VmException};
use crate::events::RuntimeEvent;
use crate::fiber::{CallerRef, Fiber, FiberStatus};
use crate::frame::{Frame, OpState, ReturnTarget, ScopedFinalizer};
use crate::handle::{Callable, FutureCell, ObjValue, ObjectHandle};
use crate::interp::{build_call_frame, run_fiber, Interp, Op, Outcome, RunOutcome};
use crate::module::{MethodDef, ParamInfo};
use crate::types::{
    well_known, ClassId, FiberId, MethodRef, PropertyId, RequestId, ServiceId, SlotIdx, TypeArg,
};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

// ─── Current context ──────────────────────────────────────────

thread_local! {
    static CURRENT_SERVICE: Cell<Option<ServiceId>> = const { Cell::new(None) };
}

/// Publish the context about to execute on this thread. Ops never read
/// this — they receive the frame, which knows its context.
pub fn publish_current(service: Option<ServiceId>) {
    CURRENT_SERVICE.with(|c| c.set(service));
}

pub fn current_service() -> Option<ServiceId> {
    CURRENT_SERVICE.with(|c| c.get())
}

// ─── Re-entrancy & lifecycle ──────────────────────────────────

/// Scheduling policy a service applies when choosing the next fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReentrancyMode {
    /// At most one fiber ever; new message-born fibers wait for it.
    Forbidden,
    /// New fibers only when their causal chain already entered here.
    Exclusive,
    /// Prefer already-started fibers; start a new one if nothing is
    /// ready.
    Prioritized,
    /// Round-robin among all runnable fibers, new and old alike.
    Open,
}

impl ReentrancyMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "forbidden" => Some(ReentrancyMode::Forbidden),
            "exclusive" => Some(ReentrancyMode::Exclusive),
            "prioritized" => Some(ReentrancyMode::Prioritized),
            "open" => Some(ReentrancyMode::Open),
            _ => None,
        }
    }
}

/// Under Exclusive, plain new messages are rejected until the pinned
/// chain drains. Pinned here (with tests) so the semantics can be
/// revisited in one place.
pub const EXCLUSIVE_ADMITS_NEW: bool = false;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceStatus {
    Idle = 0,
    Busy = 1,
    ShuttingDown = 2,
    Terminated = 3,
}

impl ServiceStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServiceStatus::Idle,
            1 => ServiceStatus::Busy,
            2 => ServiceStatus::ShuttingDown,
            _ => ServiceStatus::Terminated,
        }
    }
}

// ─── Messages & responses ─────────────────────────────────────

#[derive(Clone, Debug)]
pub enum Control {
    Shutdown,
}

/// Payload of a cross-service message: the four call shapes plus
/// singleton batches and control.
#[derive(Clone, Debug)]
pub enum MessageBody {
    Construct {
        class: ClassId,
        type_args: Vec<TypeArg>,
        args: Vec<ObjectHandle>,
    },
    Invoke {
        callee: Callable,
        args: Vec<ObjectHandle>,
    },
    InvokeMulti {
        callee: Callable,
        args: Vec<ObjectHandle>,
        arity: usize,
    },
    PropertyGet {
        target: ObjectHandle,
        prop: PropertyId,
    },
    PropertySet {
        target: ObjectHandle,
        prop: PropertyId,
        value: ObjectHandle,
    },
    InitSingletons {
        identities: Vec<[u8; 32]>,
    },
    Control(Control),
}

/// Where to post the response when the proto-frame completes.
#[derive(Clone)]
pub struct Reply {
    pub resp_tx: mpsc::UnboundedSender<Response>,
    pub request_id: RequestId,
    /// Caller fiber whose responded flag the arrival sets.
    pub target_fiber: Option<FiberId>,
    pub caller_service: Option<ServiceId>,
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reply({})", self.request_id)
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub request_id: RequestId,
    pub caller: Option<CallerRef>,
    /// Services the originating call chain has traversed.
    pub causal: Vec<ServiceId>,
    pub deadline: Option<Instant>,
    pub reply: Option<Reply>,
    pub body: MessageBody,
}

/// Completion of a cross-service request. Responses never execute user
/// code; draining them only completes futures.
#[derive(Debug)]
pub struct Response {
    pub request_id: RequestId,
    pub target_fiber: Option<FiberId>,
    pub result: Result<Vec<ObjectHandle>, VmException>,
}

/// Work a proto-frame's entry op performs.
#[derive(Clone, Debug)]
pub enum EntryWork {
    Invoke {
        callee: Callable,
        args: Vec<ObjectHandle>,
        arity: usize,
    },
    Construct {
        class: ClassId,
        type_args: Vec<TypeArg>,
        args: Vec<ObjectHandle>,
    },
    PropertyGet {
        target: ObjectHandle,
        prop: PropertyId,
    },
    PropertySet {
        target: ObjectHandle,
        prop: PropertyId,
        value: ObjectHandle,
    },
    InitSingletons {
        identities: Vec<[u8; 32]>,
    },
}

// ─── Port ─────────────────────────────────────────────────────

/// The outbound surface ops use: posting messages and registering
/// pending completions. Implemented by the running service context and
/// by test stand-ins.
pub trait ServicePort: Send + Sync {
    fn self_id(&self) -> ServiceId;
    fn main_service(&self) -> Option<ServiceId>;
    fn post(&self, target: ServiceId, message: Message) -> Result<(), VmError>;
    fn response_sender(&self) -> mpsc::UnboundedSender<Response>;
    fn register_pending(&self, request: RequestId, fiber: FiberId, cells: Vec<FutureCell>);
}

pub(crate) struct PendingCall {
    pub fiber: FiberId,
    pub cells: Vec<FutureCell>,
}

struct PortImpl {
    service: ServiceId,
    shared: Arc<ContainerShared>,
    resp_tx: mpsc::UnboundedSender<Response>,
    pending: Arc<Mutex<HashMap<RequestId, PendingCall>>>,
}

impl ServicePort for PortImpl {
    fn self_id(&self) -> ServiceId {
        self.service
    }

    fn main_service(&self) -> Option<ServiceId> {
        self.shared.main_service()
    }

    fn post(&self, target: ServiceId, message: Message) -> Result<(), VmError> {
        self.shared.post(target, message)
    }

    fn response_sender(&self) -> mpsc::UnboundedSender<Response> {
        self.resp_tx.clone()
    }

    fn register_pending(&self, request: RequestId, fiber: FiberId, cells: Vec<FutureCell>) {
        let mut w = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        w.insert(request, PendingCall { fiber, cells });
    }
}

// ─── Handle & stats ───────────────────────────────────────────

/// Live counters a service publishes for inspection.
pub struct ServiceStats {
    pub status: AtomicU8,
    pub fibers: AtomicUsize,
    pub runtime_nanos: AtomicU64,
}

impl ServiceStats {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(ServiceStatus::Idle as u8),
            fibers: AtomicUsize::new(0),
            runtime_nanos: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

/// Container-side handle to a spawned service.
#[derive(Clone)]
pub struct ServiceHandle {
    pub service_id: ServiceId,
    pub name: String,
    pub msg_tx: mpsc::UnboundedSender<Message>,
    pub stats: Arc<ServiceStats>,
}

// ─── Service context ──────────────────────────────────────────

/// Single-threaded executor for a cohort of fibers: inbound message
/// queue, inbound response queue, suspended-fiber list, at most one
/// running frame.
pub struct ServiceContext {
    pub service_id: ServiceId,
    pub name: String,
    shared: Arc<ContainerShared>,
    mode: ReentrancyMode,
    msg_rx: mpsc::UnboundedReceiver<Message>,
    resp_rx: mpsc::UnboundedReceiver<Response>,
    resp_tx: mpsc::UnboundedSender<Response>,
    fibers: Vec<Fiber>,
    pending: Arc<Mutex<HashMap<RequestId, PendingCall>>>,
    stats: Arc<ServiceStats>,
    rr_cursor: usize,
    msg_closed: bool,
}

impl ServiceContext {
    /// Build a context plus its container-side handle.
    pub fn new(
        name: impl Into<String>,
        mode: ReentrancyMode,
        shared: Arc<ContainerShared>,
    ) -> (Self, ServiceHandle) {
        let service_id = Uuid::now_v7();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(ServiceStats::new());
        let name = name.into();
        let ctx = Self {
            service_id,
            name: name.clone(),
            shared,
            mode,
            msg_rx,
            resp_rx,
            resp_tx,
            fibers: Vec::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::clone(&stats),
            rr_cursor: 0,
            msg_closed: false,
        };
        let handle = ServiceHandle {
            service_id,
            name,
            msg_tx,
            stats,
        };
        (ctx, handle)
    }

    fn set_status(&self, status: ServiceStatus) {
        self.stats.status.store(status as u8, Ordering::Release);
    }

    fn status(&self) -> ServiceStatus {
        self.stats.status()
    }

    /// Executor loop: drain responses, drain messages, pick a fiber,
    /// run a slice, repeat; sleep when nothing is runnable.
    pub async fn run(mut self) {
        tracing::debug!(service = %self.service_id, name = %self.name, "service started");
        loop {
            self.drain_responses();
            self.drain_messages();

            if self.status() == ServiceStatus::ShuttingDown {
                // Runnable fibers drain, and in-flight requests may still
                // complete; fibers blocked with no way to resume are cut
                // off with an exceptional response.
                let now = Instant::now();
                let awaiting_responses = {
                    let r = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    !r.is_empty()
                };
                if !awaiting_responses && self.fibers.iter().all(|f| !f.eligible(now)) {
                    let stuck: Vec<Fiber> = self.fibers.drain(..).collect();
                    for mut fiber in stuck {
                        fiber.force_terminate();
                        if let Some(reply) = &fiber.reply {
                            self.post_exceptional(
                                reply,
                                VmException::new(
                                    ExceptionKind::Unsupported,
                                    "service is shutting down",
                                ),
                            );
                        }
                    }
                    break;
                }
            }
            if self.msg_closed {
                // Orphaned: the container dropped its handle. Finish
                // whatever can still run, then stop.
                let now = Instant::now();
                let awaiting_responses = {
                    let r = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    !r.is_empty()
                };
                if self.fibers.is_empty()
                    || (!awaiting_responses && self.fibers.iter().all(|f| !f.eligible(now)))
                {
                    break;
                }
            }

            match self.pick_next() {
                Some(fiber) => self.run_slice(fiber),
                None => self.idle().await,
            }
        }
        self.set_status(ServiceStatus::Terminated);
        self.shared
            .events
            .append(RuntimeEvent::ServiceTerminated {
                service: self.service_id,
            });
        tracing::debug!(service = %self.service_id, "service terminated");
    }

    fn run_slice(&mut self, mut fiber: Fiber) {
        // Waiting fibers whose deadline lapsed fail their outstanding
        // futures so the raise happens at the resumption point and the
        // late response is dropped.
        let now = Instant::now();
        if fiber.status() == FiberStatus::Waiting && fiber.deadline_exceeded(now) {
            self.expire_pending(fiber.fiber_id);
        }

        let port = PortImpl {
            service: self.service_id,
            shared: Arc::clone(&self.shared),
            resp_tx: self.resp_tx.clone(),
            pending: Arc::clone(&self.pending),
        };
        let shared = Arc::clone(&self.shared);
        let interp = Interp {
            registry: &shared.registry,
            natives: &shared.natives,
            oracle: shared.oracle.as_ref(),
            events: &shared.events,
            singletons: &shared.singletons,
            port: &port,
            config: &shared.config,
            service: self.service_id,
        };

        // The executing thread may change across awaits; republish on
        // every slice.
        publish_current(Some(self.service_id));
        self.set_status(ServiceStatus::Busy);
        let started = Instant::now();
        let outcome = run_fiber(&interp, &mut fiber, shared.config.op_budget);
        self.stats
            .runtime_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        if self.status() == ServiceStatus::Busy {
            self.set_status(ServiceStatus::Idle);
        }
        publish_current(None);

        match outcome {
            Ok(RunOutcome::Done) => {
                // Success response was posted by the proto continuation.
                self.forget_pending(fiber.fiber_id);
            }
            Ok(RunOutcome::Failed(exc)) => {
                self.forget_pending(fiber.fiber_id);
                if let Some(reply) = &fiber.reply {
                    self.post_exceptional(reply, exc);
                } else {
                    // Unhandled-exception hook: log and drop the fiber;
                    // the service stays alive.
                    self.shared.report_unhandled(self.service_id, &exc);
                }
            }
            Ok(RunOutcome::Budget) | Ok(RunOutcome::Yielded) | Ok(RunOutcome::Waiting) => {
                self.fibers.push(fiber);
            }
            Err(fault) => {
                tracing::error!(service = %self.service_id, %fault, "engine fault; dropping fiber");
                if let Some(reply) = &fiber.reply {
                    self.post_exceptional(reply, VmException::from_fault(&fault));
                }
            }
        }
        self.stats.fibers.store(self.fibers.len(), Ordering::Release);
    }

    async fn idle(&mut self) {
        enum Wake {
            Response(Option<Response>),
            Message(Option<Message>),
            Deadline,
        }

        let deadline = self
            .fibers
            .iter()
            .filter(|f| f.status() == FiberStatus::Waiting)
            .filter_map(|f| f.deadline)
            .min();
        let sleeper = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                None => std::future::pending::<()>().await,
            }
        };
        let msg_open = !self.msg_closed;
        let wake = tokio::select! {
            maybe = self.resp_rx.recv() => Wake::Response(maybe),
            maybe = self.msg_rx.recv(), if msg_open => Wake::Message(maybe),
            _ = sleeper => Wake::Deadline,
        };
        match wake {
            Wake::Response(Some(resp)) => self.handle_response(resp),
            Wake::Response(None) => {}
            Wake::Message(Some(msg)) => self.accept_message(msg),
            Wake::Message(None) => self.msg_closed = true,
            Wake::Deadline => {}
        }
    }

    // ── Queue drains ──

    /// Responses are drained first each tick; they never execute user
    /// code, only complete futures and set responded flags.
    fn drain_responses(&mut self) {
        while let Ok(resp) = self.resp_rx.try_recv() {
            self.handle_response(resp);
        }
    }

    fn handle_response(&mut self, resp: Response) {
        let entry = {
            let mut w = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            w.remove(&resp.request_id)
        };
        match entry {
            Some(pending) => {
                match resp.result {
                    Ok(values) => {
                        for (i, cell) in pending.cells.iter().enumerate() {
                            let value =
                                values.get(i).cloned().unwrap_or_else(ObjectHandle::nil);
                            cell.complete(value);
                        }
                    }
                    Err(exc) => {
                        for cell in &pending.cells {
                            cell.fail(exc.clone());
                        }
                    }
                }
                if let Some(fiber) = self
                    .fibers
                    .iter_mut()
                    .find(|f| f.fiber_id == pending.fiber)
                {
                    fiber.responded = true;
                }
            }
            None => {
                self.shared.events.append(RuntimeEvent::ResponseDropped {
                    request: resp.request_id,
                });
            }
        }
    }

    fn drain_messages(&mut self) {
        while let Ok(msg) = self.msg_rx.try_recv() {
            self.accept_message(msg);
        }
    }

    fn accept_message(&mut self, msg: Message) {
        if let MessageBody::Control(Control::Shutdown) = &msg.body {
            self.set_status(ServiceStatus::ShuttingDown);
            self.shared
                .events
                .append(RuntimeEvent::ServiceShuttingDown {
                    service: self.service_id,
                });
            return;
        }
        if self.status() == ServiceStatus::ShuttingDown {
            self.shared.events.append(RuntimeEvent::MessageRefused {
                target: self.service_id,
                request: msg.request_id,
            });
            if let Some(reply) = &msg.reply {
                self.post_exceptional(
                    reply,
                    VmException::new(ExceptionKind::Unsupported, "service is shutting down"),
                );
            }
            return;
        }

        let Some(work) = entry_work(&msg.body) else {
            return;
        };
        let mut fiber = Fiber::new(self.service_id, msg.caller.clone());
        fiber.causal = msg.causal.clone();
        fiber.deadline = msg.deadline;
        fiber.reply = msg.reply.clone();
        let proto = self.make_proto(&work, msg.reply.as_ref());
        fiber.entry = Some(work);
        self.shared.events.append(RuntimeEvent::FiberSpawned {
            service: self.service_id,
            fiber: fiber.fiber_id,
            caller: msg.caller.map(|c| c.fiber),
        });
        fiber.frames.push(proto);
        self.fibers.push(fiber);
        self.stats.fibers.store(self.fibers.len(), Ordering::Release);
    }

    /// Synthetic service-entry frame: a fixed two-op program — perform
    /// the requested operation, then a generic return. Its continuation
    /// posts the response back to the caller.
    fn make_proto(&self, work: &EntryWork, reply: Option<&Reply>) -> Frame {
        let (arity, staging) = match work {
            EntryWork::Invoke { arity, .. } => (*arity, 0),
            EntryWork::Construct { args, .. } => (1, args.len()),
            EntryWork::PropertyGet { .. } => (1, 0),
            EntryWork::PropertySet { .. } => (0, 0),
            EntryWork::InitSingletons { identities } => (identities.len(), 0),
        };
        let ret_op = match arity {
            0 => Op::Return0,
            1 => Op::Return1 { src: 0 },
            n => Op::ReturnN {
                srcs: (0..n as SlotIdx).collect(),
            },
        };
        let max_vars = (arity.max(1) + staging) as u16;
        let def = Arc::new(MethodDef {
            id: u32::MAX,
            name: "<service-entry>".into(),
            params: (0..max_vars)
                .map(|_| ParamInfo {
                    declared_type: well_known::OBJECT,
                    dyn_ref: false,
                })
                .collect(),
            returns: arity as u8,
            max_vars,
            max_scopes: 1,
            native: false,
            ops: vec![Op::ServiceEntry, ret_op],
        });
        let mut frame = Frame::new(
            MethodRef {
                class: well_known::SERVICE,
                method: u32::MAX,
            },
            def,
            ReturnTarget::Discard,
        );
        frame.proto = true;

        if let Some(reply) = reply {
            let reply = reply.clone();
            frame.continuation = Some(ContinuationChain::single(Box::new(
                move |interp: &Interp, frame: &mut Frame| {
                    let values: Vec<ObjectHandle> = frame
                        .ret_values
                        .iter()
                        .map(|v| {
                            v.as_ready()
                                .map(ObjectHandle::deep_copy)
                                .unwrap_or_else(ObjectHandle::nil)
                        })
                        .collect();
                    let ok = reply
                        .resp_tx
                        .send(Response {
                            request_id: reply.request_id,
                            target_fiber: reply.target_fiber,
                            result: Ok(values),
                        })
                        .is_ok();
                    if ok {
                        if let Some(caller) = reply.caller_service {
                            interp.events.append(RuntimeEvent::ResponsePosted {
                                target: caller,
                                request: reply.request_id,
                                ok: true,
                            });
                        }
                    }
                    Outcome::Next
                },
            )));
        }
        frame
    }

    fn post_exceptional(&self, reply: &Reply, exc: VmException) {
        let exc = VmException {
            data: exc.data.as_ref().map(ObjectHandle::deep_copy),
            ..exc
        };
        let sent = reply
            .resp_tx
            .send(Response {
                request_id: reply.request_id,
                target_fiber: reply.target_fiber,
                result: Err(exc),
            })
            .is_ok();
        if sent {
            if let Some(caller) = reply.caller_service {
                self.shared.events.append(RuntimeEvent::ResponsePosted {
                    target: caller,
                    request: reply.request_id,
                    ok: false,
                });
            }
        }
    }

    /// Fail every future a timed-out fiber is still waiting on, so the
    /// eventual late response finds nothing to complete.
    fn expire_pending(&mut self, fiber: FiberId) {
        let mut w = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        w.retain(|_, p| {
            if p.fiber == fiber {
                for cell in &p.cells {
                    cell.fail(VmException::timeout());
                }
                false
            } else {
                true
            }
        });
    }

    fn forget_pending(&mut self, fiber: FiberId) {
        let mut w = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        w.retain(|_, p| p.fiber != fiber);
    }

    // ── Fiber pick ──

    /// Per-tick pick order under the active re-entrancy mode. `Waiting`
    /// fibers are eligible under every mode once their responded flag is
    /// set (or their deadline lapsed).
    fn pick_next(&mut self) -> Option<Fiber> {
        let now = Instant::now();
        match self.mode {
            ReentrancyMode::Forbidden => {
                if let Some(i) = self
                    .fibers
                    .iter()
                    .position(|f| f.status() != FiberStatus::Initial)
                {
                    // The current fiber stays pinned; new arrivals queue.
                    return if self.fibers[i].eligible(now) {
                        Some(self.fibers.remove(i))
                    } else {
                        None
                    };
                }
                self.take_first(|f| f.status() == FiberStatus::Initial)
            }
            ReentrancyMode::Exclusive => {
                let own = self.service_id;
                // Admission only constrains re-entrancy: with no chain in
                // flight, the next message starts normally.
                let busy = self
                    .fibers
                    .iter()
                    .any(|f| f.status() != FiberStatus::Initial);
                self.take_started(now).or_else(|| {
                    self.take_first(|f| {
                        f.status() == FiberStatus::Initial
                            && (!busy || EXCLUSIVE_ADMITS_NEW || f.causal.contains(&own))
                    })
                })
            }
            ReentrancyMode::Prioritized => self
                .take_started(now)
                .or_else(|| self.take_first(|f| f.status() == FiberStatus::Initial)),
            ReentrancyMode::Open => {
                let n = self.fibers.len();
                for k in 0..n {
                    let i = (self.rr_cursor + k) % n;
                    if self.fibers[i].eligible(now) {
                        self.rr_cursor = i % n.max(1);
                        return Some(self.fibers.remove(i));
                    }
                }
                None
            }
        }
    }

    /// Already-started fibers in resume-priority order: Paused first,
    /// then Yielded, then eligible Waiting.
    fn take_started(&mut self, now: Instant) -> Option<Fiber> {
        self.take_first(|f| f.status() == FiberStatus::Paused)
            .or_else(|| self.take_first(|f| f.status() == FiberStatus::Yielded))
            .or_else(|| {
                self.take_first(|f| f.status() == FiberStatus::Waiting && f.eligible(now))
            })
    }

    fn take_first(&mut self, pred: impl Fn(&Fiber) -> bool) -> Option<Fiber> {
        let i = self.fibers.iter().position(pred)?;
        Some(self.fibers.remove(i))
    }
}

fn entry_work(body: &MessageBody) -> Option<EntryWork> {
    match body {
        MessageBody::Construct {
            class,
            type_args,
            args,
        } => Some(EntryWork::Construct {
            class: *class,
            type_args: type_args.clone(),
            args: args.clone(),
        }),
        MessageBody::Invoke { callee, args } => Some(EntryWork::Invoke {
            callee: callee.clone(),
            args: args.clone(),
            arity: 1,
        }),
        MessageBody::InvokeMulti {
            callee,
            args,
            arity,
        } => Some(EntryWork::Invoke {
            callee: callee.clone(),
            args: args.clone(),
            arity: *arity,
        }),
        MessageBody::PropertyGet { target, prop } => Some(EntryWork::PropertyGet {
            target: target.clone(),
            prop: *prop,
        }),
        MessageBody::PropertySet {
            target,
            prop,
            value,
        } => Some(EntryWork::PropertySet {
            target: target.clone(),
            prop: *prop,
            value: value.clone(),
        }),
        MessageBody::InitSingletons { identities } => Some(EntryWork::InitSingletons {
            identities: identities.clone(),
        }),
        MessageBody::Control(_) => None,
    }
}

// ─── Service-entry execution ──────────────────────────────────

/// The single custom op of every proto-frame: perform the requested
/// operation, leaving results in the leading slots for the generic
/// return op.
pub(crate) fn service_entry_step(interp: &Interp, fiber: &mut Fiber) -> Outcome {
    let Some(work) = fiber.entry.clone() else {
        let frame = fiber.current_frame_mut().expect("frames nonempty");
        frame.exception = Some(VmException::new(
            ExceptionKind::Fault(FaultKind::IllegalState),
            "service entry without work",
        ));
        return Outcome::Exception;
    };
    let frame = fiber.current_frame_mut().expect("frames nonempty");

    match work {
        EntryWork::Invoke { callee, args, arity } => {
            let ret = if arity > 1 {
                // Multi-return: realize the return slots as dynamic
                // references; the generic return op waits on them.
                let targets: Vec<SlotIdx> = (0..arity as SlotIdx).collect();
                frame.realize_dyn_returns(&targets);
                ReturnTarget::Multi(targets.into_boxed_slice())
            } else if arity == 1 {
                ReturnTarget::Slot(0)
            } else {
                ReturnTarget::Discard
            };
            match build_call_frame(interp, &callee, &args, ret) {
                Ok(callee_frame) => {
                    frame.splice(callee_frame);
                    Outcome::Call
                }
                Err(e) => {
                    frame.exception = Some(VmException::from_fault(&e));
                    Outcome::Exception
                }
            }
        }

        EntryWork::Construct {
            class,
            type_args,
            args,
        } => {
            // Stage arguments into the proto slots; the constructor
            // driver reads them from there. Idempotent across re-runs.
            let arg_slots: Vec<SlotIdx> = (0..args.len())
                .map(|i| (i + 1) as SlotIdx)
                .collect();
            for (i, h) in args.iter().enumerate() {
                frame.set_slot((i + 1) as SlotIdx, ObjValue::Ready(h.clone()));
            }
            construct_step(interp, frame, class, &type_args, &arg_slots, 0)
        }

        EntryWork::PropertyGet { target, prop } => {
            match dispatch::read_property(interp, frame, &target, prop, 0, false) {
                Ok(PropRead::Value(v)) => {
                    frame.set_slot(0, v);
                    Outcome::Next
                }
                Ok(PropRead::Spliced) => Outcome::Call,
                Err(e) => {
                    frame.exception = Some(e);
                    Outcome::Exception
                }
            }
        }

        EntryWork::PropertySet {
            target,
            prop,
            value,
        } => match dispatch::write_property(
            interp,
            frame,
            &target,
            prop,
            ObjValue::Ready(value),
            false,
        ) {
            Ok(PropWrite::Done) => Outcome::Next,
            Ok(PropWrite::Spliced) => Outcome::Call,
            Err(e) => {
                frame.exception = Some(e);
                Outcome::Exception
            }
        },

        EntryWork::InitSingletons { identities } => {
            singleton_batch_step(interp, frame, &identities)
        }
    }
}

/// Initialize a batch of singleton identities in order on the owning
/// context, re-entering around each spliced initializer. A nested
/// re-entry on an identity already marked raises the circular fault.
fn singleton_batch_step(interp: &Interp, frame: &mut Frame, identities: &[[u8; 32]]) -> Outcome {
    use crate::container::SingletonState;

    let (mut index, mut inflight) = match frame.op_state.take() {
        Some(OpState::SingletonBatch { index, inflight, .. }) => (index, inflight),
        _ => {
            // First entry: if this frame unwinds mid-batch, leaked
            // markers would wedge every later initialization.
            let ids: Vec<[u8; 32]> = identities.to_vec();
            frame.add_finalizer(ScopedFinalizer::Hook(Box::new(move |hook_interp, _f| {
                for id in &ids {
                    hook_interp.singletons.abandon(*id);
                }
                Outcome::Next
            })));
            (0, false)
        }
    };

    loop {
        if index >= identities.len() {
            return Outcome::Next;
        }
        let identity = identities[index];
        let slot = index as SlotIdx;

        if inflight {
            let Some(h) = frame.ready(slot).cloned() else {
                frame.exception = Some(VmException::new(
                    ExceptionKind::Fault(FaultKind::IllegalState),
                    "initializer produced no value",
                ));
                return Outcome::Exception;
            };
            interp.singletons.finish(identity, h);
            interp
                .events
                .append(RuntimeEvent::SingletonInitialized { identity });
            inflight = false;
            index += 1;
            continue;
        }

        match interp.singletons.state(identity) {
            SingletonState::Ready(h) => {
                frame.set_slot(slot, ObjValue::Ready(h));
                index += 1;
            }
            SingletonState::Initializing => {
                interp
                    .events
                    .append(RuntimeEvent::SingletonCircular { identity });
                frame.exception = Some(VmException::circular_init("batch"));
                return Outcome::Exception;
            }
            SingletonState::Absent => {
                let Some(def) = interp.singletons.def(identity) else {
                    frame.exception = Some(VmException::new(
                        ExceptionKind::Fault(FaultKind::IllegalState),
                        "unknown singleton identity",
                    ));
                    return Outcome::Exception;
                };
                interp.singletons.begin(identity);
                let callee = match build_call_frame(
                    interp,
                    &Callable::unbound(def.init),
                    &[],
                    ReturnTarget::Slot(slot),
                ) {
                    Ok(f) => f,
                    Err(e) => {
                        frame.exception = Some(VmException::from_fault(&e));
                        return Outcome::Exception;
                    }
                };
                frame.op_state = Some(OpState::SingletonBatch {
                    identities: identities.to_vec(),
                    index,
                    inflight: true,
                });
                frame.splice_repeat(callee);
                return Outcome::Call;
            }
        }
    }
}

// ─── Cross-service send ops ───────────────────────────────────

fn deep_copy_callable(c: &Callable) -> Callable {
    Callable {
        method: c.method,
        bound: c.bound.as_ref().map(ObjectHandle::deep_copy),
    }
}

struct SendPlan {
    request_id: RequestId,
    reply: Option<Reply>,
    cells: Vec<(SlotIdx, FutureCell)>,
}

/// Allocate futures and response routing for a call's return target.
fn plan_send(interp: &Interp, fiber_id: FiberId, ret_slots: &[SlotIdx]) -> SendPlan {
    let request_id = Uuid::now_v7();
    if ret_slots.is_empty() {
        return SendPlan {
            request_id,
            reply: None,
            cells: Vec::new(),
        };
    }
    let cells: Vec<(SlotIdx, FutureCell)> = ret_slots
        .iter()
        .map(|&s| (s, FutureCell::new()))
        .collect();
    interp.port.register_pending(
        request_id,
        fiber_id,
        cells.iter().map(|(_, c)| c.clone()).collect(),
    );
    SendPlan {
        request_id,
        reply: Some(Reply {
            resp_tx: interp.port.response_sender(),
            request_id,
            target_fiber: Some(fiber_id),
            caller_service: Some(interp.service),
        }),
        cells,
    }
}

fn finish_send(
    interp: &Interp,
    fiber: &mut Fiber,
    target: ServiceId,
    plan: SendPlan,
    body: MessageBody,
) -> Outcome {
    let mut causal = fiber.causal.clone();
    if !causal.contains(&interp.service) {
        causal.push(interp.service);
    }
    let message = Message {
        request_id: plan.request_id,
        caller: Some(CallerRef {
            service: interp.service,
            fiber: fiber.fiber_id,
        }),
        causal,
        deadline: fiber.deadline,
        reply: plan.reply,
        body,
    };
    let frame = fiber.current_frame_mut().expect("frames nonempty");
    match interp.port.post(target, message) {
        Ok(()) => {
            interp.events.append(RuntimeEvent::MessageEnqueued {
                target,
                request: plan.request_id,
            });
            for (slot, cell) in plan.cells {
                frame.set_slot(slot, ObjValue::Future(cell));
            }
            Outcome::Next
        }
        Err(e) => {
            frame.exception = Some(VmException::new(
                ExceptionKind::Unsupported,
                format!("cross-service call failed: {e}"),
            ));
            Outcome::Exception
        }
    }
}

/// Common head of the send ops: materialize the operand slots and read
/// the target service out of the service-handle slot.
fn resolve_send_target(
    interp: &Interp,
    frame: &mut Frame,
    svc: SlotIdx,
    rest: &[SlotIdx],
) -> Result<ServiceId, Outcome> {
    let mut slots = vec![svc];
    slots.extend_from_slice(rest);
    match resolve_arguments(interp, frame, &slots) {
        Outcome::Next => {}
        other => return Err(other),
    }
    match frame.ready(svc).and_then(ObjectHandle::service) {
        Some(target) => Ok(target),
        None => Err(raise(frame, "target is not a service")),
    }
}

fn ret_plan_slots(ret: &ReturnTarget) -> Result<Vec<SlotIdx>, VmException> {
    match ret {
        ReturnTarget::Discard => Ok(Vec::new()),
        ReturnTarget::Slot(i) => Ok(vec![*i]),
        ReturnTarget::Multi(v) => Ok(v.to_vec()),
        ReturnTarget::Tuple(_) | ReturnTarget::Cond { .. } => Err(VmException::new(
            ExceptionKind::Unsupported,
            "unsupported cross-service receiver",
        )),
    }
}

pub(crate) fn send_invoke(
    interp: &Interp,
    fiber: &mut Fiber,
    svc: SlotIdx,
    callee: SlotIdx,
    args: Vec<SlotIdx>,
    ret: ReturnTarget,
) -> Outcome {
    let fiber_id = fiber.fiber_id;
    let frame = fiber.current_frame_mut().expect("frames nonempty");
    let mut rest = vec![callee];
    rest.extend(args.iter().copied());
    let target = match resolve_send_target(interp, frame, svc, &rest) {
        Ok(t) => t,
        Err(outcome) => return outcome,
    };
    let Some(callable) = frame.ready(callee).and_then(ObjectHandle::callable).cloned() else {
        return raise(frame, "callee is not callable");
    };
    let argv: Vec<ObjectHandle> = args
        .iter()
        .filter_map(|&i| frame.ready(i).map(ObjectHandle::deep_copy))
        .collect();

    let ret_slots = match ret_plan_slots(&ret) {
        Ok(v) => v,
        Err(e) => {
            frame.exception = Some(e);
            return Outcome::Exception;
        }
    };
    let plan = plan_send(interp, fiber_id, &ret_slots);
    let body = if ret_slots.len() > 1 {
        MessageBody::InvokeMulti {
            callee: deep_copy_callable(&callable),
            args: argv,
            arity: ret_slots.len(),
        }
    } else {
        MessageBody::Invoke {
            callee: deep_copy_callable(&callable),
            args: argv,
        }
    };
    finish_send(interp, fiber, target, plan, body)
}

pub(crate) fn send_construct(
    interp: &Interp,
    fiber: &mut Fiber,
    svc: SlotIdx,
    class: ClassId,
    type_args: Vec<TypeArg>,
    args: Vec<SlotIdx>,
    dst: SlotIdx,
) -> Outcome {
    let fiber_id = fiber.fiber_id;
    let frame = fiber.current_frame_mut().expect("frames nonempty");
    let target = match resolve_send_target(interp, frame, svc, &args) {
        Ok(t) => t,
        Err(outcome) => return outcome,
    };
    let argv: Vec<ObjectHandle> = args
        .iter()
        .filter_map(|&i| frame.ready(i).map(ObjectHandle::deep_copy))
        .collect();
    let plan = plan_send(interp, fiber_id, &[dst]);
    finish_send(
        interp,
        fiber,
        target,
        plan,
        MessageBody::Construct {
            class,
            type_args,
            args: argv,
        },
    )
}

pub(crate) fn send_property_get(
    interp: &Interp,
    fiber: &mut Fiber,
    svc: SlotIdx,
    target_slot: SlotIdx,
    prop: PropertyId,
    dst: SlotIdx,
) -> Outcome {
    let fiber_id = fiber.fiber_id;
    let frame = fiber.current_frame_mut().expect("frames nonempty");
    let target = match resolve_send_target(interp, frame, svc, &[target_slot]) {
        Ok(t) => t,
        Err(outcome) => return outcome,
    };
    let Some(object) = frame.ready(target_slot).cloned() else {
        return raise(frame, "missing property target");
    };
    let plan = plan_send(interp, fiber_id, &[dst]);
    finish_send(
        interp,
        fiber,
        target,
        plan,
        MessageBody::PropertyGet {
            target: object,
            prop,
        },
    )
}

pub(crate) fn send_property_set(
    interp: &Interp,
    fiber: &mut Fiber,
    svc: SlotIdx,
    target_slot: SlotIdx,
    prop: PropertyId,
    src: SlotIdx,
) -> Outcome {
    let fiber_id = fiber.fiber_id;
    let frame = fiber.current_frame_mut().expect("frames nonempty");
    let target = match resolve_send_target(interp, frame, svc, &[target_slot, src]) {
        Ok(t) => t,
        Err(outcome) => return outcome,
    };
    let (Some(object), Some(value)) = (
        frame.ready(target_slot).cloned(),
        frame.ready(src).map(ObjectHandle::deep_copy),
    ) else {
        return raise(frame, "missing property operands");
    };
    let plan = plan_send(interp, fiber_id, &[]);
    finish_send(
        interp,
        fiber,
        target,
        plan,
        MessageBody::PropertySet {
            target: object,
            prop,
            value,
        },
    )
}

/// Off-main singleton access: batch message to the owning context, a
/// future in `dst`, and a suspension until it completes.
pub(crate) fn send_singleton_batch(
    interp: &Interp,
    fiber: &mut Fiber,
    identities: Vec<[u8; 32]>,
    dst: SlotIdx,
) -> Outcome {
    let fiber_id = fiber.fiber_id;
    let Some(main) = interp.port.main_service() else {
        let frame = fiber.current_frame_mut().expect("frames nonempty");
        frame.exception = Some(VmException::new(
            ExceptionKind::Fault(FaultKind::IllegalState),
            "no main context for singleton initialization",
        ));
        return Outcome::Exception;
    };
    let plan = plan_send(interp, fiber_id, &[dst]);
    match finish_send(
        interp,
        fiber,
        main,
        plan,
        MessageBody::InitSingletons { identities },
    ) {
        Outcome::Next => {
            let frame = fiber.current_frame_mut().expect("frames nonempty");
            frame.pc += 1;
            Outcome::Block
        }
        other => other,
    }
}

fn raise(frame: &mut Frame, message: &str) -> Outcome {
    frame.exception = Some(VmException::new(ExceptionKind::Unsupported, message));
    Outcome::Exception
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::test_shared;
    use crate::interp::Op;
    use crate::module::{ClassDef, Module};
    use crate::types::well_known;

    fn test_module(methods: Vec<MethodDef>) -> Module {
        Module {
            name: "sched".into(),
            constants: vec![],
            classes: vec![ClassDef {
                id: well_known::FIRST_USER,
                name: "Sched".into(),
                superclass: Some(well_known::OBJECT),
                type_params: 0,
                fields: vec![],
                properties: vec![],
                methods,
                default_ctor: None,
                primary_ctor: None,
                finalizer: None,
                auto_init: None,
                singleton: false,
                publish_immutable: true,
            }],
            singletons: vec![],
            entry: None,
        }
    }

    fn bytecode(id: u32, ops: Vec<Op>, max_vars: u16) -> MethodDef {
        MethodDef {
            id,
            name: format!("m{id}"),
            params: vec![],
            returns: 1,
            max_vars,
            max_scopes: 1,
            native: false,
            ops,
        }
    }

    fn invoke_message(method: u32) -> Message {
        Message {
            request_id: Uuid::now_v7(),
            caller: None,
            causal: Vec::new(),
            deadline: None,
            reply: None,
            body: MessageBody::Invoke {
                callee: Callable::unbound(MethodRef {
                    class: well_known::FIRST_USER,
                    method,
                }),
                args: vec![],
            },
        }
    }

    fn context(mode: ReentrancyMode) -> ServiceContext {
        let shared = test_shared();
        let (ctx, _handle) = ServiceContext::new("test", mode, shared);
        ctx
    }

    fn parked_fiber(ctx: &ServiceContext, status: FiberStatus) -> Fiber {
        let mut fiber = Fiber::new(ctx.service_id, None);
        if status != FiberStatus::Initial {
            fiber.transition(FiberStatus::Running).unwrap();
            if status != FiberStatus::Running {
                fiber.transition(status).unwrap();
            }
        }
        fiber
    }

    #[test]
    fn forbidden_pins_current_fiber_and_queues_new_messages() {
        let mut ctx = context(ReentrancyMode::Forbidden);
        let waiting = parked_fiber(&ctx, FiberStatus::Waiting);
        let waiting_id = waiting.fiber_id;
        ctx.fibers.push(waiting);
        let fresh = parked_fiber(&ctx, FiberStatus::Initial);
        ctx.fibers.push(fresh);

        // The pinned fiber is not eligible, so nothing runs — the fresh
        // message does not start.
        assert!(ctx.pick_next().is_none());

        // The response arrives: only the pinned fiber is scheduled.
        ctx.fibers[0].responded = true;
        let picked = ctx.pick_next().unwrap();
        assert_eq!(picked.fiber_id, waiting_id);
    }

    #[test]
    fn exclusive_rejects_initial_fibers_outside_the_causal_chain() {
        let mut ctx = context(ReentrancyMode::Exclusive);
        let own = ctx.service_id;

        // A chain is in flight (Waiting, unresponded).
        ctx.fibers.push(parked_fiber(&ctx, FiberStatus::Waiting));

        // A plain new message is not admitted.
        ctx.fibers.push(parked_fiber(&ctx, FiberStatus::Initial));
        assert!(ctx.pick_next().is_none());

        // A re-entrant call whose chain passed through this service is.
        let mut reentrant = parked_fiber(&ctx, FiberStatus::Initial);
        reentrant.causal.push(own);
        let id = reentrant.fiber_id;
        ctx.fibers.push(reentrant);
        let picked = ctx.pick_next().unwrap();
        assert_eq!(picked.fiber_id, id);
    }

    #[test]
    fn exclusive_admits_new_work_when_idle() {
        let mut ctx = context(ReentrancyMode::Exclusive);
        let fresh = parked_fiber(&ctx, FiberStatus::Initial);
        let id = fresh.fiber_id;
        ctx.fibers.push(fresh);
        assert_eq!(ctx.pick_next().map(|f| f.fiber_id), Some(id));
    }

    #[test]
    fn prioritized_prefers_paused_then_yielded_then_new() {
        let mut ctx = context(ReentrancyMode::Prioritized);
        let initial = parked_fiber(&ctx, FiberStatus::Initial);
        let yielded = parked_fiber(&ctx, FiberStatus::Yielded);
        let paused = parked_fiber(&ctx, FiberStatus::Paused);
        let (i_id, y_id, p_id) = (initial.fiber_id, yielded.fiber_id, paused.fiber_id);
        ctx.fibers.extend([initial, yielded, paused]);

        assert_eq!(ctx.pick_next().map(|f| f.fiber_id), Some(p_id));
        assert_eq!(ctx.pick_next().map(|f| f.fiber_id), Some(y_id));
        assert_eq!(ctx.pick_next().map(|f| f.fiber_id), Some(i_id));
    }

    #[test]
    fn waiting_fibers_need_the_responded_flag_under_every_mode() {
        for mode in [
            ReentrancyMode::Prioritized,
            ReentrancyMode::Open,
            ReentrancyMode::Exclusive,
        ] {
            let mut ctx = context(mode);
            ctx.fibers.push(parked_fiber(&ctx, FiberStatus::Waiting));
            assert!(ctx.pick_next().is_none(), "{mode:?} promoted without flag");
            ctx.fibers[0].responded = true;
            assert!(ctx.pick_next().is_some(), "{mode:?} ignored the flag");
        }
    }

    /// Op-budget fairness: a tight loop shares the service with a
    /// yielded fiber; the loop is sliced by the budget and the other
    /// fiber runs in between.
    #[test]
    fn op_budget_interleaves_fibers() {
        let mut ctx = context(ReentrancyMode::Open);
        let module = test_module(vec![
            // m0: for (i = 0; i < 1000; i++) {}
            bytecode(
                0,
                vec![
                    Op::LoadInt { value: 0, dst: 0 },
                    Op::LoadInt { value: 1000, dst: 1 },
                    Op::IncSlot { slot: 0 },
                    Op::JumpIfLt { a: 0, b: 1, target: 2 },
                    Op::Return1 { src: 0 },
                ],
                2,
            ),
            // m1: yield once, then finish.
            bytecode(
                1,
                vec![
                    Op::Yield,
                    Op::LoadInt { value: 1, dst: 0 },
                    Op::Return1 { src: 0 },
                ],
                1,
            ),
        ]);
        ctx.shared.registry.load_module(&module).unwrap();

        ctx.accept_message(invoke_message(0));
        ctx.accept_message(invoke_message(1));
        let ids: Vec<FiberId> = ctx.fibers.iter().map(|f| f.fiber_id).collect();
        let (loop_id, yield_id) = (ids[0], ids[1]);

        let mut schedule = Vec::new();
        while let Some(fiber) = ctx.pick_next() {
            schedule.push(fiber.fiber_id);
            ctx.run_slice(fiber);
        }
        assert!(ctx.fibers.is_empty(), "both fibers ran to completion");

        let loop_slices = schedule.iter().filter(|id| **id == loop_id).count();
        assert!(
            (150..=400).contains(&loop_slices),
            "loop should take ~200 budget slices, took {loop_slices}"
        );
        let last_loop = schedule.iter().rposition(|id| *id == loop_id).unwrap();
        let yield_runs: Vec<usize> = schedule
            .iter()
            .enumerate()
            .filter(|(_, id)| **id == yield_id)
            .map(|(i, _)| i)
            .collect();
        assert!(yield_runs.len() >= 2, "yielded fiber resumed at least once");
        assert!(
            yield_runs.iter().any(|&i| i > 0 && i < last_loop),
            "yielded fiber ran between the loop's slices"
        );
    }
}
