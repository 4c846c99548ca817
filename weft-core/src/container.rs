use crate::composition::CompositionRegistry;
use crate::dispatch::NativeRegistry;
use crate::errors::{VmError, VmException};
use crate::events::{EventLog, RuntimeEvent};
use crate::fiber::CallerRef;
use crate::handle::{lock, Callable, ObjectHandle};
use crate::module::{
    self, singleton_identity, MemoryModuleStore, Module, ModuleStore, SingletonDef,
};
use crate::oracle::ClassTableOracle;
use crate::service::{
    Control, Message, MessageBody, ReentrancyMode, Reply, Response, ServiceContext, ServiceHandle,
    ServiceStatus,
};
use crate::types::{ServiceId, TypeArg};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ─── Runtime configuration ────────────────────────────────────

/// What an `assert` op does on failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssertSeverity {
    /// Log and continue.
    Log,
    /// Raise a catchable `AssertionFailed`.
    Raise,
    /// Raise an uncatchable fault.
    Fatal,
}

impl AssertSeverity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "log" => Some(AssertSeverity::Log),
            "raise" => Some(AssertSeverity::Raise),
            "fatal" => Some(AssertSeverity::Fatal),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Ops per scheduling slice before a fiber is demoted to Paused.
    pub op_budget: usize,
    /// Re-entrancy mode for newly created services.
    pub reentrancy: ReentrancyMode,
    /// Print runtime events on shutdown (CLI surface).
    pub trace_events: bool,
    pub assert: AssertSeverity,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            op_budget: 10,
            reentrancy: ReentrancyMode::Open,
            trace_events: false,
            assert: AssertSeverity::Raise,
        }
    }
}

// ─── Singleton table ──────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum SingletonState {
    Absent,
    Initializing,
    Ready(ObjectHandle),
}

enum TableEntry {
    Initializing,
    Ready(ObjectHandle),
}

/// Process-wide singleton handle table, content-addressed by identity.
/// Each identity initializes at most once; a nested re-entry on the same
/// identity is the circular-initialization fault.
pub struct SingletonTable {
    states: Mutex<HashMap<[u8; 32], TableEntry>>,
    defs: Mutex<HashMap<[u8; 32], SingletonDef>>,
    /// Declaration order, for whole-module batch initialization.
    order: Mutex<Vec<[u8; 32]>>,
}

impl SingletonTable {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            defs: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn register_module(&self, module: &Module) {
        let mut defs = lock(&self.defs);
        let mut order = lock(&self.order);
        for def in &module.singletons {
            let identity = singleton_identity(def);
            if defs.insert(identity, def.clone()).is_none() {
                order.push(identity);
            }
        }
    }

    pub fn identities(&self) -> Vec<[u8; 32]> {
        lock(&self.order).clone()
    }

    pub fn def(&self, identity: [u8; 32]) -> Option<SingletonDef> {
        lock(&self.defs).get(&identity).cloned()
    }

    pub fn state(&self, identity: [u8; 32]) -> SingletonState {
        match lock(&self.states).get(&identity) {
            None => SingletonState::Absent,
            Some(TableEntry::Initializing) => SingletonState::Initializing,
            Some(TableEntry::Ready(h)) => SingletonState::Ready(h.clone()),
        }
    }

    /// Mark an identity as initializing. Returns false when it was
    /// already marked or published.
    pub fn begin(&self, identity: [u8; 32]) -> bool {
        let mut w = lock(&self.states);
        if w.contains_key(&identity) {
            return false;
        }
        w.insert(identity, TableEntry::Initializing);
        true
    }

    /// Publish the initialized handle. Never overwrites a published one.
    pub fn finish(&self, identity: [u8; 32], handle: ObjectHandle) {
        let mut w = lock(&self.states);
        match w.get(&identity) {
            Some(TableEntry::Ready(_)) => {}
            _ => {
                w.insert(identity, TableEntry::Ready(handle));
            }
        }
    }

    /// Roll back an abandoned initialization; no partial handle is ever
    /// published.
    pub fn abandon(&self, identity: [u8; 32]) {
        let mut w = lock(&self.states);
        if matches!(w.get(&identity), Some(TableEntry::Initializing)) {
            w.remove(&identity);
        }
    }
}

impl Default for SingletonTable {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Shared container state ───────────────────────────────────

pub type UnhandledHook = Box<dyn Fn(ServiceId, &VmException) + Send + Sync>;

/// Process-wide state every service context references: type info,
/// dispatch tables, module store, singleton table, event log, and the
/// service registry.
pub struct ContainerShared {
    pub registry: CompositionRegistry,
    pub natives: NativeRegistry,
    pub oracle: Arc<ClassTableOracle>,
    pub modules: Arc<dyn ModuleStore>,
    pub events: EventLog,
    pub config: RuntimeConfig,
    pub singletons: SingletonTable,
    services: RwLock<HashMap<ServiceId, ServiceHandle>>,
    main: OnceLock<ServiceId>,
    unhandled: RwLock<Option<UnhandledHook>>,
    call_timeout: RwLock<Option<Duration>>,
}

impl ContainerShared {
    fn new(config: RuntimeConfig) -> Self {
        let oracle = ClassTableOracle::from_module(&module::intrinsic_module());
        Self {
            registry: CompositionRegistry::new(),
            natives: NativeRegistry::with_intrinsics(),
            oracle: Arc::new(oracle),
            modules: Arc::new(MemoryModuleStore::new()),
            events: EventLog::new(),
            config,
            singletons: SingletonTable::new(),
            services: RwLock::new(HashMap::new()),
            main: OnceLock::new(),
            unhandled: RwLock::new(None),
            call_timeout: RwLock::new(None),
        }
    }

    pub fn main_service(&self) -> Option<ServiceId> {
        self.main.get().copied()
    }

    pub fn service_handle(&self, id: ServiceId) -> Option<ServiceHandle> {
        let r = self.services.read().unwrap_or_else(|e| e.into_inner());
        r.get(&id).cloned()
    }

    pub fn post(&self, target: ServiceId, message: Message) -> Result<(), VmError> {
        let handle = self
            .service_handle(target)
            .ok_or(VmError::ServiceUnavailable(target))?;
        handle
            .msg_tx
            .send(message)
            .map_err(|_| VmError::ServiceUnavailable(target))
    }

    pub fn report_unhandled(&self, service: ServiceId, exc: &VmException) {
        let r = self.unhandled.read().unwrap_or_else(|e| e.into_inner());
        match r.as_ref() {
            Some(hook) => hook(service, exc),
            None => {
                tracing::warn!(service = %service, exception = %exc, "unhandled exception; dropping fiber");
            }
        }
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        *self.call_timeout.read().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Container ────────────────────────────────────────────────

/// A program result: one or many handles, or the exception that ended
/// the fiber.
pub type CallResult = Result<Vec<ObjectHandle>, VmException>;

/// Host entry point: owns the shared state, the service registry, and
/// the executor tasks. Embedders create a container, load modules,
/// create services, and submit calls.
pub struct Container {
    shared: Arc<ContainerShared>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Container {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(ContainerShared::new(config)),
            joins: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(&self) -> &Arc<ContainerShared> {
        &self.shared
    }

    pub fn events(&self) -> &EventLog {
        &self.shared.events
    }

    pub fn set_unhandled_hook(&self, hook: UnhandledHook) {
        let mut w = self
            .shared
            .unhandled
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *w = Some(hook);
    }

    /// Default timeout applied to submitted calls (None = unbounded).
    pub fn set_call_timeout(&self, timeout: Option<Duration>) {
        let mut w = self
            .shared
            .call_timeout
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *w = timeout;
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.shared.call_timeout()
    }

    /// Register a verified module: class directory, oracle facts,
    /// singleton identities, and the module store.
    pub async fn load_module(&self, module: Module) -> Result<[u8; 32], VmError> {
        let errors = module::verify_module(&module);
        if !errors.is_empty() {
            let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(VmError::CorruptModule(msgs.join("; ")));
        }
        let version = self.shared.registry.load_module(&module)?;
        self.shared.oracle.absorb(&module);
        self.shared.singletons.register_module(&module);
        self.shared.events.append(RuntimeEvent::ModuleLoaded {
            name: module.name.clone(),
            version,
        });
        self.shared
            .modules
            .store_module(version, module)
            .await
            .map_err(|e| VmError::Internal(e.to_string()))?;
        Ok(version)
    }

    pub async fn load_module_bytes(&self, bytes: &[u8]) -> Result<[u8; 32], VmError> {
        let module = module::load_module(bytes)?;
        self.load_module(module).await
    }

    /// Spawn a service context on the runtime. The first service created
    /// becomes the main context (singleton owner).
    pub fn create_service(&self, name: impl Into<String>, mode: ReentrancyMode) -> ServiceId {
        let (ctx, handle) = ServiceContext::new(name, mode, Arc::clone(&self.shared));
        let id = handle.service_id;
        {
            let mut w = self
                .shared
                .services
                .write()
                .unwrap_or_else(|e| e.into_inner());
            w.insert(id, handle.clone());
        }
        let _ = self.shared.main.set(id);
        self.shared.events.append(RuntimeEvent::ServiceCreated {
            service: id,
            name: handle.name.clone(),
        });
        let join = tokio::spawn(ctx.run());
        self.joins.lock().unwrap_or_else(|e| e.into_inner()).push(join);
        id
    }

    async fn submit(
        &self,
        service: ServiceId,
        body: MessageBody,
        caller: Option<CallerRef>,
    ) -> Result<CallResult, VmError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<Response>();
        let request_id = Uuid::now_v7();
        let deadline = self.shared.call_timeout().map(|d| Instant::now() + d);
        let message = Message {
            request_id,
            caller,
            causal: Vec::new(),
            deadline,
            reply: Some(Reply {
                resp_tx,
                request_id,
                target_fiber: None,
                caller_service: None,
            }),
            body,
        };
        self.shared.post(service, message)?;
        match resp_rx.recv().await {
            Some(resp) => Ok(resp.result),
            None => Err(VmError::ServiceUnavailable(service)),
        }
    }

    /// Invoke a callable on a service, awaiting `arity` results.
    pub async fn invoke(
        &self,
        service: ServiceId,
        callee: Callable,
        args: Vec<ObjectHandle>,
        arity: usize,
    ) -> Result<CallResult, VmError> {
        let body = if arity > 1 {
            MessageBody::InvokeMulti {
                callee,
                args,
                arity,
            }
        } else {
            MessageBody::Invoke { callee, args }
        };
        self.submit(service, body, None).await
    }

    /// Construct an instance on a service, awaiting the handle.
    pub async fn construct(
        &self,
        service: ServiceId,
        class: crate::types::ClassId,
        type_args: Vec<TypeArg>,
        args: Vec<ObjectHandle>,
    ) -> Result<CallResult, VmError> {
        self.submit(
            service,
            MessageBody::Construct {
                class,
                type_args,
                args,
            },
            None,
        )
        .await
    }

    /// Read a property through a service's context.
    pub async fn get_property(
        &self,
        service: ServiceId,
        target: ObjectHandle,
        prop: crate::types::PropertyId,
    ) -> Result<CallResult, VmError> {
        self.submit(service, MessageBody::PropertyGet { target, prop }, None)
            .await
    }

    /// Write a property through a service's context.
    pub async fn set_property(
        &self,
        service: ServiceId,
        target: ObjectHandle,
        prop: crate::types::PropertyId,
        value: ObjectHandle,
    ) -> Result<CallResult, VmError> {
        self.submit(
            service,
            MessageBody::PropertySet {
                target,
                prop,
                value,
            },
            None,
        )
        .await
    }

    /// Initialize every registered singleton identity, in order, on the
    /// main context.
    pub async fn init_singletons(&self) -> Result<CallResult, VmError> {
        let main = self
            .shared
            .main_service()
            .ok_or(VmError::Internal("no main service".into()))?;
        let identities = self.shared.singletons.identities();
        if identities.is_empty() {
            return Ok(Ok(Vec::new()));
        }
        self.submit(main, MessageBody::InitSingletons { identities }, None)
            .await
    }

    /// Resolve a module by name and invoke its entry point on the main
    /// service with the given string arguments.
    pub async fn run_entry(
        &self,
        module_name: &str,
        argv: Vec<String>,
    ) -> Result<CallResult, VmError> {
        let module = self
            .shared
            .modules
            .resolve(module_name)
            .await
            .map_err(|e| VmError::Internal(e.to_string()))?
            .ok_or_else(|| VmError::ModuleNotFound(module_name.to_string()))?;
        let entry = module
            .entry
            .ok_or_else(|| VmError::CorruptModule("module has no entry point".into()))?;
        let main = self
            .shared
            .main_service()
            .ok_or(VmError::Internal("no main service".into()))?;
        let arity = self
            .shared
            .registry
            .method_def(entry)
            .map(|d| d.returns as usize)
            .unwrap_or(1);
        let args: Vec<ObjectHandle> = argv.iter().map(ObjectHandle::of_str).collect();
        self.invoke(main, Callable::unbound(entry), args, arity.max(1))
            .await
    }

    /// Graceful shutdown: every service drains its queues, refuses new
    /// messages, and terminates; waits for the executor tasks.
    pub async fn shutdown(&self) {
        let handles: Vec<ServiceHandle> = {
            let r = self
                .shared
                .services
                .read()
                .unwrap_or_else(|e| e.into_inner());
            r.values().cloned().collect()
        };
        for handle in &handles {
            let _ = handle.msg_tx.send(Message {
                request_id: Uuid::now_v7(),
                caller: None,
                causal: Vec::new(),
                deadline: None,
                reply: None,
                body: MessageBody::Control(Control::Shutdown),
            });
        }
        let joins: Vec<JoinHandle<()>> = {
            let mut w = self.joins.lock().unwrap_or_else(|e| e.into_inner());
            w.drain(..).collect()
        };
        for join in joins {
            let _ = join.await;
        }
    }

    pub fn inspect(&self, service: ServiceId) -> Option<ServiceInspection> {
        let handle = self.shared.service_handle(service)?;
        Some(ServiceInspection {
            service,
            name: handle.name.clone(),
            status: handle.stats.status(),
            fibers: handle
                .stats
                .fibers
                .load(std::sync::atomic::Ordering::Acquire),
            runtime_nanos: handle
                .stats
                .runtime_nanos
                .load(std::sync::atomic::Ordering::Relaxed),
        })
    }
}

/// Snapshot of one service for the host.
#[derive(Clone, Debug)]
pub struct ServiceInspection {
    pub service: ServiceId,
    pub name: String,
    pub status: ServiceStatus,
    pub fibers: usize,
    pub runtime_nanos: u64,
}

#[cfg(test)]
pub(crate) fn test_shared() -> Arc<ContainerShared> {
    Arc::new(ContainerShared::new(RuntimeConfig::default()))
}
