//! In-process compute platform for tests.
//!
//! Functions are kept in a map, invocations run a scripted handler after an
//! optional delay, and counters record what the driver did. Functions go
//! through the same `Pending -> Active -> Updating -> Active` states as on
//! Lambda, and calls made before a function settles are rejected the same
//! way.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ComputePlatform, FunctionSpec, InvokeResponse, TriggerGrant};
use crate::error::PlatformError;

pub type InvokeHandler = Arc<dyn Fn(&[u8]) -> Result<InvokeResponse, PlatformError> + Send + Sync>;
pub type LatencyFn = Arc<dyn Fn(&[u8]) -> Duration + Send + Sync>;

/// Lifecycle state of a deployed function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionState {
    /// Created, not yet invocable.
    Pending,
    Active,
    /// A code or configuration update is in progress.
    Updating,
}

#[derive(Debug, Clone)]
pub struct DeployedFunction {
    pub spec: FunctionSpec,
    pub code: Bytes,
    pub arn: String,
    pub state: FunctionState,
}

impl DeployedFunction {
    /// Updates are only accepted on a settled function.
    fn begin_update(&mut self) -> Result<(), PlatformError> {
        match self.state {
            FunctionState::Active => {
                self.state = FunctionState::Updating;
                Ok(())
            }
            state => Err(PlatformError::Conflict(format!(
                "function {} is {:?}, an update is in progress",
                self.spec.name, state
            ))),
        }
    }
}

#[derive(Default)]
struct Counters {
    creates: AtomicUsize,
    code_updates: AtomicUsize,
    config_updates: AtomicUsize,
    invocations: AtomicUsize,
    completed: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct InMemoryPlatform {
    functions: Arc<Mutex<HashMap<String, DeployedFunction>>>,
    statements: Arc<Mutex<HashMap<String, HashSet<TriggerGrant>>>>,
    payloads: Arc<Mutex<Vec<Bytes>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    counters: Arc<Counters>,
    handler: InvokeHandler,
    latency: LatencyFn,
    failing_create: Arc<Mutex<Option<String>>>,
    failing_permission: Arc<Mutex<Option<String>>>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    /// Every invocation answers `["1","1","0.5"]` immediately.
    pub fn new() -> Self {
        Self {
            functions: Arc::default(),
            statements: Arc::default(),
            payloads: Arc::default(),
            deleted: Arc::default(),
            counters: Arc::default(),
            handler: Arc::new(|_| Ok(InvokeResponse::ok(r#"["1","1","0.5"]"#))),
            latency: Arc::new(|_| Duration::ZERO),
            failing_create: Arc::default(),
            failing_permission: Arc::default(),
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[u8]) -> Result<InvokeResponse, PlatformError> + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.with_latency_fn(move |_| latency)
    }

    pub fn with_latency_fn<F>(mut self, latency: F) -> Self
    where
        F: Fn(&[u8]) -> Duration + Send + Sync + 'static,
    {
        self.latency = Arc::new(latency);
        self
    }

    /// Makes creating `function` fail with a non-conflict error.
    pub fn fail_create_of(&self, function: &str) {
        *self.failing_create.lock().unwrap_or_else(|e| e.into_inner()) = Some(function.to_string());
    }

    /// Makes granting permissions on `function` fail with a non-conflict error.
    pub fn fail_permission_on(&self, function: &str) {
        *self.failing_permission.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(function.to_string());
    }

    pub fn function(&self, name: &str) -> Option<DeployedFunction> {
        let functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        functions.get(name).cloned()
    }

    pub fn function_count(&self) -> usize {
        self.functions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn statements(&self, function: &str) -> Vec<TriggerGrant> {
        let statements = self.statements.lock().unwrap_or_else(|e| e.into_inner());
        statements
            .get(function)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Payloads of every invocation, in the order the calls arrived.
    pub fn payloads(&self) -> Vec<Bytes> {
        self.payloads.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn creates(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn code_updates(&self) -> usize {
        self.counters.code_updates.load(Ordering::SeqCst)
    }

    pub fn config_updates(&self) -> usize {
        self.counters.config_updates.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.counters.invocations.load(Ordering::SeqCst)
    }

    /// Invocations that ran to the end of their latency.
    pub fn completed_invocations(&self) -> usize {
        self.counters.completed.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    fn arn(name: &str) -> String {
        format!("arn:aws:lambda:us-east-1:000000000000:function:{}", name)
    }

    fn lookup<'a>(
        functions: &'a mut HashMap<String, DeployedFunction>,
        function: &str,
    ) -> Result<&'a mut DeployedFunction, PlatformError> {
        // accept either the name or the ARN, like the real service
        let name = function.rsplit(':').next().unwrap_or(function);
        functions
            .get_mut(name)
            .ok_or_else(|| PlatformError::Other(format!("function not found: {}", function)))
    }
}

/// Decrements the in-flight counter even when the invocation is aborted.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ComputePlatform for InMemoryPlatform {
    async fn create_function(&self, spec: &FunctionSpec, code: Bytes) -> Result<String, PlatformError> {
        if self.failing_create.lock().unwrap_or_else(|e| e.into_inner()).as_deref()
            == Some(spec.name.as_str())
        {
            return Err(PlatformError::Other(format!("invalid role for {}", spec.name)));
        }
        let mut functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        if functions.contains_key(&spec.name) {
            return Err(PlatformError::Conflict(format!(
                "function {} already exists",
                spec.name
            )));
        }
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        let arn = Self::arn(&spec.name);
        functions.insert(
            spec.name.clone(),
            DeployedFunction {
                spec: spec.clone(),
                code,
                arn: arn.clone(),
                state: FunctionState::Pending,
            },
        );
        Ok(arn)
    }

    async fn update_function_code(&self, function: &str, code: Bytes) -> Result<String, PlatformError> {
        let mut functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        let deployed = Self::lookup(&mut functions, function)?;
        deployed.begin_update()?;
        self.counters.code_updates.fetch_add(1, Ordering::SeqCst);
        deployed.code = code;
        Ok(deployed.arn.clone())
    }

    async fn update_function_configuration(&self, spec: &FunctionSpec) -> Result<(), PlatformError> {
        let mut functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        let deployed = Self::lookup(&mut functions, &spec.name)?;
        deployed.begin_update()?;
        self.counters.config_updates.fetch_add(1, Ordering::SeqCst);
        deployed.spec = spec.clone();
        Ok(())
    }

    async fn add_permission(&self, function: &str, grant: &TriggerGrant) -> Result<(), PlatformError> {
        let name = {
            let mut functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
            Self::lookup(&mut functions, function)?.spec.name.clone()
        };
        if self.failing_permission.lock().unwrap_or_else(|e| e.into_inner()).as_deref()
            == Some(name.as_str())
        {
            return Err(PlatformError::Other("access denied".to_string()));
        }
        let mut statements = self.statements.lock().unwrap_or_else(|e| e.into_inner());
        let granted = statements.entry(name).or_default();
        if granted.iter().any(|g| g.statement_id == grant.statement_id) {
            return Err(PlatformError::Conflict(format!(
                "statement {} already exists",
                grant.statement_id
            )));
        }
        granted.insert(grant.clone());
        Ok(())
    }

    async fn wait_until_active(&self, function: &str) -> Result<(), PlatformError> {
        let mut functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        let deployed = Self::lookup(&mut functions, function)?;
        if deployed.state == FunctionState::Pending {
            deployed.state = FunctionState::Active;
        }
        Ok(())
    }

    async fn wait_until_updated(&self, function: &str) -> Result<(), PlatformError> {
        let mut functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        let deployed = Self::lookup(&mut functions, function)?;
        if deployed.state == FunctionState::Updating {
            deployed.state = FunctionState::Active;
        }
        Ok(())
    }

    async fn invoke(&self, function: &str, payload: Bytes) -> Result<InvokeResponse, PlatformError> {
        {
            let mut functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
            let deployed = Self::lookup(&mut functions, function)?;
            if deployed.state == FunctionState::Pending {
                return Err(PlatformError::Conflict(format!(
                    "function {} is still being created",
                    deployed.spec.name
                )));
            }
        }
        self.counters.invocations.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.clone());

        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.counters.in_flight);
        self.counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = (self.latency)(&payload);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        (self.handler)(&payload)
    }

    async fn delete_function(&self, function: &str) -> Result<(), PlatformError> {
        let mut functions = self.functions.lock().unwrap_or_else(|e| e.into_inner());
        let name = Self::lookup(&mut functions, function)?.spec.name.clone();
        functions.remove(&name);
        self.deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name);
        Ok(())
    }
}
