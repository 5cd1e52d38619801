use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use clawdeploy_agent_report::AgentEvent;
use futures::StreamExt;

use crate::agent_clients::decision_agent::{AgentEventStream, AgentRunRequest, DecisionAgent};
use crate::ingress::IngressSync;
use crate::models::instance::{Instance, InstancePatch, InstanceStatus, NewInstance};
use crate::rebuild::ImageBuilder;
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};
use crate::store::InstanceStore;

fn now() -> chrono::NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

pub fn instance(id: &str, owner_id: &str, status: InstanceStatus) -> Instance {
    Instance {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        name: "bot".to_string(),
        model: "gpt-5.2".to_string(),
        channel: "telegram".to_string(),
        ai_provider: Some("openai".to_string()),
        api_key: Some("sk-test".to_string()),
        bot_token: Some("123:abc".to_string()),
        gateway_token: Some("ab".repeat(32)),
        status,
        container_ref: None,
        port: None,
        created_at: now(),
        updated_at: now(),
    }
}

#[derive(Default)]
pub struct MemoryInstanceStore {
    records: Mutex<BTreeMap<String, Instance>>,
    update_calls: AtomicUsize,
    failing_updates: Mutex<HashSet<usize>>,
    fail_create: AtomicBool,
}

impl MemoryInstanceStore {
    pub fn insert(&self, instance: Instance) {
        self.records
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance);
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Makes the `n`-th update from now (1-based) fail.
    pub fn fail_nth_update(&self, n: usize) {
        let target = self.update_calls.load(Ordering::SeqCst) + n;
        self.failing_updates.lock().unwrap().insert(target);
    }

    pub fn fail_creates(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn create(&self, new: NewInstance) -> anyhow::Result<Instance> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("insert failed");
        }
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&new.id) {
            anyhow::bail!("duplicate key {}", new.id);
        }
        let instance = Instance {
            id: new.id,
            owner_id: new.owner_id,
            name: new.name,
            model: new.model,
            channel: new.channel,
            ai_provider: new.ai_provider,
            api_key: new.api_key,
            bot_token: new.bot_token,
            gateway_token: None,
            status: new.status,
            container_ref: None,
            port: None,
            created_at: now(),
            updated_at: now(),
        };
        records.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Instance>> {
        Ok(self.get(id))
    }

    async fn list_for_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Instance>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn list_with_status(&self, statuses: &[InstanceStatus]) -> anyhow::Result<Vec<Instance>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|i| statuses.contains(&i.status))
            .cloned()
            .collect())
    }

    async fn update(&self, id: &str, patch: InstancePatch) -> anyhow::Result<Instance> {
        let call = self.update_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_updates.lock().unwrap().remove(&call) {
            anyhow::bail!("update {call} failed");
        }

        let mut records = self.records.lock().unwrap();
        let instance = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("instance {id} vanished during update"))?;
        patch.apply_to(instance, now());
        Ok(instance.clone())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.records.lock().unwrap().remove(id).is_some())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub instance_id: String,
    pub port: u16,
    pub running: bool,
    pub env: BTreeMap<String, String>,
}

#[derive(Default)]
struct FakeRuntimeState {
    containers: BTreeMap<String, FakeContainer>,
    next_id: usize,
    create_attempts: usize,
    port_conflicts: usize,
    create_failures: VecDeque<String>,
    start_failures: HashSet<String>,
    stop_failures: HashSet<String>,
    remove_failures: HashSet<String>,
    status_overrides: BTreeMap<String, ContainerStatus>,
    status_failures: HashSet<String>,
    create_stopped: bool,
    next_start_failure: Option<String>,
    calls: Vec<String>,
}

/// In-memory engine with scripted failures.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeRuntimeState>,
}

impl FakeRuntime {
    pub fn seed_running(&self, container_ref: &str, instance_id: &str, port: u16) {
        self.state.lock().unwrap().containers.insert(
            container_ref.to_string(),
            FakeContainer {
                instance_id: instance_id.to_string(),
                port,
                running: true,
                env: BTreeMap::new(),
            },
        );
    }

    pub fn fail_creates_with_port_conflict(&self, times: usize) {
        self.state.lock().unwrap().port_conflicts = times;
    }

    pub fn fail_next_create(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .create_failures
            .push_back(message.to_string());
    }

    /// New containers come up exited, as an engine that ignores the start
    /// request would leave them.
    pub fn create_stopped(&self) {
        self.state.lock().unwrap().create_stopped = true;
    }

    /// Fails the next `start` call, whichever container it targets.
    pub fn fail_next_start(&self, message: &str) {
        self.state.lock().unwrap().next_start_failure = Some(message.to_string());
    }

    pub fn fail_start(&self, container_ref: &str) {
        self.state
            .lock()
            .unwrap()
            .start_failures
            .insert(container_ref.to_string());
    }

    pub fn fail_stop(&self, container_ref: &str) {
        self.state
            .lock()
            .unwrap()
            .stop_failures
            .insert(container_ref.to_string());
    }

    pub fn fail_remove(&self, container_ref: &str) {
        self.state
            .lock()
            .unwrap()
            .remove_failures
            .insert(container_ref.to_string());
    }

    pub fn fail_status(&self, container_ref: &str) {
        self.state
            .lock()
            .unwrap()
            .status_failures
            .insert(container_ref.to_string());
    }

    pub fn set_status(&self, container_ref: &str, status: ContainerStatus) {
        self.state
            .lock()
            .unwrap()
            .status_overrides
            .insert(container_ref.to_string(), status);
    }

    /// Simulates a container removed behind the orchestrator's back.
    pub fn vanish(&self, container_ref: &str) {
        self.state.lock().unwrap().containers.remove(container_ref);
    }

    pub fn create_attempts(&self) -> usize {
        self.state.lock().unwrap().create_attempts
    }

    pub fn exists(&self, container_ref: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .contains_key(container_ref)
    }

    pub fn is_running(&self, container_ref: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_ref)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn container(&self, container_ref: &str) -> Option<FakeContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_ref)
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec, host_port: u16) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.create_attempts += 1;
        state.calls.push(format!("create:{}", spec.instance_id));
        if state.port_conflicts > 0 {
            state.port_conflicts -= 1;
            return Err(RuntimeError::PortConflict { port: host_port });
        }
        if let Some(message) = state.create_failures.pop_front() {
            return Err(RuntimeError::Other {
                operation: "create_container",
                target: spec.instance_id.clone(),
                message,
            });
        }
        state.next_id += 1;
        let container_ref = format!("fake-{}", state.next_id);
        let mut env = spec.env.clone();
        env.insert(
            "OPENCLAW_GATEWAY_TOKEN".to_string(),
            spec.gateway_token.clone(),
        );
        let running = !state.create_stopped;
        state.containers.insert(
            container_ref.clone(),
            FakeContainer {
                instance_id: spec.instance_id.clone(),
                port: host_port,
                running,
                env,
            },
        );
        Ok(container_ref)
    }

    async fn start(&self, container_ref: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start:{container_ref}"));
        if let Some(message) = state.next_start_failure.take() {
            return Err(RuntimeError::Other {
                operation: "start_container",
                target: container_ref.to_string(),
                message,
            });
        }
        if state.start_failures.contains(container_ref) {
            return Err(RuntimeError::Other {
                operation: "start_container",
                target: container_ref.to_string(),
                message: "start refused".to_string(),
            });
        }
        let container = state
            .containers
            .get_mut(container_ref)
            .ok_or_else(|| RuntimeError::NotFound(container_ref.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, container_ref: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop:{container_ref}"));
        if state.stop_failures.contains(container_ref) {
            return Err(RuntimeError::Other {
                operation: "stop_container",
                target: container_ref.to_string(),
                message: "stop refused".to_string(),
            });
        }
        let container = state
            .containers
            .get_mut(container_ref)
            .ok_or_else(|| RuntimeError::NotFound(container_ref.to_string()))?;
        container.running = false;
        Ok(())
    }

    async fn remove(&self, container_ref: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove:{container_ref}"));
        if state.remove_failures.contains(container_ref) {
            return Err(RuntimeError::Other {
                operation: "remove_container",
                target: container_ref.to_string(),
                message: "remove refused".to_string(),
            });
        }
        state
            .containers
            .remove(container_ref)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(container_ref.to_string()))
    }

    async fn status(&self, container_ref: &str) -> Result<ContainerStatus, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.status_failures.contains(container_ref) {
            return Err(RuntimeError::Other {
                operation: "inspect_container",
                target: container_ref.to_string(),
                message: "engine unavailable".to_string(),
            });
        }
        if let Some(status) = state.status_overrides.get(container_ref) {
            return Ok(*status);
        }
        Ok(match state.containers.get(container_ref) {
            Some(c) if c.running => ContainerStatus::Running,
            Some(_) => ContainerStatus::Exited,
            None => ContainerStatus::NotFound,
        })
    }

    async fn logs(&self, container_ref: &str, tail: usize) -> Result<String, RuntimeError> {
        let state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_ref) {
            return Err(RuntimeError::NotFound(container_ref.to_string()));
        }
        Ok(format!("{container_ref} tail={tail}\n"))
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingIngress {
    syncs: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingIngress {
    pub fn failing() -> Self {
        Self {
            syncs: AtomicUsize::new(0),
            fail: AtomicBool::new(true),
        }
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IngressSync for RecordingIngress {
    async fn sync(&self) -> anyhow::Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("nginx reload failed");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeImageBuilder {
    builds: AtomicUsize,
    fail: AtomicBool,
}

impl FakeImageBuilder {
    pub fn failing() -> Self {
        Self {
            builds: AtomicUsize::new(0),
            fail: AtomicBool::new(true),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
    async fn rebuild(&self) -> anyhow::Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("docker build exited with 1");
        }
        Ok(())
    }
}

struct ScriptedRun {
    events: Vec<AgentEvent>,
    stall: bool,
}

/// Replays queued event scripts, one per run. With nothing queued,
/// `start_run` fails.
#[derive(Default)]
pub struct ScriptedAgent {
    runs: Mutex<VecDeque<ScriptedRun>>,
    started: AtomicUsize,
}

impl ScriptedAgent {
    pub fn push_run(&self, events: Vec<AgentEvent>) {
        self.runs.lock().unwrap().push_back(ScriptedRun {
            events,
            stall: false,
        });
    }

    /// A run that emits `events` and then never finishes.
    pub fn push_stalled_run(&self, events: Vec<AgentEvent>) {
        self.runs.lock().unwrap().push_back(ScriptedRun {
            events,
            stall: true,
        });
    }

    pub fn runs_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionAgent for ScriptedAgent {
    async fn start_run(&self, _request: &AgentRunRequest) -> anyhow::Result<AgentEventStream> {
        let run = self
            .runs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("agent unavailable"))?;
        self.started.fetch_add(1, Ordering::SeqCst);

        let events = futures::stream::iter(run.events.into_iter().map(Ok));
        if run.stall {
            Ok(events.chain(futures::stream::pending()).boxed())
        } else {
            Ok(events.boxed())
        }
    }
}
