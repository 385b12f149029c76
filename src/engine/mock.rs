use super::{ContainerEngine, ContainerSpec, EngineError, ImageInfo, LogChunk};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Every call the mock received, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    PullImage(String),
    PushImage(String),
    InspectImage(String),
    CreateVolume(String),
    RemoveVolume(String),
    CreateContainer(String),
    StartContainer(String),
    WaitContainer(String),
    Logs(String),
    StopContainer(String),
    RemoveContainer(String),
}

/// Scripted behaviour for containers whose entrypoint ends in a given binary name
#[derive(Debug, Clone, Default)]
pub struct PhaseScript {
    pub exit_code: i64,
    pub output: Vec<LogChunk>,
    /// How long `wait_container` blocks before reporting the exit code
    pub delay: Option<Duration>,
    /// Make `create_container` fail for this phase
    pub fail_create: bool,
}

impl PhaseScript {
    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn with_line(mut self, line: impl Into<String>) -> Self {
        let mut text = line.into();
        text.push('\n');
        self.output.push(LogChunk::stdout(text));
        self
    }

    pub fn with_stderr_line(mut self, line: impl Into<String>) -> Self {
        let mut text = line.into();
        text.push('\n');
        self.output.push(LogChunk::stderr(text));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<EngineCall>,
    local_images: HashMap<String, ImageInfo>,
    remote_images: HashMap<String, ImageInfo>,
    pull_failures: HashMap<String, usize>,
    volumes: HashSet<String>,
    containers: HashMap<String, ContainerSpec>,
    scripts: HashMap<String, PhaseScript>,
    next_id: usize,
    fail_removals: bool,
}

/// In-memory engine that records calls and replays scripted phase output
pub struct MockEngine {
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Makes an image present locally
    pub fn add_local_image(&self, reference: impl Into<String>, info: ImageInfo) {
        self.lock().local_images.insert(reference.into(), info);
    }

    /// Makes an image pullable; it becomes local after a pull
    pub fn add_remote_image(&self, reference: impl Into<String>, info: ImageInfo) {
        self.lock().remote_images.insert(reference.into(), info);
    }

    /// The next `count` pulls of `reference` fail with a transient error
    pub fn fail_pulls(&self, reference: impl Into<String>, count: usize) {
        self.lock().pull_failures.insert(reference.into(), count);
    }

    /// Scripts containers whose entrypoint binary is `binary` (e.g. `detector`)
    pub fn script(&self, binary: impl Into<String>, script: PhaseScript) {
        self.lock().scripts.insert(binary.into(), script);
    }

    pub fn fail_removals(&self) {
        self.lock().fail_removals = true;
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn containers_created(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::CreateContainer(_)))
    }

    pub fn containers_removed(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::RemoveContainer(_)))
    }

    pub fn volumes_created(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::CreateVolume(_)))
    }

    pub fn volumes_removed(&self) -> usize {
        self.count(|c| matches!(c, EngineCall::RemoveVolume(_)))
    }

    pub fn pulls_of(&self, reference: &str) -> usize {
        self.count(|c| matches!(c, EngineCall::PullImage(r) if r == reference))
    }

    pub fn pushes_of(&self, reference: &str) -> usize {
        self.count(|c| matches!(c, EngineCall::PushImage(r) if r == reference))
    }

    /// Specs of created containers in creation order
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        let state = self.lock();
        state
            .calls
            .iter()
            .filter_map(|c| match c {
                EngineCall::CreateContainer(id) => state.containers.get(id).cloned(),
                _ => None,
            })
            .collect()
    }

    /// Entrypoint binary names of created containers, in creation order
    pub fn created_binaries(&self) -> Vec<String> {
        self.created_specs().iter().map(binary_of).collect()
    }

    pub fn live_volumes(&self) -> usize {
        self.lock().volumes.len()
    }

    fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn script_for(&self, id: &str) -> PhaseScript {
        let state = self.lock();
        state
            .containers
            .get(id)
            .and_then(|spec| state.scripts.get(&binary_of(spec)).cloned())
            .unwrap_or_default()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn binary_of(spec: &ContainerSpec) -> String {
    spec.entrypoint
        .first()
        .and_then(|path| path.rsplit('/').next())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::PullImage(reference.to_string()));

        if let Some(remaining) = state.pull_failures.get_mut(reference) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::api("pull", "connection reset by peer"));
            }
        }

        if let Some(info) = state.remote_images.get(reference).cloned() {
            state.local_images.insert(reference.to_string(), info);
            Ok(())
        } else if state.local_images.contains_key(reference) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("manifest unknown: {}", reference)))
        }
    }

    async fn push_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::PushImage(reference.to_string()));
        if state.local_images.contains_key(reference) {
            Ok(())
        } else {
            Err(EngineError::NotFound(reference.to_string()))
        }
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>, EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::InspectImage(reference.to_string()));
        Ok(state.local_images.get(reference).cloned())
    }

    async fn create_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::CreateVolume(name.to_string()));
        state.volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::RemoveVolume(name.to_string()));
        if state.fail_removals {
            return Err(EngineError::api("remove volume", "volume is in use"));
        }
        state.volumes.remove(name);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.lock();
        let fail = state
            .scripts
            .get(&binary_of(spec))
            .map(|s| s.fail_create)
            .unwrap_or(false);
        if fail {
            return Err(EngineError::api("create container", "no such image"));
        }

        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        state.calls.push(EngineCall::CreateContainer(id.clone()));
        state.containers.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.lock()
            .calls
            .push(EngineCall::StartContainer(id.to_string()));
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        self.lock()
            .calls
            .push(EngineCall::WaitContainer(id.to_string()));
        let script = self.script_for(id);
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(script.exit_code)
    }

    fn logs(&self, id: &str) -> BoxStream<'_, Result<LogChunk, EngineError>> {
        self.lock().calls.push(EngineCall::Logs(id.to_string()));
        let output = self.script_for(id).output;
        stream::iter(output.into_iter().map(Ok)).boxed()
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.lock()
            .calls
            .push(EngineCall::StopContainer(id.to_string()));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state
            .calls
            .push(EngineCall::RemoveContainer(id.to_string()));
        if state.fail_removals {
            return Err(EngineError::api("remove container", "device busy"));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockEngine")
            .field("calls", &state.calls.len())
            .field("volumes", &state.volumes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pull_makes_remote_image_local() {
        let engine = MockEngine::new();
        engine.add_remote_image("bp/node:1", ImageInfo::new("sha256:aa"));

        assert!(engine.inspect_image("bp/node:1").await.unwrap().is_none());
        engine.pull_image("bp/node:1").await.unwrap();
        assert!(engine.inspect_image("bp/node:1").await.unwrap().is_some());
        assert_eq!(engine.pulls_of("bp/node:1"), 1);
    }

    #[tokio::test]
    async fn test_pull_unknown_image_is_not_found() {
        let engine = MockEngine::new();
        let err = engine.pull_image("missing:1").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_scripted_pull_failures() {
        let engine = MockEngine::new();
        engine.add_remote_image("bp/go:2", ImageInfo::new("sha256:bb"));
        engine.fail_pulls("bp/go:2", 1);

        assert!(engine.pull_image("bp/go:2").await.unwrap_err().is_transient());
        assert!(engine.pull_image("bp/go:2").await.is_ok());
    }

    #[tokio::test]
    async fn test_script_replayed_by_entrypoint() {
        let engine = MockEngine::new();
        engine.script(
            "detector",
            PhaseScript::exit(20).with_line("fail: bp1@1.0"),
        );

        let mut spec = ContainerSpec::new("builder");
        spec.entrypoint = vec!["/cnb/lifecycle/detector".to_string()];
        let id = engine.create_container(&spec).await.unwrap();

        let chunks: Vec<_> = engine.logs(&id).collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(engine.wait_container(&id).await.unwrap(), 20);
        assert_eq!(engine.created_binaries(), vec!["detector".to_string()]);
    }
}
