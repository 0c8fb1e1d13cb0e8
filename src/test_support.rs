//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::{Instant, sleep};

use crate::connection::{
    Connection, ConnectionFactory, ContentTransferAgent, ContentTransferAgentFactory,
};
use crate::error::{ConnectionError, ProvisioningError, TransferError};
use crate::model::{CommandInput, CommandOutput, CopyInput, Host, PlatformOs, ProvisionOutput};
use crate::population::{HostChange, HostListener};
use crate::provision::{ProvisionService, ServiceFuture};
use crate::ssh::{CommandRunner, ProcessOutput, RunnerError};

/// Builds a deterministic host named after `index`.
#[must_use]
pub fn sample_host(index: usize) -> Host {
    Host {
        device_id: format!("host-{index}"),
        host_name: format!("host-{index}.example.com"),
        port: 22,
        proxy_jump: None,
        platform: PlatformOs::new("unix", "amd64"),
    }
}

/// Builds hosts for every index in `indices`.
#[must_use]
pub fn sample_hosts(indices: impl IntoIterator<Item = usize>) -> Vec<Host> {
    indices.into_iter().map(sample_host).collect()
}

/// Polls `service` until request `id` reaches a terminal status.
///
/// # Errors
///
/// Returns the service's error, or [`ProvisioningError::Timeout`] when the
/// request is still running after `limit`.
pub async fn wait_for_terminal(
    service: &dyn ProvisionService,
    id: &str,
    limit: Duration,
) -> Result<ProvisionOutput, ProvisioningError> {
    let deadline = Instant::now() + limit;
    loop {
        let output = service.describe(id).await?;
        if output.status().is_terminal() {
            return Ok(output);
        }
        if Instant::now() >= deadline {
            return Err(ProvisioningError::Timeout { id: id.to_owned() });
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Records host membership events delivered to a listener.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<(HostChange, Host)>>>,
}

impl EventLog {
    /// Returns a listener that appends to this log.
    #[must_use]
    pub fn listener(&self) -> HostListener {
        let events = Arc::clone(&self.events);
        Arc::new(move |change: HostChange, host: &Host| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((change, host.clone()));
        })
    }

    /// Returns every event in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<(HostChange, Host)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Counts events of one kind.
    #[must_use]
    pub fn count(&self, change: HostChange) -> usize {
        self.events()
            .iter()
            .filter(|(kind, _)| *kind == change)
            .count()
    }

    /// Replays the events onto an empty set, giving the membership a
    /// listener would believe in.
    #[must_use]
    pub fn replayed(&self) -> HashSet<Host> {
        let mut hosts = HashSet::new();
        for (change, host) in self.events() {
            match change {
                HostChange::Added => hosts.insert(host),
                HostChange::Removed => hosts.remove(&host),
            };
        }
        hosts
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Bytes offered on standard input.
    pub stdin: Option<Vec<u8>>,
    /// Timeout requested for the run.
    pub timeout: Duration,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Scripted command runner that returns pre-seeded outcomes in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<Result<ProcessOutput, RunnerError>>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, response: Result<ProcessOutput, RunnerError>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit process output.
    pub fn push_output(&self, code: Option<i32>, stdout: &str, stderr: &str) {
        self.push(Ok(ProcessOutput {
            code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }));
    }

    /// Pushes a runner failure.
    pub fn push_error(&self, error: RunnerError) {
        self.push(Err(error));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
        limit: Duration,
    ) -> ServiceFuture<'a, ProcessOutput, RunnerError> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
                stdin: stdin.map(<[u8]>::to_vec),
                timeout: limit,
            });
        let response = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Err(RunnerError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
            });
        Box::pin(async move { response })
    }
}

/// In-memory connection and transfer factory that counts what it opens and
/// closes and can be told to fail for chosen devices.
#[derive(Clone, Debug, Default)]
pub struct RecordingFactory {
    counters: Arc<Counters>,
    failing_connections: Arc<Mutex<BTreeSet<String>>>,
    failing_transfers: Arc<Mutex<BTreeSet<String>>>,
}

#[derive(Debug, Default)]
struct Counters {
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
    transfers_opened: AtomicUsize,
    transfers_closed: AtomicUsize,
    commands: AtomicUsize,
}

impl RecordingFactory {
    /// Creates a factory that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connect` fail for `device_id`.
    pub fn fail_connection_for(&self, device_id: &str) {
        self.failing_connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_owned());
    }

    /// Makes transfer agent creation fail for `device_id`.
    pub fn fail_transfer_for(&self, device_id: &str) {
        self.failing_transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_owned());
    }

    /// Connections opened so far.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.counters.connections_opened.load(Ordering::SeqCst)
    }

    /// Connections closed so far.
    #[must_use]
    pub fn connections_closed(&self) -> usize {
        self.counters.connections_closed.load(Ordering::SeqCst)
    }

    /// Transfer agents opened so far.
    #[must_use]
    pub fn transfers_opened(&self) -> usize {
        self.counters.transfers_opened.load(Ordering::SeqCst)
    }

    /// Transfer agents closed so far.
    #[must_use]
    pub fn transfers_closed(&self) -> usize {
        self.counters.transfers_closed.load(Ordering::SeqCst)
    }

    /// Commands executed across all connections.
    #[must_use]
    pub fn commands(&self) -> usize {
        self.counters.commands.load(Ordering::SeqCst)
    }

    fn fails(set: &Mutex<BTreeSet<String>>, device_id: &str) -> bool {
        set.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device_id)
    }
}

struct RecordingConnection {
    counters: Arc<Counters>,
}

impl Connection for RecordingConnection {
    fn execute<'a>(
        &'a self,
        input: &'a CommandInput,
    ) -> ServiceFuture<'a, CommandOutput, ConnectionError> {
        self.counters.commands.fetch_add(1, Ordering::SeqCst);
        let output = CommandOutput {
            exit_code: 0,
            stdout: input.line.as_bytes().to_vec(),
            stderr: Vec::new(),
            original_input: input.clone(),
        };
        Box::pin(async move { Ok(output) })
    }

    fn close(&self) -> ServiceFuture<'_, (), ConnectionError> {
        self.counters
            .connections_closed
            .fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

struct RecordingTransfer {
    counters: Arc<Counters>,
}

impl ContentTransferAgent for RecordingTransfer {
    fn send<'a>(&'a self, _input: &'a CopyInput) -> ServiceFuture<'a, (), TransferError> {
        Box::pin(async { Ok(()) })
    }

    fn receive<'a>(&'a self, _input: &'a CopyInput) -> ServiceFuture<'a, (), TransferError> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> ServiceFuture<'_, (), TransferError> {
        self.counters.transfers_closed.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

impl ConnectionFactory for RecordingFactory {
    fn connect<'a>(
        &'a self,
        host: &'a Host,
    ) -> ServiceFuture<'a, Arc<dyn Connection>, ConnectionError> {
        let result: Result<Arc<dyn Connection>, ConnectionError> =
            if Self::fails(&self.failing_connections, &host.device_id) {
                Err(ConnectionError::Unreachable {
                    host: host.host_name.clone(),
                    message: "scripted failure".to_owned(),
                })
            } else {
                self.counters
                    .connections_opened
                    .fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(RecordingConnection {
                    counters: Arc::clone(&self.counters),
                }))
            };
        Box::pin(async move { result })
    }
}

impl ContentTransferAgentFactory for RecordingFactory {
    fn connect<'a>(
        &'a self,
        _provision_id: &'a str,
        _connection: Arc<dyn Connection>,
        host: &'a Host,
    ) -> ServiceFuture<'a, Arc<dyn ContentTransferAgent>, TransferError> {
        let result: Result<Arc<dyn ContentTransferAgent>, TransferError> =
            if Self::fails(&self.failing_transfers, &host.device_id) {
                Err(TransferError::Unsupported(format!(
                    "scripted failure for {}",
                    host.device_id
                )))
            } else {
                self.counters.transfers_opened.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(RecordingTransfer {
                    counters: Arc::clone(&self.counters),
                }))
            };
        Box::pin(async move { result })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
        }
        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes environment variables while holding a global mutex.
    pub async fn remove_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::remove_var(key) };
        }
        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
