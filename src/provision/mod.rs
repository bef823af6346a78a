/// Bulk rescue-mode provisioning of dedicated servers
pub mod script;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::robot::error::{Result, RobotError};
use crate::robot::models::{RescueCredentials, ResetType};
use crate::robot::{RobotClient, ServerTarget};
use crate::ssh::{RemoteExecutor, SshTarget};
use crate::utils::polling::PollingConfig;
use crate::utils::probe::{wait_for_host, wait_for_host_down, HostProber};
use script::{InstallAction, ScriptRenderer};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_RESCUE_OS: &str = "linux";

/// Robot operations the orchestrator depends on
#[async_trait]
pub trait RobotApi: Send + Sync {
    async fn disable_rescue(&self, id: u64) -> Result<bool>;
    async fn reset_server(&self, id: u64, reset_type: ResetType) -> Result<()>;
    async fn server_ready(&self, id: u64) -> Result<bool>;
    async fn rename_server(&self, id: u64, name: &str) -> Result<bool>;
    async fn enable_rescue(&self, id: u64, os: &str, keys: &[String]) -> Result<RescueCredentials>;
}

#[async_trait]
impl RobotApi for RobotClient {
    async fn disable_rescue(&self, id: u64) -> Result<bool> {
        RobotClient::disable_rescue(self, id).await
    }

    async fn reset_server(&self, id: u64, reset_type: ResetType) -> Result<()> {
        RobotClient::reset_server(self, id, reset_type).await
    }

    async fn server_ready(&self, id: u64) -> Result<bool> {
        Ok(self.get_server(id).await?.is_ready())
    }

    async fn rename_server(&self, id: u64, name: &str) -> Result<bool> {
        RobotClient::rename_server(self, id, name).await
    }

    async fn enable_rescue(&self, id: u64, os: &str, keys: &[String]) -> Result<RescueCredentials> {
        RobotClient::enable_rescue(self, id, os, keys).await
    }
}

/// Deadlines and poll intervals of the waiting steps
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Pause after the initial reset before Robot's status is trusted
    pub reset_settle: Duration,
    pub server_ready: Duration,
    pub host_down: Duration,
    pub host_reachable: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            reset_settle: Duration::from_secs(30),
            server_ready: Duration::from_secs(10 * 60),
            host_down: Duration::from_secs(5 * 60),
            host_reachable: Duration::from_secs(5 * 60),
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl Timeouts {
    fn polling(&self, timeout: Duration, description: String) -> PollingConfig {
        PollingConfig::from_durations(timeout, self.initial_interval, description)
            .with_backoff(2.0, self.max_interval)
    }
}

#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub rescue_os: String,
    /// SSH key fingerprints installed into the rescue system
    pub ssh_keys: Vec<String>,
    pub action: InstallAction,
    /// Reset used to boot into rescue
    pub reset_type: ResetType,
    pub concurrency: usize,
    pub fail_fast: bool,
    pub disable_rescue_first: bool,
    pub timeouts: Timeouts,
}

impl BulkOptions {
    pub fn new(action: InstallAction) -> Self {
        Self {
            rescue_os: DEFAULT_RESCUE_OS.to_string(),
            ssh_keys: Vec::new(),
            action,
            reset_type: ResetType::Hw,
            concurrency: DEFAULT_CONCURRENCY,
            fail_fast: false,
            disable_rescue_first: true,
            timeouts: Timeouts::default(),
        }
    }
}

/// Stages of the per-server workflow, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    DisableRescue,
    InitialReset,
    WaitReady,
    Rename,
    EnableRescue,
    RescueReset,
    WaitReachable,
    Install,
    /// The worker task panicked or was cancelled by the runtime
    Aborted,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::DisableRescue => "disable rescue",
            Step::InitialReset => "initial reset",
            Step::WaitReady => "wait for ready",
            Step::Rename => "rename",
            Step::EnableRescue => "enable rescue",
            Step::RescueReset => "reset into rescue",
            Step::WaitReachable => "wait for SSH",
            Step::Install => "install",
            Step::Aborted => "task abort",
        };
        f.write_str(name)
    }
}

/// A provisioned server and the rescue credentials used for it
#[derive(Debug)]
pub struct InstallOutcome {
    pub server_id: u64,
    pub name: String,
    pub ip: String,
    pub password: SecretString,
}

/// Why one server was abandoned
#[derive(Debug)]
pub struct ServerFailure {
    pub server_id: u64,
    pub name: String,
    pub step: Step,
    pub error: RobotError,
}

impl ServerFailure {
    fn new(target: &ServerTarget, step: Step, error: RobotError) -> Self {
        Self {
            server_id: target.id,
            name: target.name.clone(),
            step,
            error,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, RobotError::Cancelled)
    }
}

impl fmt::Display for ServerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "server {} ({}) failed at {}: {}",
            self.server_id, self.name, self.step, self.error
        )
    }
}

/// Everything a bulk run produced, both lists sorted by server id
#[derive(Debug, Default)]
pub struct BulkReport {
    pub results: Vec<InstallOutcome>,
    pub failures: Vec<ServerFailure>,
}

impl BulkReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the rescue/reinstall workflow on many servers with bounded parallelism
pub struct Orchestrator<A, P, E> {
    api: Arc<A>,
    prober: Arc<P>,
    executor: Arc<E>,
    renderer: Arc<ScriptRenderer>,
}

impl<A, P, E> Orchestrator<A, P, E>
where
    A: RobotApi + 'static,
    P: HostProber + 'static,
    E: RemoteExecutor + 'static,
{
    pub fn new(api: Arc<A>, prober: Arc<P>, executor: Arc<E>) -> Result<Self> {
        Ok(Self {
            api,
            prober,
            executor,
            renderer: Arc::new(ScriptRenderer::new()?),
        })
    }

    /// Provision every target. Fails up front only if the install script is invalid.
    pub async fn run(&self, targets: Vec<ServerTarget>, options: BulkOptions) -> Result<BulkReport> {
        let script = Arc::new(self.renderer.render(&options.action)?);
        let options = Arc::new(options);
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel(targets.len().max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);

        info!(
            servers = targets.len(),
            concurrency = options.concurrency,
            action = options.action.describe(),
            "Starting bulk provisioning"
        );

        let mut pending: BTreeMap<u64, String> = BTreeMap::new();
        let mut tasks = JoinSet::new();
        for target in targets {
            pending.insert(target.id, target.name.clone());
            let worker = Worker {
                api: Arc::clone(&self.api),
                prober: Arc::clone(&self.prober),
                executor: Arc::clone(&self.executor),
                options: Arc::clone(&options),
                script: Arc::clone(&script),
                cancel: cancel_rx.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let cancel_tx = Arc::clone(&cancel_tx);
            let tx = tx.clone();

            tasks.spawn(async move {
                let permit = semaphore.acquire_owned().await;
                let outcome = match permit {
                    Ok(_) => worker.provision(&target).await,
                    Err(_) => Err(ServerFailure::new(&target, Step::DisableRescue, RobotError::Cancelled)),
                };
                if outcome.is_err() && worker.options.fail_fast {
                    cancel_tx.send_replace(true);
                }
                let _ = tx.send(outcome).await;
                drop(permit);
            });
        }
        drop(tx);

        let mut report = BulkReport::default();
        while let Some(outcome) = rx.recv().await {
            match outcome {
                Ok(result) => {
                    pending.remove(&result.server_id);
                    report.results.push(result);
                }
                Err(failure) => {
                    pending.remove(&failure.server_id);
                    if failure.is_cancelled() {
                        debug!(server_id = failure.server_id, "{failure}");
                    } else {
                        error!(server_id = failure.server_id, "{failure}");
                    }
                    report.failures.push(failure);
                }
            }
        }

        let mut aborts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Provisioning task did not finish");
                aborts.push(e.to_string());
            }
        }
        let reason = aborts.join("; ");
        for (server_id, name) in pending {
            let failure = ServerFailure {
                server_id,
                name,
                step: Step::Aborted,
                error: RobotError::TaskAborted(reason.clone()),
            };
            error!(server_id, "{failure}");
            report.failures.push(failure);
        }

        report.results.sort_by_key(|r| r.server_id);
        report.failures.sort_by_key(|f| f.server_id);
        if report.is_success() {
            info!(succeeded = report.results.len(), "Bulk provisioning finished");
        } else {
            warn!(
                succeeded = report.results.len(),
                failed = report.failures.len(),
                "Bulk provisioning finished with failures"
            );
        }
        Ok(report)
    }
}

/// Per-task handle; everything shared is behind an `Arc`
struct Worker<A, P, E> {
    api: Arc<A>,
    prober: Arc<P>,
    executor: Arc<E>,
    options: Arc<BulkOptions>,
    script: Arc<String>,
    cancel: watch::Receiver<bool>,
}

impl<A, P, E> Worker<A, P, E>
where
    A: RobotApi,
    P: HostProber,
    E: RemoteExecutor,
{
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn step<T, F>(&self, target: &ServerTarget, step: Step, fut: F) -> std::result::Result<T, ServerFailure>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(ServerFailure::new(target, step, RobotError::Cancelled));
        }
        debug!(server_id = target.id, step = %step, "Step started");
        fut.await.map_err(|e| ServerFailure::new(target, step, e))
    }

    async fn provision(&self, target: &ServerTarget) -> std::result::Result<InstallOutcome, ServerFailure> {
        let id = target.id;
        let options = &self.options;
        info!(server_id = id, name = %target.name, "Provisioning server");

        if options.disable_rescue_first {
            self.step(target, Step::DisableRescue, self.api.disable_rescue(id))
                .await?;
        }
        self.step(target, Step::InitialReset, self.api.reset_server(id, ResetType::Hw))
            .await?;
        self.step(target, Step::WaitReady, self.wait_ready(id)).await?;
        self.step(target, Step::Rename, self.api.rename_server(id, &target.name))
            .await?;

        let rescue = self
            .step(
                target,
                Step::EnableRescue,
                self.api.enable_rescue(id, &options.rescue_os, &options.ssh_keys),
            )
            .await?;
        let ip = rescue.server_ip.clone();

        self.step(target, Step::RescueReset, self.reset_into_rescue(id, &ip))
            .await?;

        let polling = options
            .timeouts
            .polling(options.timeouts.host_reachable, format!("Waiting for SSH on {ip}"));
        self.step(
            target,
            Step::WaitReachable,
            wait_for_host(self.prober.as_ref(), &ip, &polling),
        )
        .await?;

        let ssh = SshTarget::root(
            ip.clone(),
            SecretString::from(rescue.password.expose_secret().to_owned()),
        );
        self.step(target, Step::Install, self.executor.run(&ssh, &self.script))
            .await?;

        info!(server_id = id, ip = %ip, action = options.action.describe(), "Server provisioned");
        Ok(InstallOutcome {
            server_id: id,
            name: target.name.clone(),
            ip,
            password: rescue.password,
        })
    }

    /// Robot keeps reporting "ready" while a hardware reset is carried out,
    /// so the status is only polled after a fixed settle time. Polling then
    /// catches servers Robot has locked for other jobs.
    async fn wait_ready(&self, id: u64) -> Result<()> {
        let timeouts = &self.options.timeouts;
        if !timeouts.reset_settle.is_zero() {
            debug!(server_id = id, settle_secs = timeouts.reset_settle.as_secs(), "Letting reset settle");
            tokio::time::sleep(timeouts.reset_settle).await;
        }
        timeouts
            .polling(timeouts.server_ready, format!("Waiting for server {id} to be ready"))
            .poll_until(|| async move { self.api.server_ready(id).await })
            .await
    }

    /// Power-button resets only switch the machine off; press again once it is down
    async fn reset_into_rescue(&self, id: u64, ip: &str) -> Result<()> {
        let reset_type = self.options.reset_type;
        self.api.reset_server(id, reset_type).await?;
        if !reset_type.is_power_button() {
            return Ok(());
        }

        let timeouts = &self.options.timeouts;
        let polling = timeouts.polling(timeouts.host_down, format!("Waiting for {ip} to power off"));
        wait_for_host_down(self.prober.as_ref(), ip, &polling).await?;
        self.api.reset_server(id, ResetType::Power).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn probe_options() -> BulkOptions {
        fast_options(BulkOptions::new(InstallAction::Probe {
            dir: "/123".to_string(),
        }))
    }

    fn targets(ids: &[u64]) -> Vec<ServerTarget> {
        ids.iter()
            .map(|id| ServerTarget::new(*id, format!("node-{id}")))
            .collect()
    }

    fn orchestrator(
        robot: FakeRobot,
        prober: FakeProber,
    ) -> (Orchestrator<FakeRobot, FakeProber, FakeExecutor>, Arc<FakeRobot>, Arc<FakeExecutor>) {
        let robot = Arc::new(robot);
        let executor = Arc::new(FakeExecutor::default());
        let orchestrator =
            Orchestrator::new(Arc::clone(&robot), Arc::new(prober), Arc::clone(&executor)).unwrap();
        (orchestrator, robot, executor)
    }

    #[tokio::test]
    async fn test_all_servers_succeed_sorted() {
        let (orchestrator, robot, executor) = orchestrator(FakeRobot::default(), FakeProber::default());

        let report = orchestrator
            .run(targets(&[30, 10, 20]), probe_options())
            .await
            .unwrap();

        assert!(report.is_success());
        let ids: Vec<u64> = report.results.iter().map(|r| r.server_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(report.results[0].ip, "10.0.0.10");
        assert_eq!(report.results[0].password.expose_secret(), "pw-10");

        let runs = executor.runs.lock().unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|(_, cmd)| cmd == r#"mkdir -p "/123""#));
        assert_eq!(robot.renames.lock().unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rescue_failures_become_diagnostics() {
        let robot = FakeRobot {
            fail_rescue: [2, 5].into_iter().collect(),
            ..Default::default()
        };
        let (orchestrator, _, executor) = orchestrator(robot, FakeProber::default());

        let mut options = probe_options();
        options.concurrency = 3;
        let report = orchestrator
            .run(targets(&[1, 2, 3, 4, 5, 6]), options)
            .await
            .unwrap();

        assert_eq!(report.results.len(), 4);
        assert_eq!(report.failures.len(), 2);
        assert!(report
            .failures
            .iter()
            .all(|f| f.step == Step::EnableRescue && !f.is_cancelled()));
        assert_eq!(report.failures[0].server_id, 2);
        assert!(report.failures[1].to_string().contains("enable rescue"));
        assert_eq!(executor.runs.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_remaining_servers() {
        let robot = FakeRobot {
            fail_rename: true,
            ..Default::default()
        };
        let (orchestrator, _, executor) = orchestrator(robot, FakeProber::default());

        let mut options = probe_options();
        options.concurrency = 1;
        options.fail_fast = true;
        let report = orchestrator.run(targets(&[1, 2, 3]), options).await.unwrap();

        assert!(report.results.is_empty());
        assert_eq!(report.failures.len(), 3);
        let real: Vec<_> = report.failures.iter().filter(|f| !f.is_cancelled()).collect();
        assert_eq!(real.len(), 1);
        assert_eq!(real[0].step, Step::Rename);
        assert!(executor.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_power_reset_waits_for_shutdown_then_powers_on() {
        let prober = FakeProber {
            calls: AtomicU32::new(0),
            down_calls: 1,
        };
        let (orchestrator, robot, _) = orchestrator(FakeRobot::default(), prober);

        let mut options = probe_options();
        options.reset_type = ResetType::Power;
        let report = orchestrator.run(targets(&[7]), options).await.unwrap();

        assert!(report.is_success());
        let resets: Vec<ResetType> = robot.resets.lock().unwrap().iter().map(|(_, t)| *t).collect();
        assert_eq!(resets, vec![ResetType::Hw, ResetType::Power, ResetType::Power]);
    }

    #[tokio::test]
    async fn test_unreachable_host_times_out() {
        let prober = FakeProber {
            calls: AtomicU32::new(0),
            down_calls: u32::MAX,
        };
        let (orchestrator, _, _) = orchestrator(FakeRobot::default(), prober);

        let mut options = probe_options();
        options.timeouts.host_reachable = Duration::from_millis(20);
        let report = orchestrator.run(targets(&[1]), options).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, Step::WaitReachable);
        assert!(matches!(report.failures[0].error, RobotError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_invalid_action_fails_before_any_call() {
        let (orchestrator, robot, _) = orchestrator(FakeRobot::default(), FakeProber::default());

        let options = BulkOptions::new(InstallAction::Probe {
            dir: "no-slash".to_string(),
        });
        assert!(orchestrator.run(targets(&[1]), options).await.is_err());
        assert!(robot.resets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waits_for_ready_after_settle_time() {
        let robot = FakeRobot {
            busy_polls: 2,
            ..Default::default()
        };
        let (orchestrator, robot, _) = orchestrator(robot, FakeProber::default());

        let mut options = probe_options();
        options.timeouts.reset_settle = Duration::from_millis(20);
        let started = std::time::Instant::now();
        let report = orchestrator.run(targets(&[4]), options).await.unwrap();

        assert!(report.is_success());
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(robot.status_polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_crashed_task_is_reported_with_its_name() {
        let robot = Arc::new(FakeRobot::default());
        let executor = Arc::new(FakeExecutor {
            crash_on: Some("10.0.0.2".to_string()),
            ..Default::default()
        });
        let orchestrator =
            Orchestrator::new(robot, Arc::new(FakeProber::default()), executor).unwrap();

        let report = orchestrator.run(targets(&[1, 2]), probe_options()).await.unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(failure.server_id, 2);
        assert_eq!(failure.name, "node-2");
        assert_eq!(failure.step, Step::Aborted);
        assert!(matches!(failure.error, RobotError::TaskAborted(_)));
    }
}
