use super::catalog::ServiceCatalog;
use crate::env::EnvVar;
use crate::error::{FleetError, Result};
use crate::protocol::ServiceId;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

const SERVICE_LOG_FILES: usize = 3;

/// Point-in-time view of the supervised process.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SupervisorStatus {
    /// Service of the retained handle (kept after an unexpected exit)
    pub name: Option<String>,
    pub running: bool,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub returncode: Option<i32>,
}

/// Owns at most one child worker process.
///
/// Failures come back as `Err` and are also recorded in
/// [`SupervisorStatus::last_error`]; nothing here retries.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Launch `service`, stopping whatever else runs first. `Standby` is a
    /// pure stop.
    async fn start(&self, service: &ServiceId) -> Result<()>;

    /// Graceful terminate, force kill after the grace period.
    async fn stop(&self) -> Result<()>;

    async fn status(&self) -> SupervisorStatus;
}

/// Extra environment handed to every launched service. Shared with the
/// protocol handler, which learns the controller API address at runtime.
#[derive(Debug, Default)]
pub struct RuntimeEnv {
    vars: RwLock<BTreeMap<String, String>>,
}

impl RuntimeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, var: EnvVar, value: impl Into<String>) {
        self.vars
            .write()
            .await
            .insert(var.as_str().to_string(), value.into());
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.vars.read().await.clone()
    }
}

type SharedLog = Arc<std::sync::Mutex<RollingFileAppender>>;

/// Child process plus its log pumps. Dropping it kills the child (if still
/// alive) and aborts the pumps, so the handle and its log plumbing always go
/// away together.
struct ManagedProcess {
    service: String,
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

#[derive(Default)]
struct SupervisorInner {
    current: Option<ManagedProcess>,
    last_error: Option<String>,
    returncode: Option<i32>,
}

impl SupervisorInner {
    /// Poll the retained handle. An exited child stays retained (so the
    /// status still names it) but its return code is cached.
    fn poll(&mut self) -> bool {
        let Some(process) = self.current.as_mut() else {
            return false;
        };
        match process.child.try_wait() {
            Ok(None) => {
                self.returncode = None;
                true
            }
            Ok(Some(status)) => {
                let rc = exit_code(status);
                self.returncode = rc;
                if self.last_error.is_none() {
                    self.last_error = Some(match rc {
                        Some(rc) => format!("return code {rc}"),
                        None => "process exited".to_string(),
                    });
                }
                false
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn status(&mut self) -> SupervisorStatus {
        let running = self.poll();
        SupervisorStatus {
            name: self.current.as_ref().map(|p| p.service.clone()),
            running,
            pid: if running {
                self.current.as_ref().and_then(|p| p.child.id())
            } else {
                None
            },
            last_error: self.last_error.clone(),
            returncode: self.returncode,
        }
    }
}

/// [`Supervisor`] backed by real OS processes.
pub struct ProcessSupervisor {
    catalog: Arc<ServiceCatalog>,
    runtime_env: Arc<RuntimeEnv>,
    log_dir: PathBuf,
    terminate_timeout: Duration,
    inner: Mutex<SupervisorInner>,
    published: watch::Sender<SupervisorStatus>,
}

impl ProcessSupervisor {
    pub fn new(catalog: Arc<ServiceCatalog>, runtime_env: Arc<RuntimeEnv>, log_dir: PathBuf) -> Self {
        Self {
            catalog,
            runtime_env,
            log_dir,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            inner: Mutex::new(SupervisorInner::default()),
            published: watch::Sender::new(SupervisorStatus::default()),
        }
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    fn publish(&self, inner: &mut SupervisorInner) -> SupervisorStatus {
        let status = inner.status();
        self.published.send_replace(status.clone());
        status
    }

    async fn stop_locked(&self, inner: &mut SupervisorInner) -> Result<()> {
        let Some(mut process) = inner.current.take() else {
            inner.last_error = None;
            return Ok(());
        };
        let name = process.service.clone();

        if let Ok(Some(status)) = process.child.try_wait() {
            inner.returncode = exit_code(status);
            inner.last_error = None;
            debug!("Service '{}' had already exited", name);
            return Ok(());
        }

        info!("Stopping service '{}' gracefully", name);
        let outcome = terminate(&mut process.child, self.terminate_timeout, &name).await;
        drop(process);

        match outcome {
            Ok(rc) => {
                info!("Service '{}' stopped (rc={:?})", name, rc);
                inner.returncode = rc;
                inner.last_error = None;
                Ok(())
            }
            Err(e) => {
                error!("Error stopping '{}': {}", name, e);
                inner.returncode = None;
                inner.last_error = Some(e.to_string());
                Err(FleetError::ProcessStop {
                    service: name,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(&self, service: &ServiceId) -> Result<()> {
        let ServiceId::Named(name) = service else {
            return self.stop().await;
        };
        let entry = self
            .catalog
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::validation(format!("unknown service: {name}")))?;

        let mut inner = self.inner.lock().await;

        if inner.poll() && inner.current.as_ref().is_some_and(|p| &p.service == name) {
            info!(
                "Service '{}' already running (pid={:?})",
                name,
                inner.current.as_ref().and_then(|p| p.child.id())
            );
            self.publish(&mut inner);
            return Ok(());
        }

        if inner.current.is_some() {
            if let Err(e) = self.stop_locked(&mut inner).await {
                warn!("Continuing launch of '{}' after stop failure: {}", name, e);
            }
        }

        let log_dir = entry.log_dir.clone().unwrap_or_else(|| self.log_dir.clone());
        let log = match open_service_log(&log_dir, name) {
            Ok(appender) => Some(Arc::new(std::sync::Mutex::new(appender))),
            Err(e) => {
                warn!("No log file for '{}' in {}: {}", name, log_dir.display(), e);
                None
            }
        };

        let mut cmd = Command::new(&entry.command);
        cmd.args(&entry.args);
        for (key, value) in self.runtime_env.snapshot().await {
            cmd.env(key, value);
        }
        for (key, value) in &entry.env {
            cmd.env(key, value);
        }
        cmd.env(EnvVar::OmiServiceId.as_str(), name);
        if let Some(ref dir) = entry.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        info!(
            "Launching service '{}' -> {} {:?} (cwd={:?})",
            name, entry.command, entry.args, entry.working_dir
        );

        match cmd.spawn() {
            Ok(mut child) => {
                let pid = child.id();
                let pumps = spawn_log_pumps(name, &mut child, log);
                inner.current = Some(ManagedProcess {
                    service: name.clone(),
                    child,
                    pumps,
                });
                inner.last_error = None;
                inner.returncode = None;
                info!("Started service '{}' with PID {:?}", name, pid);
                self.publish(&mut inner);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start service '{}': {}", name, e);
                inner.current = None;
                inner.last_error = Some(e.to_string());
                inner.returncode = None;
                self.publish(&mut inner);
                Err(FleetError::ProcessSpawn {
                    service: name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let result = self.stop_locked(&mut inner).await;
        self.publish(&mut inner);
        result
    }

    /// Never waits behind an in-flight start/stop: while one runs, the last
    /// published status is returned instead.
    async fn status(&self) -> SupervisorStatus {
        match self.inner.try_lock() {
            Ok(mut inner) => self.publish(&mut inner),
            Err(_) => self.published.borrow().clone(),
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration, name: &str) -> std::io::Result<Option<i32>> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        child.start_kill()?;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(exit_code(status?)),
        Err(_) => {
            warn!("Service '{}' did not stop in time, force killing", name);
            child.kill().await?;
            Ok(child.try_wait()?.and_then(exit_code))
        }
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|sig| -sig)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

fn open_service_log(dir: &Path, service: &str) -> std::io::Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(service.to_lowercase())
        .filename_suffix("log")
        .max_log_files(SERVICE_LOG_FILES)
        .build(dir)
        .map_err(std::io::Error::other)
}

fn spawn_log_pumps(service: &str, child: &mut Child, log: Option<SharedLog>) -> Vec<JoinHandle<()>> {
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(spawn_pump(service, "stdout", stdout, log.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(spawn_pump(service, "stderr", stderr, log));
    }
    pumps
}

fn spawn_pump<R>(service: &str, label: &'static str, stream: R, log: Option<SharedLog>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let name = service.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(service = %name, stream = label, "{}", line);
            if let Some(ref log) = log {
                let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
                if let Ok(mut writer) = log.lock() {
                    let _ = writeln!(writer, "[{stamp}] {} {line}", label.to_uppercase());
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agent::catalog::ServiceCatalogEntry;

    fn shell(id: &str, script: &str) -> ServiceCatalogEntry {
        ServiceCatalogEntry::new(id, "sh").args(["-c", script])
    }

    fn supervisor(catalog: ServiceCatalog, log_dir: &Path) -> ProcessSupervisor {
        ProcessSupervisor::new(Arc::new(catalog), Arc::new(RuntimeEnv::new()), log_dir.to_path_buf())
            .with_terminate_timeout(Duration::from_millis(500))
    }

    async fn wait_until_stopped(sup: &ProcessSupervisor) -> SupervisorStatus {
        for _ in 0..50 {
            let status = sup.status().await;
            if !status.running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process never exited");
    }

    #[tokio::test]
    async fn start_then_stop_clears_handle() {
        let logs = tempfile::tempdir().unwrap();
        let sup = supervisor(
            ServiceCatalog::new().with(shell("MIDI", "exec sleep 30")),
            logs.path(),
        );

        sup.start(&ServiceId::parse("MIDI")).await.unwrap();
        let status = sup.status().await;
        assert!(status.running);
        assert!(status.pid.is_some());
        assert_eq!(status.name.as_deref(), Some("MIDI"));

        sup.stop().await.unwrap();
        let status = sup.status().await;
        assert!(!status.running);
        assert!(status.name.is_none());
        assert!(status.pid.is_none());
        assert_eq!(status.returncode, Some(-libc::SIGTERM));
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_retains_no_handle() {
        let logs = tempfile::tempdir().unwrap();
        let sup = supervisor(
            ServiceCatalog::new().with(ServiceCatalogEntry::new("OSC", "/nonexistent/omi-binary")),
            logs.path(),
        );

        let err = sup.start(&ServiceId::parse("OSC")).await.unwrap_err();
        assert!(matches!(err, FleetError::ProcessSpawn { .. }));

        let status = sup.status().await;
        assert!(!status.running);
        assert!(status.name.is_none());
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn unexpected_exit_caches_return_code() {
        let logs = tempfile::tempdir().unwrap();
        let sup = supervisor(ServiceCatalog::new().with(shell("MIDI", "exit 1")), logs.path());

        sup.start(&ServiceId::parse("MIDI")).await.unwrap();
        let status = wait_until_stopped(&sup).await;

        assert_eq!(status.name.as_deref(), Some("MIDI"));
        assert_eq!(status.returncode, Some(1));
        assert_eq!(status.last_error.as_deref(), Some("return code 1"));
    }

    #[tokio::test]
    async fn starting_another_service_replaces_the_first() {
        let logs = tempfile::tempdir().unwrap();
        let sup = supervisor(
            ServiceCatalog::new()
                .with(shell("MIDI", "exec sleep 30"))
                .with(shell("OSC", "exec sleep 30")),
            logs.path(),
        );

        sup.start(&ServiceId::parse("MIDI")).await.unwrap();
        let first_pid = sup.status().await.pid.unwrap();

        sup.start(&ServiceId::parse("OSC")).await.unwrap();
        let status = sup.status().await;
        assert_eq!(status.name.as_deref(), Some("OSC"));
        assert!(status.running);
        assert_ne!(status.pid, Some(first_pid));

        let alive = unsafe { libc::kill(first_pid as i32, 0) } == 0;
        assert!(!alive, "previous service should have been stopped");

        sup.start(&ServiceId::Standby).await.unwrap();
        assert!(!sup.status().await.running);
    }

    #[tokio::test]
    async fn restarting_same_running_service_is_a_noop() {
        let logs = tempfile::tempdir().unwrap();
        let sup = supervisor(ServiceCatalog::new().with(shell("MIDI", "exec sleep 30")), logs.path());

        sup.start(&ServiceId::parse("MIDI")).await.unwrap();
        let pid = sup.status().await.pid;
        sup.start(&ServiceId::parse("MIDI")).await.unwrap();
        assert_eq!(sup.status().await.pid, pid);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stubborn_process_is_force_killed() {
        let logs = tempfile::tempdir().unwrap();
        let sup = supervisor(
            ServiceCatalog::new().with(shell("MIDI", "trap '' TERM; while true; do sleep 1; done")),
            logs.path(),
        );

        sup.start(&ServiceId::parse("MIDI")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.stop().await.unwrap();

        let status = sup.status().await;
        assert!(!status.running);
        assert_eq!(status.returncode, Some(-libc::SIGKILL));
    }

    #[tokio::test]
    async fn child_output_lands_in_service_log() {
        let logs = tempfile::tempdir().unwrap();
        let sup = supervisor(ServiceCatalog::new().with(shell("MIDI", "echo hello-from-midi")), logs.path());

        sup.start(&ServiceId::parse("MIDI")).await.unwrap();
        wait_until_stopped(&sup).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut found = false;
        for entry in std::fs::read_dir(logs.path()).unwrap() {
            let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            if content.contains("STDOUT hello-from-midi") {
                found = true;
            }
        }
        assert!(found, "service output should be written to its log");
    }
}
