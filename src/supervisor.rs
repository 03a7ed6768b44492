use crate::config::{GatewayConfig, ReadinessConfig};
use crate::error::SupervisorError;
use crate::readiness::{PollSettings, ReadinessProber};
use crate::token::AccessToken;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

type AttemptFuture = Shared<BoxFuture<'static, Result<(), SupervisorError>>>;

/// An in-flight start, shared by every caller that arrives while it runs
struct StartAttempt {
    id: u64,
    outcome: AttemptFuture,
}

/// Request to the monitor task to stop the process it owns
struct StopRequest {
    grace: Duration,
    done: oneshot::Sender<()>,
}

/// Handle to the running gateway. The `Child` itself is owned by the monitor
/// task; this side only holds the means to stop it.
struct GatewayProcess {
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    stop_tx: oneshot::Sender<StopRequest>,
}

#[derive(Default)]
struct SupervisorState {
    process: Option<GatewayProcess>,
    attempt: Option<StartAttempt>,
}

/// Snapshot of the supervisor for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub configured: bool,
    pub running: bool,
    pub starting: bool,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub spawns: u64,
    pub restarts: u64,
}

/// Owns the gateway process lifecycle.
///
/// Shared behind an `Arc`; [`new`](Supervisor::new) returns `Arc<Self>`
/// directly because starting the gateway spawns tasks that hold a reference.
///
/// At most one process handle and at most one start attempt exist at any
/// time. Callers that arrive while a start is in flight wait for it and
/// observe its outcome instead of racing a second spawn.
pub struct Supervisor {
    gateway: GatewayConfig,
    readiness: ReadinessConfig,
    token: AccessToken,
    prober: ReadinessProber,
    state: Mutex<SupervisorState>,
    generation: AtomicU64,
    attempts: AtomicU64,
    spawns: AtomicU64,
    restarts: AtomicU64,
}

impl Supervisor {
    pub fn new(gateway: GatewayConfig, readiness: ReadinessConfig, token: AccessToken) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            readiness,
            token,
            prober: ReadinessProber::new(),
            state: Mutex::new(SupervisorState::default()),
            generation: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            spawns: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        })
    }

    pub fn gateway(&self) -> &GatewayConfig {
        &self.gateway
    }

    /// Whether the gateway has been configured (its config file exists)
    pub fn is_configured(&self) -> bool {
        self.gateway.config_file().exists()
    }

    #[cfg(test)]
    fn has_process(&self) -> bool {
        self.state.lock().process.is_some()
    }

    pub fn status(&self) -> SupervisorStatus {
        let state = self.state.lock();
        let process = state.process.as_ref();
        SupervisorStatus {
            configured: self.is_configured(),
            running: process.is_some() && state.attempt.is_none(),
            starting: state.attempt.is_some(),
            pid: process.and_then(|p| p.pid),
            uptime_secs: process.map(|p| p.started_at.elapsed().as_secs()),
            spawns: self.spawns.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
        }
    }

    /// Arguments appended to the configured command line
    pub fn launch_args(&self) -> Vec<String> {
        vec![
            "--bind".to_string(),
            "loopback".to_string(),
            "--port".to_string(),
            self.gateway.port.to_string(),
            "--auth".to_string(),
            "token".to_string(),
            "--token".to_string(),
            self.token.as_str().to_string(),
        ]
    }

    /// Make sure the gateway is running and ready.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<(), SupervisorError> {
        if !self.is_configured() {
            return Err(SupervisorError::NotConfigured);
        }

        // Check and register under one lock with no await in between
        let outcome = {
            let mut state = self.state.lock();
            if let Some(attempt) = &state.attempt {
                debug!(attempt = attempt.id, "Joining in-flight gateway start");
                attempt.outcome.clone()
            } else if state.process.is_some() {
                return Ok(());
            } else {
                self.begin_attempt(&mut state, false)
            }
        };

        outcome.await
    }

    /// Stop the gateway (if running) and start it again.
    ///
    /// The stop and the respawn run as one start attempt, so callers of
    /// [`ensure_running`](Supervisor::ensure_running) that arrive during the
    /// grace period wait for the new process instead of spawning their own.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        loop {
            let (outcome, owned) = {
                let mut state = self.state.lock();
                match &state.attempt {
                    Some(attempt) => (attempt.outcome.clone(), false),
                    None => (self.begin_attempt(&mut state, true), true),
                }
            };

            if owned {
                return outcome.await;
            }
            // Let an in-flight start settle before tearing it down
            let _ = outcome.await;
        }
    }

    /// Register a new attempt. Must be called with the state lock held and
    /// no attempt registered.
    fn begin_attempt(self: &Arc<Self>, state: &mut SupervisorState, restart: bool) -> AttemptFuture {
        let id = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let supervisor = Arc::clone(self);

        // Runs as its own task so an abandoned caller cannot stall it
        let task = tokio::spawn(async move {
            let result = if restart {
                supervisor.restart_gateway().await
            } else {
                supervisor.start_gateway().await
            };
            supervisor.finish_attempt(id);
            result
        });

        let outcome = async move {
            task.await.unwrap_or_else(|e| {
                Err(SupervisorError::StartFailed(format!("start task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        state.attempt = Some(StartAttempt {
            id,
            outcome: outcome.clone(),
        });
        outcome
    }

    /// Stop the current process, then start a fresh one
    async fn restart_gateway(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let process = self.state.lock().process.take();
        if let Some(process) = process {
            info!(pid = process.pid, "Restarting gateway");
            self.stop_process(process, self.gateway.shutdown_grace_period())
                .await;
        }

        self.restarts.fetch_add(1, Ordering::SeqCst);
        if !self.is_configured() {
            return Err(SupervisorError::NotConfigured);
        }
        self.start_gateway().await
    }

    /// Stop the gateway for good (wrapper shutdown)
    pub async fn shutdown(&self) {
        let process = self.state.lock().process.take();
        if let Some(process) = process {
            info!(pid = process.pid, "Stopping gateway");
            self.stop_process(process, self.gateway.shutdown_grace_period())
                .await;
        }
    }

    fn finish_attempt(&self, id: u64) {
        let mut state = self.state.lock();
        if state.attempt.as_ref().map(|a| a.id) == Some(id) {
            state.attempt = None;
        }
    }

    /// Spawn the process, then hold the attempt open until it is ready
    async fn start_gateway(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let child = self.spawn_child().map_err(|e| {
            error!(command = %self.gateway.command, error = %e, "Failed to spawn gateway");
            SupervisorError::StartFailed(format!("spawn failed: {}", e))
        })?;
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, mut exited_rx) = watch::channel(false);

        self.state.lock().process = Some(GatewayProcess {
            generation,
            pid,
            started_at: Instant::now(),
            stop_tx,
        });
        tokio::spawn(Arc::clone(self).monitor(generation, child, stop_rx, exited_tx));

        info!(pid, port = self.gateway.port, generation, "Gateway process spawned, waiting for readiness");

        let settings = PollSettings {
            timeout_total: self.readiness.timeout(),
            interval: self.readiness.poll_interval(),
            per_request_timeout: self.readiness.request_timeout(),
        };
        let target = self.gateway.target();

        let failure = tokio::select! {
            ready = self.prober.poll(&target, &self.readiness.path, settings) => {
                if ready {
                    None
                } else {
                    Some(format!(
                        "not ready after {}ms",
                        settings.timeout_total.as_millis()
                    ))
                }
            }
            _ = exited_rx.wait_for(|exited| *exited) => {
                Some("process exited during startup".to_string())
            }
        };

        match failure {
            None => {
                info!(pid, generation, "Gateway is ready");
                Ok(())
            }
            Some(reason) => {
                error!(pid, generation, reason = %reason, "Gateway failed to start");
                let process = {
                    let mut state = self.state.lock();
                    match &state.process {
                        Some(p) if p.generation == generation => state.process.take(),
                        _ => None,
                    }
                };
                if let Some(process) = process {
                    self.stop_process(process, Duration::ZERO).await;
                }
                Err(SupervisorError::StartFailed(reason))
            }
        }
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.gateway.command);
        cmd.args(&self.gateway.args);
        cmd.args(self.launch_args());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.gateway.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.gateway.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }
        Ok(child)
    }

    /// Owns the child until it exits or is asked to stop
    async fn monitor(
        self: Arc<Self>,
        generation: u64,
        mut child: Child,
        mut stop_rx: oneshot::Receiver<StopRequest>,
        exited_tx: watch::Sender<bool>,
    ) {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => warn!(generation, ?status, "Gateway process exited"),
                    Err(e) => error!(generation, error = %e, "Error waiting for gateway process"),
                }
                let _ = exited_tx.send(true);
                self.clear_process(generation);
            }
            request = &mut stop_rx => {
                // A dropped handle without an explicit stop means kill now
                let grace = request.as_ref().map(|r| r.grace).unwrap_or(Duration::ZERO);
                terminate(&mut child, grace).await;
                let _ = exited_tx.send(true);
                if let Ok(request) = request {
                    let _ = request.done.send(());
                }
            }
        }
    }

    /// Forget the handle of an exited process so the next call starts fresh
    fn clear_process(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.process.as_ref().map(|p| p.generation) == Some(generation) {
            state.process = None;
            debug!(generation, "Cleared gateway handle after exit");
        }
    }

    async fn stop_process(&self, process: GatewayProcess, grace: Duration) {
        let (done_tx, done_rx) = oneshot::channel();
        let request = StopRequest {
            grace,
            done: done_tx,
        };
        if process.stop_tx.send(request).is_err() {
            // Monitor already observed the exit
            return;
        }
        let _ = done_rx.await;
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration) {
    if !grace.is_zero() {
        if let Some(pid) = child.id() {
            debug!(pid, "Sending SIGTERM to gateway");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "Gateway process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for gateway to exit");
        }
        Err(_) => {
            if !grace.is_zero() {
                warn!(grace_ms = grace.as_millis() as u64, "Grace period exceeded, sending SIGKILL");
            }
            let _ = child.kill().await;
        }
    }
}

async fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "gatehouse::gateway", stream, "{}", line);
    }
}
