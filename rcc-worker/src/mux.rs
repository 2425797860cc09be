// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console multiplexer supervision
//!
//! The supervisor owns at most one `conmand` child and cycles it through
//! Idle → Configuring → Running → Terminating.  Configuration runs under
//! the worker-wide nodes lock so membership never changes mid-generation.
//! SIGTERM (from the assignment loop, heartbeat drops, or the credential
//! monitor) forces a full reconfigure-and-restart; SIGHUP (from log
//! rotation only) makes the running child reopen its log files.  The
//! supervisor itself never exits the process.

use slog::Logger;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::watch;

use crate::context::WorkerContext;
use crate::credentials::KeyDeploymentState;
use crate::credentials::PASSWORD_MAX_TRIES;
use crate::credentials::PASSWORD_RETRY_PAUSE;
use crate::credentials::passwords_with_retries;
use crate::mux_config::write_config;

/// Pause between supervision cycles, so a kill storm cannot turn into a
/// rapid restart loop.
const CYCLE_PAUSE: Duration = Duration::from_secs(10);
/// Pause after the child exits with an error before restarting it.
const FAILURE_PAUSE: Duration = Duration::from_secs(15);
/// Pause while there is nothing to serve.
const IDLE_PAUSE: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuxState {
    Idle,
    Configuring,
    Running,
    Terminating,
}

impl MuxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MuxState::Idle => "idle",
            MuxState::Configuring => "configuring",
            MuxState::Running => "running",
            MuxState::Terminating => "terminating",
        }
    }
}

/// Shared handle to the supervised child: its lifecycle state and pid for
/// signalling.
pub struct MuxHandle {
    state: Mutex<MuxState>,
    pid: Mutex<Option<u32>>,
    term_requests: AtomicU64,
    log: Logger,
}

impl MuxHandle {
    pub fn new(log: Logger) -> MuxHandle {
        MuxHandle {
            state: Mutex::new(MuxState::Idle),
            pid: Mutex::new(None),
            term_requests: AtomicU64::new(0),
            log,
        }
    }

    pub fn state(&self) -> MuxState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: MuxState) {
        *self.state.lock().unwrap() = state;
    }

    /// How many restarts have been requested over this handle's life.
    pub fn term_requests(&self) -> u64 {
        self.term_requests.load(Ordering::Relaxed)
    }

    /// Ask the running child to terminate, which triggers a full
    /// reconfiguration cycle.
    pub fn signal_term(&self) {
        self.term_requests.fetch_add(1, Ordering::Relaxed);
        self.signal(libc::SIGTERM, "SIGTERM");
    }

    /// Ask the running child to reopen its log files after rotation.
    pub fn signal_hup(&self) {
        self.signal(libc::SIGHUP, "SIGHUP");
    }

    fn signal(&self, signal: libc::c_int, name: &str) {
        let pid = *self.pid.lock().unwrap();
        match pid {
            Some(pid) => {
                info!(self.log, "signalling multiplexer";
                    "signal" => name, "pid" => pid);
                let rv = unsafe { libc::kill(pid as libc::pid_t, signal) };
                if rv != 0 {
                    warn!(self.log, "failed to signal multiplexer";
                        "signal" => name,
                        "pid" => pid,
                        "errno" => std::io::Error::last_os_error()
                            .raw_os_error());
                }
            }
            None => {
                warn!(self.log,
                    "attempted to signal multiplexer but none is running";
                    "signal" => name);
            }
        }
    }
}

pub struct MuxSupervisor {
    ctx: Arc<WorkerContext>,
    shutdown: watch::Receiver<bool>,
    keys_pending: KeyDeploymentState,
    log: Logger,
}

impl MuxSupervisor {
    pub fn new(
        ctx: Arc<WorkerContext>,
        shutdown: watch::Receiver<bool>,
        log: Logger,
    ) -> MuxSupervisor {
        MuxSupervisor {
            ctx,
            shutdown,
            keys_pending: KeyDeploymentState::default(),
            log,
        }
    }

    pub async fn run(mut self) {
        // the first configuration ignores the base file's freeze flag
        let mut force_update = true;
        loop {
            if *self.shutdown.borrow() {
                return;
            }

            self.ctx.mux.set_state(MuxState::Configuring);
            let has_nodes = match self.configure(force_update).await {
                Ok(has_nodes) => {
                    force_update = false;
                    self.ctx.set_ready(true);
                    has_nodes
                }
                Err(error) => {
                    // transient disk pressure must not kill the worker;
                    // mark unready and try again next cycle
                    error!(self.log, "configuration failed";
                        "error" => %error);
                    self.ctx.set_ready(false);
                    self.ctx.mux.set_state(MuxState::Idle);
                    self.pause(FAILURE_PAUSE).await;
                    continue;
                }
            };

            if !has_nodes {
                info!(self.log, "no console nodes assigned yet");
                self.ctx.mux.set_state(MuxState::Idle);
                self.pause(IDLE_PAUSE).await;
                continue;
            }

            self.execute().await;
            self.ctx.mux.set_state(MuxState::Idle);
            self.pause(CYCLE_PAUSE).await;
        }
    }

    /// Regenerate the multiplexer configuration under the nodes lock and
    /// make sure tailers and key material are in place.  Returns whether
    /// any nodes are configured.
    async fn configure(
        &mut self,
        force_update: bool,
    ) -> Result<bool, anyhow::Error> {
        let ctx = Arc::clone(&self.ctx);
        let sets = ctx.nodes.lock().await;

        // passwords for every river and paradise BMC, fetched en masse
        let bmcs: Vec<String> = sets
            .river
            .values()
            .chain(sets.password_ssh.values())
            .map(|n| n.bmc_name.clone())
            .collect();
        let passwords = if bmcs.is_empty() {
            Default::default()
        } else {
            passwords_with_retries(
                &self.log,
                ctx.secrets.as_ref(),
                &bmcs,
                PASSWORD_MAX_TRIES,
                PASSWORD_RETRY_PAUSE,
            )
            .await
        };

        write_config(
            &self.log,
            &ctx.config.base_conf_file,
            &ctx.config.conf_file,
            &sets,
            &passwords,
            force_update,
        )?;
        // remember what went into the config for change detection
        *ctx.last_passwords.lock().unwrap() = passwords;

        // every owned node gets a tailer; already-tailed nodes no-op
        for node in sets.all_nodes() {
            self.ctx.tailers.ensure_tailing(&node.node_name).await;
        }

        // key-ssh consoles cannot work until the keypair exists and the
        // BMCs have the public half
        if !sets.key_ssh.is_empty() {
            ctx.console_keys
                .ensure_present(&self.log, ctx.secrets.as_ref())
                .await?;
            self.keys_pending.note_nodes(sets.key_ssh.values());
            if !self.keys_pending.is_empty() {
                let public_key = tokio::fs::read_to_string(
                    ctx.console_keys.public_key_path(),
                )
                .await?;
                self.keys_pending
                    .flush(&self.log, ctx.key_sink.as_ref(), &public_key)
                    .await;
            }
        }

        Ok(sets.total() > 0)
    }

    /// Spawn the child and wait for it to exit, piping its output into
    /// the service log.
    async fn execute(&self) {
        info!(self.log, "starting a new multiplexer instance");
        let mut command = tokio::process::Command::new("conmand");
        command
            .args(["-F", "-v", "-c"])
            .arg(self.ctx.config.conf_file.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                error!(self.log, "unable to start multiplexer";
                    "error" => %error);
                tokio::time::sleep(FAILURE_PAUSE).await;
                return;
            }
        };
        *self.ctx.mux.pid.lock().unwrap() = child.id();
        self.ctx.mux.set_state(MuxState::Running);

        if let Some(stdout) = child.stdout.take() {
            let log = self.log.new(o!("stream" => "stdout"));
            tokio::spawn(log_child_output(stdout, log));
        }
        if let Some(stderr) = child.stderr.take() {
            let log = self.log.new(o!("stream" => "stderr"));
            tokio::spawn(log_child_output(stderr, log));
        }

        let status = child.wait().await;
        self.ctx.mux.set_state(MuxState::Terminating);
        *self.ctx.mux.pid.lock().unwrap() = None;
        match status {
            Ok(status) if status.success() => {
                info!(self.log, "multiplexer exited cleanly");
            }
            Ok(status) => {
                warn!(self.log, "multiplexer exited with failure";
                    "status" => %status);
                tokio::time::sleep(FAILURE_PAUSE).await;
            }
            Err(error) => {
                warn!(self.log, "error waiting for multiplexer";
                    "error" => %error);
                tokio::time::sleep(FAILURE_PAUSE).await;
            }
        }
    }

    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

async fn log_child_output<R>(reader: R, log: Logger)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(log, "{}", line),
            Ok(None) => break,
            Err(error) => {
                warn!(log, "error reading multiplexer output";
                    "error" => %error);
                break;
            }
        }
    }
}
