//! Client-side management of the broker as an OS process: detect a
//! running broker, start one detached, stop one with escalation.
//!
//! Detection is port probe + process-table scan. The scan is inherently
//! best-effort (a file-name match against the command line), so after a
//! spawn only the port probe is trusted.

use crate::errors::StructuredError;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const START_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_GRACE_POLLS: u32 = 10;
const STOP_FORCE_POLLS: u32 = 10;

/// Default broker executable name, expected on PATH when no explicit
/// program is configured.
pub const BROKER_PROGRAM: &str = "mcp-broker";

pub struct ServerSupervisor {
    host: String,
    port: u16,
    program: PathBuf,
    /// Configuration file handed to a broker this supervisor starts.
    config: Option<PathBuf>,
    /// Child spawned by this supervisor instance. Brokers started by
    /// other processes are only discoverable through the table scan.
    spawned: Option<Child>,
}

impl ServerSupervisor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            program: PathBuf::from(BROKER_PROGRAM),
            config: None,
            spawned: None,
        }
    }

    /// Override the broker executable (used by tests and embedders).
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Pass an explicit configuration file to a broker this supervisor
    /// starts.
    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Short-timeout TCP connect probe against the broker port.
    pub async fn is_port_open(&self) -> bool {
        matches!(
            timeout(
                PORT_PROBE_TIMEOUT,
                TcpStream::connect((self.host.as_str(), self.port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Locate a broker process: the handle this supervisor spawned if it
    /// is still alive, otherwise a process-table scan for the broker
    /// program name.
    pub async fn find_server_process(&mut self) -> Option<u32> {
        if let Some(child) = &mut self.spawned {
            match child.try_wait() {
                Ok(None) => return Some(child.id()),
                _ => self.spawned = None,
            }
        }

        let needle = program_needle(&self.program);
        tokio::task::spawn_blocking(move || scan_process_table(&needle))
            .await
            .ok()
            .flatten()
    }

    /// Both must hold: a process can exist without listening yet, and a
    /// stale forward can hold the port without the process.
    pub async fn is_server_running(&mut self) -> bool {
        self.find_server_process().await.is_some() && self.is_port_open().await
    }

    /// Start the broker as a detached subprocess and wait for the port
    /// to open. No-op success when the broker is already running.
    pub async fn start_server(&mut self) -> Result<String, StructuredError> {
        if self.is_server_running().await {
            return Ok("Server is already running".to_string());
        }

        info!(program = %self.program.display(), "Starting broker server");
        let args = self.spawn_args();
        let child = match spawn_detached(&self.program, &args) {
            Ok(child) => child,
            Err(source) => {
                return Err(StructuredError::connection(format!(
                    "Failed to start server: {source}"
                )));
            }
        };
        self.spawned = Some(child);

        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            sleep(POLL_INTERVAL).await;

            if let Some(child) = &mut self.spawned {
                if let Ok(Some(status)) = child.try_wait() {
                    if !status.success() {
                        self.spawned = None;
                        return Err(StructuredError::connection(format!(
                            "Server failed to start ({status}); check your {} file",
                            crate::config::CONFIG_PATH
                        )));
                    }
                }
            }

            if self.is_port_open().await {
                info!("Broker server is accepting connections");
                return Ok("Server process started successfully".to_string());
            }
        }

        if let Err(err) = self.stop_server().await {
            debug!(%err, "best-effort stop after failed start");
        }
        Err(StructuredError::connection(
            "Server failed to start: port did not open within timeout",
        ))
    }

    /// Stop the broker: graceful termination signal, then a forceful
    /// kill if it does not exit within the grace period. No-op success
    /// when the broker is not running.
    pub async fn stop_server(&mut self) -> Result<String, StructuredError> {
        if !self.is_server_running().await {
            return Ok("Server is not running".to_string());
        }

        let Some(pid) = self.find_server_process().await else {
            return Ok("Server is not running".to_string());
        };

        info!(pid, "Stopping broker server");
        signal_process(pid, Signal::Term);

        for _ in 0..STOP_GRACE_POLLS {
            if !self.is_server_running().await {
                self.spawned = None;
                info!("Broker server stopped");
                return Ok("Server stopped successfully".to_string());
            }
            sleep(POLL_INTERVAL).await;
        }

        warn!(pid, "broker did not stop gracefully, forcing shutdown");
        signal_process(pid, Signal::Kill);
        self.spawned = None;

        for _ in 0..STOP_FORCE_POLLS {
            if !self.is_port_open().await {
                return Ok("Server force stopped".to_string());
            }
            sleep(POLL_INTERVAL).await;
        }

        Err(StructuredError::connection(
            "Failed to stop server: port still in use after forceful kill",
        ))
    }

    fn spawn_args(&self) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.to_string_lossy().into_owned());
        }
        args
    }
}

fn program_needle(program: &Path) -> String {
    program
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string_lossy().into_owned())
}

/// Best-effort scan for a broker started by someone else. A process
/// matches when some command-line element's file name equals the broker
/// program name; a plain substring match would also catch build or test
/// harness processes that merely mention the name.
fn scan_process_table(needle: &str) -> Option<u32> {
    let mut system = System::new();
    // The plain `refresh_processes` refresh kind does not populate
    // command lines, which the match below reads.
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );

    let excluded = own_process_chain(&system);
    system.processes().iter().find_map(|(pid, process)| {
        if excluded.contains(&pid.as_u32()) {
            return None;
        }
        let matches = process.cmd().iter().any(|arg| {
            Path::new(arg)
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == needle)
        });
        matches.then(|| pid.as_u32())
    })
}

/// Own pid plus its ancestors. The broker is never in our parent chain,
/// but the harness that launched us can carry the broker name on its
/// command line.
fn own_process_chain(system: &System) -> Vec<u32> {
    let mut chain = Vec::new();
    let mut current = Some(Pid::from_u32(std::process::id()));
    while let Some(pid) = current {
        if chain.contains(&pid.as_u32()) {
            break;
        }
        chain.push(pid.as_u32());
        current = system.process(pid).and_then(|process| process.parent());
    }
    chain
}

fn signal_process(pid: u32, signal: Signal) {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    if let Some(process) = system.process(target) {
        // Platforms without the requested signal fall back to SIGKILL.
        if process.kill_with(signal).is_none() {
            process.kill();
        }
    }
}

#[cfg(unix)]
fn spawn_detached(program: &Path, args: &[String]) -> std::io::Result<Child> {
    use std::os::unix::process::CommandExt;

    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
}

#[cfg(windows)]
fn spawn_detached(program: &Path, args: &[String]) -> std::io::Result<Child> {
    use std::os::windows::process::CommandExt;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NEW_PROCESS_GROUP)
        .spawn()
}
