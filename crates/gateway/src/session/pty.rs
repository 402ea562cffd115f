//! PTY process handle.
//!
//! A [`PtyProcess`] owns one child process attached to a pseudo-terminal.
//! Output is drained by a dedicated blocking reader thread into a bounded
//! channel, so [`PtyProcess::read`] simply awaits the next chunk and an idle
//! session costs no CPU. The thread ends on its own once the child exits and
//! the slave side of the terminal closes.
//!
//! The child leads its own terminal session. Signals go to every process
//! group in that session, so job-control background jobs are stopped with
//! the shell.

use std::io::{self, Read, Write};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::error::SessionError;
use super::spawn::{ContainerTarget, SpawnSpec};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the channel between the reader thread and the relay.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// How often [`PtyProcess::wait_exit`] re-checks the child.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on `<runtime> rm -f`.
const CONTAINER_REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    /// Height in rows.
    pub rows: u16,
    /// Width in columns.
    pub cols: u16,
}

impl Dimensions {
    /// Creates a new size.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(protocol::DEFAULT_ROWS, protocol::DEFAULT_COLS)
    }
}

impl From<Dimensions> for PtySize {
    fn from(d: Dimensions) -> Self {
        PtySize {
            rows: d.rows,
            cols: d.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

type OutputChunk = io::Result<Vec<u8>>;

/// A spawned process with an attached pseudo-terminal.
pub struct PtyProcess {
    /// The PTY master handle, used for resizing.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The writer for the PTY, shared with blocking write tasks.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,

    /// The child process.
    child: Mutex<Box<dyn Child + Send + Sync>>,

    /// Chunks produced by the reader thread.
    output: tokio::sync::Mutex<mpsc::Receiver<OutputChunk>>,

    /// Current terminal size.
    size: Mutex<Dimensions>,

    /// Exit code once the child has been reaped.
    exit_code: Mutex<Option<u32>>,

    /// Process ID.
    pid: Option<u32>,

    /// Container the child is a runtime client of.
    container: Option<ContainerTarget>,
}

/// Locks a std mutex, recovering the data if a holder panicked.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        tracing::warn!("PTY lock was poisoned, recovering");
        e.into_inner()
    })
}

/// On Linux the master returns EIO once every slave descriptor is closed.
fn is_eof_error(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::EIO as i32)
}

/// Sends a signal, treating an already-gone target as success.
fn send_signal(result: nix::Result<()>) -> Result<(), SessionError> {
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SessionError::KillFailed(e.to_string())),
    }
}

/// Process groups in the terminal session led by `leader`.
///
/// Falls back to the leader's own group where `/proc` is unavailable.
fn session_process_groups(leader: Pid) -> Vec<Pid> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return vec![leader];
    };

    let mut groups = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let pid = Pid::from_raw(pid);
        if unistd::getsid(Some(pid)) != Ok(leader) {
            continue;
        }
        if let Ok(group) = unistd::getpgid(Some(pid)) {
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
    }
    groups
}

/// Signals every group in the session, continuing past failures.
fn signal_session(leader: Pid, sig: Signal) -> Result<(), SessionError> {
    let mut result = Ok(());
    for group in session_process_groups(leader) {
        if let Err(e) = send_signal(signal::killpg(group, sig)) {
            tracing::warn!(pgid = %group, signal = ?sig, error = %e, "Failed to signal process group");
            result = Err(e);
        }
    }
    result
}

impl PtyProcess {
    /// Spawns the described process inside a new pseudo-terminal.
    ///
    /// Fails if the terminal cannot be allocated or the executable cannot be
    /// started.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(spec.dimensions.into())
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        cmd.env_clear();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = spec.cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {e}", spec.command)))?;
        let pid = child.process_id();

        // The child holds its own copy; ours would keep the master from ever
        // seeing EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || read_loop(reader, output_tx))
            .map_err(|e| SessionError::SpawnFailed(format!("reader thread: {e}")))?;

        tracing::debug!(
            command = %spec.command,
            pid = ?pid,
            rows = spec.dimensions.rows,
            cols = spec.dimensions.cols,
            "Spawned PTY process"
        );

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Arc::new(Mutex::new(writer)),
            child: Mutex::new(child),
            output: tokio::sync::Mutex::new(output_rx),
            size: Mutex::new(spec.dimensions),
            exit_code: Mutex::new(None),
            pid,
            container: spec.container.clone(),
        })
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the container the child runs, if it is a runtime client.
    pub fn container(&self) -> Option<&ContainerTarget> {
        self.container.as_ref()
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> Dimensions {
        *lock(&self.size)
    }

    /// Returns the exit code once the child has been reaped.
    pub fn exit_code(&self) -> Option<u32> {
        *lock(&self.exit_code)
    }

    /// Waits for the next chunk of output.
    ///
    /// Returns `Ok(None)` at end of file, i.e. once the child has exited and
    /// all buffered output has been delivered.
    pub async fn read(&self) -> Result<Option<Vec<u8>>, SessionError> {
        let mut output = self.output.lock().await;
        match output.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => Err(SessionError::ReadFailed(e.to_string())),
            None => Ok(None),
        }
    }

    /// Writes data to the PTY (stdin).
    ///
    /// The blocking write runs on the blocking thread pool so a full PTY
    /// buffer never stalls the async runtime.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::ProcessExited);
        }

        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = lock(&writer);
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| SessionError::WriteFailed(e.to_string()))?
        .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&self, dimensions: Dimensions) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::ProcessExited);
        }

        lock(&self.master)
            .resize(dimensions.into())
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *lock(&self.size) = dimensions;

        tracing::debug!(
            pid = ?self.pid,
            rows = dimensions.rows,
            cols = dimensions.cols,
            "Resized PTY"
        );
        Ok(())
    }

    /// Checks whether the child is still running, reaping it if it exited.
    pub fn is_alive(&self) -> bool {
        let mut child = lock(&self.child);
        match child.try_wait() {
            Ok(Some(status)) => {
                *lock(&self.exit_code) = Some(status.exit_code());
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Asks the process to exit.
    ///
    /// Sends SIGHUP to every process group in the terminal session, as a
    /// terminal hangup would, and SIGTERM to the child itself. Interactive
    /// shells ignore SIGTERM but exit on hangup.
    pub fn terminate(&self) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Ok(());
        }

        match self.pid {
            Some(pid) => {
                let pid = Pid::from_raw(pid as i32);
                signal_session(pid, Signal::SIGHUP)?;
                send_signal(signal::kill(pid, Signal::SIGTERM))
            }
            None => self.force_kill(),
        }
    }

    /// Kills every process left in the terminal session.
    ///
    /// Also reaches jobs that outlived the child itself.
    pub fn force_kill(&self) -> Result<(), SessionError> {
        let swept = match self.pid {
            Some(pid) => signal_session(Pid::from_raw(pid as i32), Signal::SIGKILL),
            None => Ok(()),
        };

        if !self.is_alive() {
            return swept;
        }

        let result = lock(&self.child).kill();
        match result {
            Ok(()) => swept,
            // Lost a race with the SIGKILL above.
            Err(_) if !self.is_alive() => swept,
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        }
    }

    /// Force-removes the container the child is a client of.
    ///
    /// Signals to the runtime client are not forwarded to the container.
    /// A container that is already gone counts as removed. Does nothing for
    /// local processes.
    pub async fn remove_container(&self) -> Result<(), SessionError> {
        let Some(target) = &self.container else {
            return Ok(());
        };

        let output = tokio::time::timeout(
            CONTAINER_REMOVE_TIMEOUT,
            Command::new(&target.runtime)
                .args(["rm", "-f", target.name.as_str()])
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SessionError::KillFailed(format!("{} rm timed out", target.runtime)))?
        .map_err(|e| SessionError::KillFailed(format!("{}: {e}", target.runtime)))?;

        if output.status.success() {
            tracing::debug!(container = %target.name, "Removed session container");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let lower = stderr.to_lowercase();
        if lower.contains("no such container") || lower.contains("no container with name") {
            return Ok(());
        }

        Err(SessionError::KillFailed(format!(
            "{} rm -f {}: {}",
            target.runtime,
            target.name,
            stderr.trim()
        )))
    }

    /// Waits up to `timeout` for the process to exit.
    ///
    /// Returns `true` if it is gone.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("size", &self.size())
            .finish()
    }
}

/// Body of the reader thread: blocks on the master until data or EOF.
fn read_loop(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<OutputChunk>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if output_tx.blocking_send(Ok(buffer[..n].to_vec())).is_err() {
                    // Handle dropped.
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_eof_error(&e) => break,
            Err(e) => {
                let _ = output_tx.blocking_send(Err(e));
                break;
            }
        }
    }
    tracing::trace!("PTY reader thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh() -> SpawnSpec {
        SpawnSpec::local_shell("/bin/sh", Dimensions::default())
    }

    /// Reads until `needle` shows up in the accumulated output.
    async fn read_until(process: &PtyProcess, needle: &str) -> bool {
        read_output_until(process, needle).await.contains(needle)
    }

    async fn read_output_until(process: &PtyProcess, needle: &str) -> String {
        let mut seen = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), process.read()).await {
                Ok(Ok(Some(data))) => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                    if seen.contains(needle) {
                        break;
                    }
                }
                Ok(Ok(None)) | Ok(Err(_)) => break,
                Err(_) => {}
            }
        }
        seen
    }

    /// Running means present in `/proc` and not a zombie.
    fn process_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    fn number_after(output: &str, marker: &str) -> Option<i32> {
        let start = output.find(marker)? + marker.len();
        output[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok()
    }

    async fn wait_gone(pid: i32) -> bool {
        for _ in 0..60 {
            if !process_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        !process_running(pid)
    }

    /// Writes an executable stand-in for a container runtime.
    fn stub_runtime(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("runtime");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn with_container(runtime: &std::path::Path) -> SpawnSpec {
        let mut spec = sh();
        spec.container = Some(ContainerTarget {
            runtime: runtime.to_string_lossy().into_owned(),
            name: "termgate-test".to_string(),
        });
        spec
    }

    #[test]
    fn test_default_dimensions() {
        assert_eq!(Dimensions::default(), Dimensions::new(24, 80));
    }

    #[tokio::test]
    async fn test_spawn() {
        let process = PtyProcess::spawn(&sh()).unwrap();

        assert!(process.is_alive());
        assert!(process.pid().is_some());
        assert_eq!(process.size(), Dimensions::new(24, 80));

        let _ = process.force_kill();
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let spec = SpawnSpec::local_shell("/nonexistent/shell", Dimensions::default());
        let result = PtyProcess::spawn(&spec);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let process = PtyProcess::spawn(&sh()).unwrap();

        process.write(b"echo pty_marker_$((40+2))\n").await.unwrap();
        assert!(read_until(&process, "pty_marker_42").await);

        let _ = process.force_kill();
    }

    #[tokio::test]
    async fn test_environment_is_applied() {
        let mut spec = sh();
        spec.set_env("TERMGATE_TEST_VAR", "env_value_ok");
        let process = PtyProcess::spawn(&spec).unwrap();

        process.write(b"echo $TERMGATE_TEST_VAR\n").await.unwrap();
        assert!(read_until(&process, "env_value_ok").await);

        let _ = process.force_kill();
    }

    #[tokio::test]
    async fn test_resize() {
        let process = PtyProcess::spawn(&sh()).unwrap();

        process.resize(Dimensions::new(40, 120)).unwrap();
        assert_eq!(process.size(), Dimensions::new(40, 120));

        process.write(b"stty size\n").await.unwrap();
        assert!(read_until(&process, "40 120").await);

        let _ = process.force_kill();
    }

    #[tokio::test]
    async fn test_eof_after_exit() {
        let process = PtyProcess::spawn(&sh()).unwrap();
        process.write(b"exit 3\n").await.unwrap();

        let mut got_eof = false;
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), process.read()).await {
                Ok(Ok(None)) => {
                    got_eof = true;
                    break;
                }
                Ok(Ok(Some(_))) | Err(_) => {}
                Ok(Err(e)) => panic!("unexpected read error: {e}"),
            }
        }

        assert!(got_eof, "expected EOF after exit");
        assert!(process.wait_exit(Duration::from_secs(2)).await);
        assert_eq!(process.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_terminate_is_graceful_signal() {
        let process = PtyProcess::spawn(&sh()).unwrap();

        process.terminate().unwrap();
        assert!(process.wait_exit(Duration::from_secs(3)).await);
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_force_kill_ignores_traps() {
        let process = PtyProcess::spawn(&sh()).unwrap();
        process
            .write(b"trap '' HUP TERM; echo trap_ready\n")
            .await
            .unwrap();
        assert!(read_until(&process, "trap_ready").await);

        process.terminate().unwrap();
        assert!(!process.wait_exit(Duration::from_millis(300)).await);

        process.force_kill().unwrap();
        assert!(process.wait_exit(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_signals_after_exit_are_noops() {
        let process = PtyProcess::spawn(&sh()).unwrap();
        process.force_kill().unwrap();
        assert!(process.wait_exit(Duration::from_secs(2)).await);

        assert!(process.terminate().is_ok());
        assert!(process.force_kill().is_ok());
    }

    #[tokio::test]
    async fn test_write_after_exit_fails() {
        let process = PtyProcess::spawn(&sh()).unwrap();
        process.force_kill().unwrap();
        assert!(process.wait_exit(Duration::from_secs(2)).await);

        let result = process.write(b"echo hi\n").await;
        assert!(matches!(result, Err(SessionError::ProcessExited)));

        let result = process.resize(Dimensions::new(10, 10));
        assert!(matches!(result, Err(SessionError::ProcessExited)));
    }

    #[tokio::test]
    async fn test_terminate_reaches_background_jobs() {
        let process = PtyProcess::spawn(&sh()).unwrap();
        process
            .write(b"sleep 300 & echo \"bg\"\"_pid=$! bg\"\"_end\"\n")
            .await
            .unwrap();
        let output = read_output_until(&process, "bg_end").await;
        let job = number_after(&output, "bg_pid=").expect("background pid in output");
        assert!(process_running(job));

        process.terminate().unwrap();
        assert!(process.wait_exit(Duration::from_secs(3)).await);
        assert!(wait_gone(job).await, "background job {job} survived hangup");
    }

    #[tokio::test]
    async fn test_force_kill_sweeps_jobs_after_exit() {
        let process = PtyProcess::spawn(&sh()).unwrap();
        process
            .write(b"trap '' HUP; sleep 300 & echo \"nh\"\"_pid=$! nh\"\"_end\"; exit\n")
            .await
            .unwrap();
        let output = read_output_until(&process, "nh_end").await;
        let job = number_after(&output, "nh_pid=").expect("background pid in output");
        assert!(process.wait_exit(Duration::from_secs(3)).await);

        process.force_kill().unwrap();
        assert!(wait_gone(job).await, "job {job} outlived the session");
    }

    #[tokio::test]
    async fn test_remove_container_local_is_noop() {
        let process = PtyProcess::spawn(&sh()).unwrap();
        assert!(process.container().is_none());
        process.remove_container().await.unwrap();
        let _ = process.force_kill();
    }

    #[tokio::test]
    async fn test_remove_container_invokes_runtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("calls.log");
        let runtime = stub_runtime(dir.path(), &format!("echo \"$*\" >> '{}'", log.display()));

        let process = PtyProcess::spawn(&with_container(&runtime)).unwrap();
        process.remove_container().await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.trim(), "rm -f termgate-test");

        let _ = process.force_kill();
    }

    #[tokio::test]
    async fn test_remove_container_already_gone() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = stub_runtime(
            dir.path(),
            "echo 'Error response from daemon: No such container: termgate-test' >&2; exit 1",
        );

        let process = PtyProcess::spawn(&with_container(&runtime)).unwrap();
        assert!(process.remove_container().await.is_ok());

        let _ = process.force_kill();
    }

    #[tokio::test]
    async fn test_remove_container_failure_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = stub_runtime(dir.path(), "echo 'daemon not running' >&2; exit 1");

        let process = PtyProcess::spawn(&with_container(&runtime)).unwrap();
        match process.remove_container().await {
            Err(SessionError::KillFailed(message)) => assert!(message.contains("daemon not running")),
            other => panic!("expected KillFailed, got {other:?}"),
        }

        let _ = process.force_kill();
    }
}
