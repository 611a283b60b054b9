//! Native engine implementation
//!
//! Runs the child directly with `tokio::process`, in its own process group,
//! with resource limits applied through `setrlimit` before exec. It is the
//! reference engine for the control plane, not an isolation boundary.

use bytes::Bytes;
use nix::libc::{rlim_t, RLIM_INFINITY};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{Engine, EngineEvent, SpawnRequest};
use crate::channel::{STDERR_FD, STDOUT_FD};
use crate::config::{Limits, SandboxConfig};
use crate::error::EngineError;
use crate::sandbox::EngineSink;

/// Pipe read size
const READ_CHUNK: usize = 8 * 1024;

/// Engine that runs the child as a plain host process
pub struct NativeEngine {
    limits: Limits,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    spawned: bool,
    stdin: Option<mpsc::UnboundedSender<Bytes>>,
    /// Process group of the child, equal to its pid
    pgid: Option<i32>,
    exited: Arc<AtomicBool>,
}

impl NativeEngine {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            control: Mutex::new(Control::default()),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.limits.clone())
    }

    fn build_command(&self, request: &SpawnRequest) -> Command {
        let options = &request.options;
        let program = request.mapping.map(&options.program);
        debug!("Resolved program {:?} -> {:?}", options.program, program);

        let mut cmd = Command::new(program);
        cmd.args(&options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref env) = options.env {
            cmd.env_clear();
            cmd.envs(env);
        }

        if let Some(ref dir) = options.work_dir {
            let dir = request.mapping.map(&dir.to_string_lossy());
            debug!("Working directory: {}", dir);
            cmd.current_dir(dir);
        }

        let rlimits = RlimitPlan::new(&self.limits, request.debug_on_crash);
        // SAFETY: the hook only issues setpgid/setrlimit syscalls and does
        // not allocate.
        unsafe {
            cmd.pre_exec(move || {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                rlimits.apply()?;
                Ok(())
            });
        }

        cmd
    }
}

impl Default for NativeEngine {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl Engine for NativeEngine {
    fn spawn(&self, request: SpawnRequest, sink: EngineSink) -> Result<(), EngineError> {
        let handle = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let _guard = handle.enter();

        let mut control = self.control.lock();
        if control.spawned {
            return Err(EngineError::Spawn("engine already spawned a child".into()));
        }
        control.spawned = true;

        let mut child = self.build_command(&request).spawn().map_err(|e| {
            EngineError::Spawn(format!("{}: {}", request.options.program, e))
        })?;
        let pid = child.id().map(|id| id as i32);
        info!("Started native child (pid: {:?})", pid);

        let (reaped_tx, reaped_rx) = watch::channel(false);
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_stdin(stdin, stdin_rx));
        }

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_output(
                stdout,
                STDOUT_FD,
                sink.clone(),
                reaped_rx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(
                stderr,
                STDERR_FD,
                sink.clone(),
                reaped_rx,
            )));
        }

        let exit = Exit {
            pid,
            wall_time: self.limits.wall_time_ms.map(|ms| Duration::from_millis(ms.into())),
            debug_on_crash: request.debug_on_crash,
            exited: Arc::clone(&control.exited),
            reaped: reaped_tx,
        };
        tokio::spawn(exit.watch(child, readers, sink));

        control.stdin = Some(stdin_tx);
        control.pgid = pid;
        Ok(())
    }

    fn kill(&self) {
        let control = self.control.lock();
        if control.exited.load(Ordering::Acquire) {
            return;
        }
        if let Some(pgid) = control.pgid {
            debug!("Killing native child group {}", pgid);
            kill_group(pgid);
        }
    }

    fn write_stdin(&self, bytes: Bytes) -> Result<(), EngineError> {
        let control = self.control.lock();
        match control.stdin {
            Some(ref tx) => tx.send(bytes).map_err(|_| EngineError::NotRunning),
            None => Err(EngineError::NotRunning),
        }
    }

    fn close_stdin(&self) {
        if self.control.lock().stdin.take().is_some() {
            debug!("Closing native child stdin");
        }
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if let Some(pgid) = control.pgid {
            if !control.exited.load(Ordering::Acquire) {
                debug!("Engine dropped while child {} is running, killing it", pgid);
                kill_group(pgid);
            }
        }
    }
}

fn kill_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

/// Limits resolved to raw rlimit values before fork
#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    cpu_secs: Option<rlim_t>,
    address_space: Option<rlim_t>,
    processes: Option<rlim_t>,
    open_files: Option<rlim_t>,
    file_size: Option<rlim_t>,
    unlimited_core: bool,
}

impl RlimitPlan {
    fn new(limits: &Limits, debug_on_crash: bool) -> Self {
        Self {
            // Round up so a sub-second limit still allows some CPU time
            cpu_secs: limits
                .cpu_time_ms
                .map(|ms| rlim_t::from(ms).div_ceil(1000).max(1)),
            address_space: limits.memory_mb.map(|mb| rlim_t::from(mb) * 1024 * 1024),
            processes: limits.processes.map(rlim_t::from),
            open_files: limits.open_files.map(rlim_t::from),
            file_size: limits.fsize_kb.map(|kb| rlim_t::from(kb) * 1024),
            unlimited_core: debug_on_crash,
        }
    }

    fn apply(&self) -> nix::Result<()> {
        if let Some(secs) = self.cpu_secs {
            // Hard limit one second above so SIGXCPU arrives before SIGKILL
            setrlimit(Resource::RLIMIT_CPU, secs, secs + 1)?;
        }
        let fixed = [
            (Resource::RLIMIT_AS, self.address_space),
            (Resource::RLIMIT_NPROC, self.processes),
            (Resource::RLIMIT_NOFILE, self.open_files),
            (Resource::RLIMIT_FSIZE, self.file_size),
        ];
        for (resource, value) in fixed {
            if let Some(value) = value {
                setrlimit(resource, value, value)?;
            }
        }
        if self.unlimited_core {
            setrlimit(Resource::RLIMIT_CORE, RLIM_INFINITY, RLIM_INFINITY)?;
        }
        Ok(())
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = stdin.write_all(&bytes).await {
            debug!("Child stdin closed: {}", e);
            return;
        }
        let _ = stdin.flush().await;
    }
}

/// Copy one pipe into the sink. Honors `wait_writable` until the child is
/// reaped; after that the pipe is drained to EOF regardless.
async fn pump_output<R>(
    mut reader: R,
    fd: i32,
    sink: EngineSink,
    mut reaped: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut draining = false;
    loop {
        if !draining {
            tokio::select! {
                writable = sink.wait_writable(fd) => {
                    if writable.is_err() {
                        return;
                    }
                }
                _ = reaped.wait_for(|done| *done) => {
                    debug!("Child reaped, draining fd {} without backpressure", fd);
                    draining = true;
                }
            }
        }
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                if let Err(e) = sink.data(fd, Bytes::copy_from_slice(&buf[..n])) {
                    warn!("Output for fd {} rejected: {}", fd, e);
                    return;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Read error on fd {}: {}", fd, e);
                return;
            }
        }
    }
}

/// Waits for the child and reports how it ended
struct Exit {
    pid: Option<i32>,
    wall_time: Option<Duration>,
    debug_on_crash: bool,
    exited: Arc<AtomicBool>,
    /// Releases readers parked on backpressure
    reaped: watch::Sender<bool>,
}

impl Exit {
    async fn watch(
        self,
        mut child: Child,
        readers: Vec<tokio::task::JoinHandle<()>>,
        sink: EngineSink,
    ) {
        let status = match self.wall_time {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!("Wall time limit of {:?} exceeded, killing child", limit);
                    if let Some(pgid) = self.pid {
                        kill_group(pgid);
                    }
                    child.wait().await
                }
            },
            None => child.wait().await,
        };
        self.exited.store(true, Ordering::Release);
        self.reaped.send_replace(true);

        // Stragglers in the group would keep the pipes open
        if let Some(pgid) = self.pid {
            kill_group(pgid);
        }
        // Output the child produced must reach the readers before the exit
        for reader in readers {
            let _ = reader.await;
        }

        if let Ok(ref status) = status {
            if let Some(signal) = status.signal() {
                if self.debug_on_crash && is_crash(signal) {
                    error!(
                        "Native child (pid: {:?}) crashed with signal {}{}, core dump enabled",
                        self.pid,
                        signal,
                        if status.core_dumped() { " (core dumped)" } else { "" }
                    );
                }
            }
        }

        let _ = sink.deliver(status_event(status));
    }
}

/// Terminating event for a reaped child. A failed wait is reported as
/// exit status -1, never as a signal the child did not receive.
fn status_event(status: std::io::Result<ExitStatus>) -> EngineEvent {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                debug!("Native child exited with {}", code);
                EngineEvent::Exit(code)
            } else if let Some(signal) = status.signal() {
                EngineEvent::Signal(signal)
            } else {
                warn!("Native child ended without status: {:?}", status);
                EngineEvent::Exit(-1)
            }
        }
        Err(e) => {
            error!("Failed to wait for native child: {}", e);
            EngineEvent::Exit(-1)
        }
    }
}

fn is_crash(signal: i32) -> bool {
    matches!(
        Signal::try_from(signal),
        Ok(Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGILL
            | Signal::SIGFPE
            | Signal::SIGABRT
            | Signal::SIGSYS)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPolicy;
    use crate::engine::SpawnOptions;
    use crate::error::SandboxError;
    use crate::lifecycle::{LifecycleEvent, LifecycleState, Termination};
    use crate::sandbox::Sandbox;

    fn sandbox_with(limits: Limits) -> Sandbox {
        Sandbox::with_config(NativeEngine::new(limits), &SandboxConfig::default())
    }

    fn sh(sandbox: &Sandbox, script: &str) {
        sandbox.spawn("/bin/sh", ["-c", script]).unwrap();
    }

    #[tokio::test]
    async fn test_echo() {
        let sandbox = sandbox_with(Limits::default());
        let mut lifecycle = sandbox.events().subscribe_lifecycle();

        sandbox.spawn("/bin/echo", ["hi"]).unwrap();

        assert_eq!(sandbox.stdout().read_to_end().await, b"hi\n");
        assert_eq!(sandbox.wait().await, Termination::Exited(0));
        assert_eq!(lifecycle.recv().await.unwrap(), LifecycleEvent::Started);
        assert_eq!(lifecycle.recv().await.unwrap(), LifecycleEvent::Exit(0));
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code() {
        let sandbox = sandbox_with(Limits::default());
        sh(&sandbox, "echo out; echo err >&2; exit 3");

        let (out, err) = tokio::join!(
            sandbox.stdout().read_to_end(),
            sandbox.stderr().read_to_end()
        );
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
        assert_eq!(sandbox.wait().await, Termination::Exited(3));
    }

    #[tokio::test]
    async fn test_stdin_passthrough() {
        let sandbox = sandbox_with(Limits::default());
        sandbox.spawn("/bin/cat", Vec::<String>::new()).unwrap();

        sandbox.stdin().write("ping ").unwrap();
        sandbox.stdin().write("pong").unwrap();
        sandbox.stdin().end().unwrap();

        assert_eq!(sandbox.stdout().read_to_end().await, b"ping pong");
        assert_eq!(sandbox.wait().await, Termination::Exited(0));
        assert!(matches!(
            sandbox.stdin().write("late"),
            Err(SandboxError::ClosedChannel)
        ));
    }

    #[tokio::test]
    async fn test_kill() {
        let sandbox = sandbox_with(Limits::default());
        sh(&sandbox, "sleep 30");

        sandbox.kill().unwrap();
        sandbox.kill().unwrap();
        assert_eq!(sandbox.wait().await, Termination::Signaled(9));
        assert!(sandbox.kill().is_ok());
    }

    #[tokio::test]
    async fn test_wall_time_limit() {
        let limits = Limits {
            wall_time_ms: Some(200),
            ..Limits::default()
        };
        let sandbox = sandbox_with(limits);
        sh(&sandbox, "sleep 30");

        let termination = tokio::time::timeout(Duration::from_secs(10), sandbox.wait())
            .await
            .unwrap();
        assert_eq!(termination, Termination::Signaled(9));
        assert_eq!(termination.exit_code(), 137);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sandbox = sandbox_with(Limits::default());
        let err = sandbox
            .spawn("/no/such/program", Vec::<String>::new())
            .unwrap_err();

        assert!(matches!(err, SandboxError::Spawn(EngineError::Spawn(_))));
        assert_eq!(
            sandbox.state(),
            LifecycleState::Terminated(Termination::SpawnFailed)
        );
    }

    #[test]
    fn test_spawn_requires_runtime() {
        let sandbox = sandbox_with(Limits::default());
        let err = sandbox.spawn("/bin/true", Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, SandboxError::Spawn(EngineError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_env_and_mapped_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let real = std::fs::canonicalize(dir.path()).unwrap();
        let real_str = real.to_string_lossy().into_owned();

        let sandbox = sandbox_with(Limits::default());
        sandbox.set_filename_mapping(move |path| match path {
            "/contract" => real_str.clone(),
            "/virtual/sh" => "/bin/sh".to_string(),
            other => other.to_string(),
        });

        let options = SpawnOptions::new("/virtual/sh")
            .with_args(["-c", "echo \"$GREETING\"; pwd -P"])
            .with_env([("GREETING", "hello")])
            .with_work_dir("/contract");
        sandbox.spawn_with(options).unwrap();

        let out = String::from_utf8(sandbox.stdout().read_to_end().await).unwrap();
        assert_eq!(out, format!("hello\n{}\n", real.display()));
        assert_eq!(sandbox.wait().await, Termination::Exited(0));
    }

    #[tokio::test]
    async fn test_suspend_policy_delivers_everything() {
        let config =
            SandboxConfig::default().with_output_buffer(BufferPolicy::Suspend { capacity: 4096 });
        let sandbox = Sandbox::with_config(NativeEngine::default(), &config);
        sandbox
            .spawn("/bin/sh", ["-c", "head -c 100000 /dev/zero"])
            .unwrap();

        let out = sandbox.stdout().read_to_end().await;
        assert_eq!(out.len(), 100_000);
        assert_eq!(sandbox.stdout().dropped_bytes(), 0);
        assert_eq!(sandbox.wait().await, Termination::Exited(0));
    }

    #[tokio::test]
    async fn test_kill_with_suspended_undrained_output() {
        let config =
            SandboxConfig::default().with_output_buffer(BufferPolicy::Suspend { capacity: 4 });
        let sandbox = Sandbox::with_config(NativeEngine::default(), &config);
        sandbox
            .spawn("/bin/sh", ["-c", "head -c 1000000 /dev/zero"])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        sandbox.kill().unwrap();

        let termination = tokio::time::timeout(Duration::from_secs(5), sandbox.wait())
            .await
            .expect("kill must end a suspended sandbox");
        assert_eq!(termination, Termination::Signaled(9));
        assert!(sandbox.stdout().buffered_len() >= 4);
        assert_eq!(sandbox.stdout().dropped_bytes(), 0);
    }

    #[tokio::test]
    async fn test_file_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let limits = Limits {
            fsize_kb: Some(1),
            ..Limits::default()
        };
        let sandbox = sandbox_with(limits);
        sandbox
            .spawn_with(
                SpawnOptions::new("/bin/sh")
                    .with_args(["-c", "trap '' XFSZ; head -c 4096 /dev/zero > big || exit 7"])
                    .with_work_dir(dir.path()),
            )
            .unwrap();

        assert_eq!(sandbox.wait().await, Termination::Exited(7));
    }

    #[test]
    fn test_rlimit_plan() {
        let limits = Limits {
            cpu_time_ms: Some(1500),
            memory_mb: Some(64),
            ..Limits::default()
        };
        let plan = RlimitPlan::new(&limits, true);
        assert_eq!(plan.cpu_secs, Some(2));
        assert_eq!(plan.address_space, Some(64 * 1024 * 1024));
        assert_eq!(plan.open_files, Some(256));
        assert_eq!(plan.file_size, Some(256 * 1024 * 1024));
        assert!(plan.unlimited_core);

        let plan = RlimitPlan::new(&Limits { cpu_time_ms: Some(10), ..limits }, false);
        assert_eq!(plan.cpu_secs, Some(1));
        assert!(!plan.unlimited_core);
    }

    #[test]
    fn test_status_event() {
        assert_eq!(status_event(Ok(ExitStatus::from_raw(0))), EngineEvent::Exit(0));
        assert_eq!(status_event(Ok(ExitStatus::from_raw(3 << 8))), EngineEvent::Exit(3));
        assert_eq!(status_event(Ok(ExitStatus::from_raw(9))), EngineEvent::Signal(9));

        let failed = std::io::Error::new(ErrorKind::Other, "wait failed");
        assert_eq!(status_event(Err(failed)), EngineEvent::Exit(-1));
    }

    #[test]
    fn test_crash_signals() {
        assert!(is_crash(11));
        assert!(is_crash(6));
        assert!(!is_crash(9));
        assert!(!is_crash(15));
    }

    #[test]
    fn test_engine_refuses_stdin_before_spawn() {
        let engine = NativeEngine::default();
        assert!(matches!(
            engine.write_stdin(Bytes::from_static(b"x")),
            Err(EngineError::NotRunning)
        ));
        engine.close_stdin();
        engine.kill();
    }
}
