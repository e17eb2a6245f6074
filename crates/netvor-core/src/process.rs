//! Engine and relay subprocesses
//!
//! The proxy engine and the packet relay are supervised as a pair: both run
//! or neither does. Their output is forwarded line by line to the
//! [`StatusBus`] log channel.
//!
//! ```text
//! NotStarted ──launch──► BothRunning ──stop──► Stopped
//!      │                                          ▲
//!      └──────── relay launch failed ─────────────┘
//! ```

use crate::bus::StatusBus;
use crate::error::{Error, Result};
use crate::translate;
use std::ffi::OsString;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the engine process in logs and errors
pub const ENGINE_NAME: &str = "xray";

/// Name of the relay process in logs and errors
pub const RELAY_NAME: &str = "tun2socks";

/// How long a killed process's remaining output may take to drain
const FORWARDER_DRAIN: Duration = Duration::from_millis(500);

/// How to launch one subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Descriptor that must survive exec
    pub inherit_fd: Option<RawFd>,
    /// Prepended to every forwarded output line
    pub log_prefix: String,
}

impl LaunchSpec {
    /// `<engine> run -c <config>`, run from the binary's directory.
    ///
    /// Both paths should be absolute; a relative `config` is resolved
    /// against the binary's directory by the engine.
    pub fn engine(binary: &Path, config: &Path) -> Self {
        Self {
            name: ENGINE_NAME.to_string(),
            program: binary.to_path_buf(),
            args: vec!["run".into(), "-c".into(), config.as_os_str().to_owned()],
            cwd: binary
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(Path::to_path_buf),
            inherit_fd: None,
            log_prefix: String::new(),
        }
    }

    /// `<relay> --tunfd <fd> --tunmtu <mtu> --socks-server-addr 127.0.0.1:10808 --enable-udprelay`
    pub fn relay(binary: &Path, tun_fd: RawFd, mtu: u32) -> Self {
        Self {
            name: RELAY_NAME.to_string(),
            program: binary.to_path_buf(),
            args: vec![
                "--tunfd".into(),
                tun_fd.to_string().into(),
                "--tunmtu".into(),
                mtu.to_string().into(),
                "--socks-server-addr".into(),
                translate::socks_endpoint().into(),
                "--enable-udprelay".into(),
            ],
            cwd: None,
            inherit_fd: Some(tun_fd),
            log_prefix: format!("{}: ", RELAY_NAME),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        if let Some(fd) = self.inherit_fd {
            // SAFETY: only async-signal-safe calls between fork and exec
            unsafe {
                cmd.pre_exec(move || clear_cloexec(fd));
            }
        }

        cmd
    }
}

fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl on an fd number has no memory-safety preconditions
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Pair lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    NotStarted,
    BothRunning,
    Stopped,
}

struct Supervised {
    name: String,
    child: Child,
    forwarders: Vec<JoinHandle<()>>,
}

impl Supervised {
    fn spawn(spec: &LaunchSpec, bus: &StatusBus) -> Result<Self> {
        let mut child = spec
            .command()
            .spawn()
            .map_err(|e| Error::launch(&spec.name, e))?;

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(stdout, spec.log_prefix.clone(), bus.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(stderr, spec.log_prefix.clone(), bus.clone()));
        }

        info!("Launched {} (pid {:?})", spec.name, child.id());

        Ok(Self {
            name: spec.name.clone(),
            child,
            forwarders,
        })
    }

    async fn kill(mut self) {
        // Already exited is fine.
        if let Err(e) = self.child.kill().await {
            debug!("{} kill: {}", self.name, e);
        }

        // Forwarders end at EOF once buffered output is drained. A grandchild
        // holding the pipe open would keep them alive, hence the bound.
        for forwarder in self.forwarders {
            let abort = forwarder.abort_handle();
            if tokio::time::timeout(FORWARDER_DRAIN, forwarder).await.is_err() {
                debug!("{} output still open after kill, dropping it", self.name);
                abort.abort();
            }
        }
        debug!("{} stopped", self.name);
    }
}

/// Forward output lines to the bus until the stream ends
fn forward_lines<R>(reader: R, prefix: String, bus: StatusBus) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => bus.emit_log(format!("{}{}", prefix, line)),
                Ok(None) => break,
                Err(e) => {
                    debug!("Output forwarder ended: {}", e);
                    break;
                }
            }
        }
    })
}

/// Engine and relay, launched and stopped together
pub struct ProcessPair {
    state: PairState,
    engine: Option<Supervised>,
    relay: Option<Supervised>,
}

impl ProcessPair {
    pub fn new() -> Self {
        Self {
            state: PairState::NotStarted,
            engine: None,
            relay: None,
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    /// Engine process id while running
    pub fn engine_pid(&self) -> Option<u32> {
        self.engine.as_ref().and_then(|s| s.child.id())
    }

    /// Relay process id while running
    pub fn relay_pid(&self) -> Option<u32> {
        self.relay.as_ref().and_then(|s| s.child.id())
    }

    /// Launch the engine, then the relay.
    ///
    /// If the relay fails to start the engine is killed before the error is
    /// returned.
    pub async fn launch(
        &mut self,
        engine: &LaunchSpec,
        relay: &LaunchSpec,
        bus: &StatusBus,
    ) -> Result<()> {
        if self.state != PairState::NotStarted {
            return Err(Error::launch(&engine.name, "process pair already used"));
        }

        let engine_proc = match Supervised::spawn(engine, bus) {
            Ok(proc) => proc,
            Err(e) => {
                self.state = PairState::Stopped;
                return Err(e);
            }
        };

        match Supervised::spawn(relay, bus) {
            Ok(relay_proc) => {
                self.engine = Some(engine_proc);
                self.relay = Some(relay_proc);
                self.state = PairState::BothRunning;
                Ok(())
            }
            Err(e) => {
                warn!("{} failed to launch, stopping {}", relay.name, engine.name);
                engine_proc.kill().await;
                self.state = PairState::Stopped;
                Err(e)
            }
        }
    }

    /// Kill the relay, then the engine
    pub async fn stop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.kill().await;
        }
        if let Some(engine) = self.engine.take() {
            engine.kill().await;
        }
        self.state = PairState::Stopped;
    }
}

impl Default for ProcessPair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(name: &str, script: &str, prefix: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            cwd: None,
            inherit_fd: None,
            log_prefix: prefix.to_string(),
        }
    }

    async fn wait_for_line(bus: &StatusBus, line: &str) -> bool {
        for _ in 0..100 {
            if bus.recent_logs(usize::MAX).iter().any(|l| l == line) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_engine_argv() {
        let spec = LaunchSpec::engine(
            Path::new("/opt/netvor/bin/xray"),
            Path::new("/var/lib/netvor/config.json"),
        );
        assert_eq!(spec.args, vec!["run", "-c", "/var/lib/netvor/config.json"]);
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/opt/netvor/bin")));
        assert!(spec.inherit_fd.is_none());
        assert!(spec.log_prefix.is_empty());
    }

    #[test]
    fn test_engine_bare_name_has_no_cwd() {
        let spec = LaunchSpec::engine(Path::new("xray"), Path::new("/var/lib/netvor/config.json"));
        assert!(spec.cwd.is_none());
    }

    #[test]
    fn test_relay_argv() {
        let spec = LaunchSpec::relay(Path::new("/opt/netvor/bin/tun2socks"), 7, 1500);
        assert_eq!(
            spec.args,
            vec![
                "--tunfd",
                "7",
                "--tunmtu",
                "1500",
                "--socks-server-addr",
                "127.0.0.1:10808",
                "--enable-udprelay",
            ]
        );
        assert_eq!(spec.inherit_fd, Some(7));
        assert_eq!(spec.log_prefix, "tun2socks: ");
    }

    #[tokio::test]
    async fn test_launch_forwards_both_outputs() {
        let bus = StatusBus::new();
        let mut pair = ProcessPair::new();

        let engine = shell("xray", "echo engine up; echo engine warn >&2; exec sleep 30", "");
        let relay = shell("tun2socks", "echo relay up; exec sleep 30", "tun2socks: ");

        pair.launch(&engine, &relay, &bus).await.unwrap();
        assert_eq!(pair.state(), PairState::BothRunning);
        assert!(pair.engine_pid().is_some());
        assert!(pair.relay_pid().is_some());

        assert!(wait_for_line(&bus, "engine up").await);
        assert!(wait_for_line(&bus, "engine warn").await);
        assert!(wait_for_line(&bus, "tun2socks: relay up").await);

        pair.stop().await;
        assert_eq!(pair.state(), PairState::Stopped);
        assert!(pair.engine_pid().is_none());

        // Stopping twice is harmless
        pair.stop().await;
    }

    #[tokio::test]
    async fn test_relay_failure_kills_engine() {
        let bus = StatusBus::new();
        let mut pair = ProcessPair::new();

        let engine = shell("xray", "exec sleep 30", "");
        let mut relay = shell("tun2socks", "", "tun2socks: ");
        relay.program = PathBuf::from("/nonexistent/tun2socks");

        let err = pair.launch(&engine, &relay, &bus).await.unwrap_err();
        match err {
            Error::SubprocessLaunchFailed { name, .. } => assert_eq!(name, "tun2socks"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pair.state(), PairState::Stopped);
        assert!(pair.engine_pid().is_none());
    }

    #[tokio::test]
    async fn test_stop_drains_buffered_output() {
        let bus = StatusBus::new();
        let mut pair = ProcessPair::new();

        let engine = shell(
            "xray",
            "seq 1 500; echo flushed >&2; exec sleep 30",
            "",
        );
        let relay = shell("tun2socks", "exec sleep 30", "tun2socks: ");

        pair.launch(&engine, &relay, &bus).await.unwrap();
        // stdout is fully written into the pipe before stderr says so
        assert!(wait_for_line(&bus, "flushed").await);
        pair.stop().await;

        let logs = bus.recent_logs(usize::MAX);
        assert!(logs.iter().any(|l| l == "500"));
        assert!(logs.iter().any(|l| l == "1"));
    }

    #[tokio::test]
    async fn test_pair_is_single_use() {
        let bus = StatusBus::new();
        let mut pair = ProcessPair::new();
        let engine = shell("xray", "exit 0", "");
        let relay = shell("tun2socks", "exit 0", "");

        pair.launch(&engine, &relay, &bus).await.unwrap();
        pair.stop().await;

        assert!(pair.launch(&engine, &relay, &bus).await.is_err());
    }

    #[tokio::test]
    async fn test_inherited_fd_visible_to_child() {
        use std::os::fd::AsRawFd;

        let bus = StatusBus::new();
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = file.as_raw_fd();

        let engine = shell("xray", "exec sleep 30", "");
        let mut relay = shell(
            "tun2socks",
            &format!("if [ -e /proc/self/fd/{fd} ] || [ -e /dev/fd/{fd} ]; then echo inherited; fi; exec sleep 30"),
            "",
        );
        relay.inherit_fd = Some(fd);

        let mut pair = ProcessPair::new();
        pair.launch(&engine, &relay, &bus).await.unwrap();
        assert!(wait_for_line(&bus, "inherited").await);
        pair.stop().await;
        drop(file);
    }
}
