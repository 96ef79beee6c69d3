//! Runs one target execution and reports `(exit_code, stderr)`.
//!
//! Three delivery modes, selected once at startup: file (the default),
//! command-line (`--cmd-fuzzing`), and network (a single long-lived
//! process fed over a socket). See module-level docs on [`DeliveryMode`]
//! for the tradeoffs of each.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::platform::{self, ExitOutcome, ShMem, TIMEOUT_EXIT_CODE};

/// Sentinel substituted with the input's path (file mode, command-line
/// mode) or otherwise marking where the payload goes.
pub const INPUT_SENTINEL: &str = "@@";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkProtocol {
    Tcp,
    Udp,
}

pub enum DeliveryMode {
    /// Substitute `@@` with the path to a file holding the mutated input.
    File,
    /// Substitute `@@` with the mutated bytes themselves, run through a
    /// shell so the host's quoting rules apply (matches the reference
    /// implementation's `preexec_fn=os.setsid` + `shell=True` combination).
    CommandLine,
    /// Launch the target once; subsequent "runs" deliver bytes over a
    /// socket and report the long-lived process's exit status if it has
    /// since terminated.
    Network { addr: String, protocol: NetworkProtocol },
}

pub struct TargetRunnerConfig {
    pub binary: OsString,
    pub args_template: Vec<OsString>,
    pub mode: DeliveryMode,
    pub timeout: Duration,
    pub kill_signal: Signal,
    pub memlimit_mb: u64,
    pub debug_child: bool,
    pub envs: Vec<(OsString, OsString)>,
}

/// Owns one target execution lifecycle for a worker.
pub struct TargetRunner {
    config: TargetRunnerConfig,
    shmem: Box<dyn ShMem>,
    /// The single long-lived process in network mode, and its last known
    /// exit status once observed.
    network_process: Option<Child>,
    network_exit: Option<(i32, String)>,
}

impl TargetRunner {
    pub fn new(config: TargetRunnerConfig, worker_id: usize) -> Result<Self> {
        let shmem = platform::create(worker_id)?;
        Ok(Self {
            config,
            shmem,
            network_process: None,
            network_exit: None,
        })
    }

    pub fn trace_bitmap(&self) -> &[u8] {
        self.shmem.as_slice()
    }

    pub fn trace_bitmap_mut(&mut self) -> &mut [u8] {
        self.shmem.as_mut_slice()
    }

    /// Runs one execution and returns `(exit_code, stderr)`. `input_path`
    /// must already contain `input_bytes` on disk for file and network
    /// modes; command-line mode only needs `input_bytes`.
    pub fn run(&mut self, input_path: &Path, input_bytes: &[u8]) -> Result<(i32, String)> {
        match &self.config.mode {
            DeliveryMode::File => self.run_file_mode(input_path),
            DeliveryMode::CommandLine => self.run_cmdline_mode(input_bytes),
            DeliveryMode::Network { .. } => self.run_network_mode(input_path),
        }
    }

    fn spawn_command(&self, args: Vec<OsString>, use_shell: bool) -> Result<Command> {
        let mut cmd = if use_shell {
            let mut joined = std::ffi::OsString::new();
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    joined.push(" ");
                }
                joined.push(a);
            }
            let mut c = Command::new("sh");
            c.arg("-c").arg(joined);
            c
        } else {
            let mut c = Command::new(&self.config.binary);
            c.args(args);
            c
        };

        cmd.stdin(Stdio::null())
            .stdout(if self.config.debug_child { Stdio::inherit() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .envs(self.config.envs.iter().cloned());

        self.shmem.export_to_env(&mut cmd, "__AFL_SHM_ID");

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let memlimit = self.config.memlimit_mb;
            unsafe {
                cmd.pre_exec(move || {
                    nix::libc::setsid();
                    if memlimit > 0 {
                        let bytes = (memlimit as nix::libc::rlim_t) << 20;
                        let limit = nix::libc::rlimit { rlim_cur: bytes, rlim_max: bytes };
                        nix::libc::setrlimit(nix::libc::RLIMIT_AS, &limit);
                    }
                    Ok(())
                });
            }
        }

        Ok(cmd)
    }

    fn fill_sentinel(&self, path_str: &str) -> Vec<OsString> {
        self.config
            .args_template
            .iter()
            .map(|a| {
                if a == INPUT_SENTINEL {
                    OsString::from(path_str)
                } else {
                    a.clone()
                }
            })
            .collect()
    }

    fn run_file_mode(&mut self, input_path: &Path) -> Result<(i32, String)> {
        let path_str = input_path.to_string_lossy().to_string();
        let args = self.fill_sentinel(&path_str);
        let mut cmd = self.spawn_command(args, false)?;
        self.wait_with_watchdog(&mut cmd)
    }

    fn run_cmdline_mode(&mut self, input_bytes: &[u8]) -> Result<(i32, String)> {
        let payload = String::from_utf8_lossy(input_bytes).into_owned();
        let args = self.fill_sentinel(&payload);
        let mut cmd = self.spawn_command(args, true)?;
        self.wait_with_watchdog(&mut cmd)
    }

    fn run_network_mode(&mut self, input_path: &Path) -> Result<(i32, String)> {
        let (addr, protocol) = match &self.config.mode {
            DeliveryMode::Network { addr, protocol } => (addr.clone(), *protocol),
            _ => unreachable!(),
        };

        if self.network_process.is_none() {
            let args = self.fill_sentinel("");
            let mut cmd = self.spawn_command(args, false)?;
            let child = cmd.spawn()?;
            self.network_process = Some(child);
            // Give the target a moment to bind its listening socket before
            // the first test case is sent.
            std::thread::sleep(Duration::from_millis(500));
            return Ok((0, String::new()));
        }

        let bytes = std::fs::read(input_path)?;
        match protocol {
            NetworkProtocol::Tcp => {
                if let Ok(mut stream) = TcpStream::connect(&addr) {
                    let _ = stream.write_all(&bytes);
                    let _ = stream.set_read_timeout(Some(self.config.timeout));
                    let mut ack = [0u8; 1];
                    // Best-effort: wait briefly for the target to finish
                    // parsing before checking whether it has since died.
                    let _ = stream.read(&mut ack);
                }
            }
            NetworkProtocol::Udp => {
                if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
                    let _ = socket.send_to(&bytes, &addr);
                }
            }
        }

        if let Some(exit) = &self.network_exit {
            return Ok(exit.clone());
        }

        if let Some(child) = self.network_process.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                let code = platform_exit_code(&status);
                let mut stderr = String::new();
                if let Some(mut s) = child.stderr.take() {
                    let _ = s.read_to_string(&mut stderr);
                }
                self.network_exit = Some((code, stderr.clone()));
                return Ok((code, stderr));
            }
        }

        Ok((0, String::new()))
    }

    /// Runs `cmd`, enforcing the execution deadline by killing the child's
    /// process group if it outlives it. This stands in for the external
    /// Watchdog collaborator named in the design: something has to enforce
    /// the deadline for the binary to function end to end.
    fn wait_with_watchdog(&mut self, cmd: &mut Command) -> Result<(i32, String)> {
        let mut child = cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        let deadline = Instant::now() + self.config.timeout;

        loop {
            if let Some(status) = child.try_wait()? {
                let code = platform_exit_code(&status);
                let mut stderr = String::new();
                if let Some(mut s) = child.stderr.take() {
                    let _ = s.read_to_string(&mut stderr);
                }
                return Ok((code, stderr));
            }
            if Instant::now() >= deadline {
                let _ = killpg(pid, self.config.kill_signal);
                let _ = child.wait();
                return Ok((TIMEOUT_EXIT_CODE, String::new()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(unix)]
fn platform_exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        -signal
    } else {
        status.code().unwrap_or(0)
    }
}

#[cfg(windows)]
fn platform_exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(0)
}

/// Interprets a finished execution's `(exit_code, stderr)` pair.
pub fn classify(exit_code: i32, stderr: &str, ignore_sigabrt: bool) -> ExitOutcome {
    platform::classify_exit(exit_code, stderr, ignore_sigabrt)
}

pub fn binary_contains_shm_marker(path: &Path) -> Result<bool> {
    let bytes = std::fs::read(path)?;
    Ok(bytes.windows(b"__AFL_SHM_ID".len()).any(|w| w == b"__AFL_SHM_ID"))
}

pub fn check_instrumented(path: &Path) -> Result<()> {
    if binary_contains_shm_marker(path)? {
        Ok(())
    } else {
        Err(Error::NotInstrumented { path: path.to_path_buf() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_replacement_preserves_other_args() {
        let template = vec![OsString::from("-png"), OsString::from("@@")];
        let filled: Vec<OsString> = template
            .iter()
            .map(|a| if a == INPUT_SENTINEL { OsString::from("/tmp/x") } else { a.clone() })
            .collect();
        assert_eq!(filled, vec![OsString::from("-png"), OsString::from("/tmp/x")]);
    }
}
