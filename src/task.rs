//! Runs build commands, potentially in parallel.
//! Unaware of the dependency graph; just process execution and the
//! filesystem actions that publish outputs atomically.

use anyhow::bail;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};

/// How a finished command ended.
#[derive(Debug, PartialEq)]
pub enum Termination {
    Success,
    /// Nonzero exit with the given status.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(i32),
}

impl Termination {
    pub fn success(&self) -> bool {
        matches!(self, Termination::Success)
    }

    pub fn describe(&self) -> String {
        match self {
            Termination::Success => "succeeded".to_string(),
            Termination::Exited(code) => format!("failed with exit status {}", code),
            Termination::Signaled(sig) => format!("was killed by signal {}", sig),
        }
    }
}

/// A fully-prepared shell command, ready to launch.
pub struct Launch {
    pub cmdline: String,
    /// Opened as stdin; /dev/null when absent.
    pub stdin: Option<PathBuf>,
    /// Output redirection: stdout goes to the temporary path, renamed to
    /// the final path on success.
    pub redirect: Option<Redirect>,
    /// Extra variables for the child environment.
    pub env: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct Redirect {
    pub tmp: PathBuf,
    pub dest: PathBuf,
}

/// The temporary name used for atomic output publication.
pub fn tmp_path(dest: &str) -> PathBuf {
    PathBuf::from(format!("{}.stu.tmp.{}", dest, std::process::id()))
}

pub struct FinishedTask {
    pub token: usize,
    pub termination: Termination,
}

/// Executes commands on helper threads so the control thread can keep
/// driving the graph; completions come back over a channel.
pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    running: usize,
    parallelism: usize,
    /// Process group ids of running jobs, by token.
    pgids: Vec<(usize, i32)>,
}

impl Runner {
    pub fn new(parallelism: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            parallelism,
            pgids: Vec::new(),
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    /// Spawn the command in its own process group and hand it to a waiter
    /// thread.  Failures to launch are reported by the caller.
    pub fn start(&mut self, token: usize, launch: &Launch) -> anyhow::Result<()> {
        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(&launch.cmdline);
        match &launch.stdin {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .map_err(|e| anyhow::anyhow!("open {}: {}", path.display(), e))?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        if let Some(redirect) = &launch.redirect {
            let file = std::fs::File::create(&redirect.tmp)
                .map_err(|e| anyhow::anyhow!("create {}: {}", redirect.tmp.display(), e))?;
            cmd.stdout(Stdio::from(file));
        }
        for (k, v) in &launch.env {
            cmd.env(k, v);
        }
        #[cfg(unix)]
        unsafe {
            // Give each job its own process group so shutdown can signal
            // the whole pipeline, not just the shell.
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
        let mut child = cmd.spawn()?;
        self.pgids.push((token, child.id() as i32));
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let termination = match child.wait() {
                Ok(status) if status.success() => Termination::Success,
                Ok(status) => {
                    #[cfg(unix)]
                    if let Some(sig) = status.signal() {
                        let _ = tx.send(FinishedTask {
                            token,
                            termination: Termination::Signaled(sig),
                        });
                        return;
                    }
                    Termination::Exited(status.code().unwrap_or(1))
                }
                Err(_) => Termination::Exited(127),
            };
            // The send only fails if the receiver is gone, i.e. shutdown.
            let _ = tx.send(FinishedTask { token, termination });
        });
        self.running += 1;
        Ok(())
    }

    /// Wait for any command to finish, up to `timeout`; None on timeout so
    /// the caller can observe signals.
    pub fn wait(&mut self, timeout: Duration) -> Option<FinishedTask> {
        match self.finished_recv.recv_timeout(timeout) {
            Ok(task) => {
                self.pgids.retain(|&(t, _)| t != task.token);
                self.running -= 1;
                Some(task)
            }
            Err(_) => None,
        }
    }

    /// SIGTERM every running job's process group.
    #[cfg(unix)]
    pub fn terminate_all(&self) {
        for &(_, pgid) in &self.pgids {
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    pub fn terminate_all(&self) {}
}

/// Write `content` to `path` atomically via a temporary file.
pub fn write_atomic(path: &str, content: &[u8]) -> anyhow::Result<()> {
    create_parent_dirs(path)?;
    let tmp = tmp_path(path);
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Copy `src` to `dest`, preserving the source's modification time, via a
/// temporary file renamed into place.
pub fn copy_preserving(src: &str, dest: &str) -> anyhow::Result<()> {
    create_parent_dirs(dest)?;
    let tmp = tmp_path(dest);
    if let Err(e) = std::fs::copy(src, &tmp) {
        let _ = std::fs::remove_file(&tmp);
        bail!("copy {} to {}: {}", src, dest, e);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(src)?;
        let times = [
            libc::timespec {
                tv_sec: meta.atime(),
                tv_nsec: meta.atime_nsec(),
            },
            libc::timespec {
                tv_sec: meta.mtime(),
                tv_nsec: meta.mtime_nsec(),
            },
        ];
        let tmp_c = std::ffi::CString::new(tmp.to_string_lossy().into_owned())?;
        let ret = unsafe {
            libc::utimensat(libc::AT_FDCWD, tmp_c.as_ptr(), times.as_ptr(), 0)
        };
        if ret != 0 {
            bail!("utimensat {}: {}", tmp.display(), std::io::Error::last_os_error());
        }
    }
    std::fs::rename(&tmp, dest)?;
    Ok(())
}

/// Make sure the parent directory of a file output exists.
pub fn create_parent_dirs(path: &str) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
