use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub struct ShellGuard {
    child: Child,
    stderr_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for ShellGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

pub struct Transcript {
    pub status: ExitStatus,
    pub stdout: String,
}

/// Runs the shell binary with `args`, feeds it `script` on stdin and collects stdout.
pub fn run_with_args<I, S>(args: I, script: &str) -> anyhow::Result<Transcript>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let bin = env!("CARGO_BIN_EXE_rusty-mini-sql");
    let child = Command::new(bin)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let mut guard = ShellGuard {
        child,
        stderr_thread: None,
    };

    let stderr = guard
        .child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture shell stderr"))?;
    guard.stderr_thread = Some(thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            eprintln!("{line}"); // Relay output
        }
    }));

    let mut stdout = guard
        .child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture shell stdout"))?;
    let (out_tx, out_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let mut out = String::new();
        let _ = stdout.read_to_string(&mut out);
        let _ = out_tx.send(out);
    });

    if let Some(mut stdin) = guard.child.stdin.take() {
        // The shell may exit before reading everything (e.g. on a usage error).
        let _ = stdin.write_all(script.as_bytes());
    }

    let stdout = out_rx
        .recv_timeout(Duration::from_secs(10))
        .map_err(|err| anyhow::anyhow!("timed out waiting for shell output: {err}"))?;
    let status = guard.child.wait()?;
    Ok(Transcript { status, stdout })
}

/// Runs one shell session against the storage environment at `env_dir`.
pub fn run_session(env_dir: &Path, script: &str) -> anyhow::Result<Transcript> {
    run_with_args([env_dir.as_os_str()], script)
}
