use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(sha256_bytes(&buf))
}

/// Line-based unified diff with a single full-context hunk. Enough for the
/// audit diffs persisted next to each trial's submitted artifact.
pub fn unified_diff(original: &str, revised: &str, from_label: &str, to_label: &str) -> String {
    let a: Vec<&str> = original.lines().collect();
    let b: Vec<&str> = revised.lines().collect();

    // LCS table over lines; inputs are short source files.
    let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut body = String::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            body.push(' ');
            body.push_str(a[i]);
            body.push('\n');
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            body.push('-');
            body.push_str(a[i]);
            body.push('\n');
            i += 1;
        } else {
            body.push('+');
            body.push_str(b[j]);
            body.push('\n');
            j += 1;
        }
    }
    for line in &a[i..] {
        body.push('-');
        body.push_str(line);
        body.push('\n');
    }
    for line in &b[j..] {
        body.push('+');
        body.push_str(line);
        body.push('\n');
    }

    format!(
        "--- {}\n+++ {}\n@@ -1,{} +1,{} @@\n{}",
        from_label,
        to_label,
        a.len(),
        b.len(),
        body
    )
}

#[derive(Debug, Clone)]
pub struct ProgramOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProgramOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }
}

pub fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Runs untrusted program text under `python3` with captured streams and a
/// kill-on-deadline timeout. The caller sees faults as data, never a panic.
pub fn run_python(code: &str, timeout: Duration) -> Result<ProgramOutput> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| anyhow!("system clock error: {}", e))?
        .as_nanos();
    let script_path = std::env::temp_dir().join(format!(
        "etlbench_prog_{}_{}.py",
        std::process::id(),
        nanos
    ));
    fs::write(&script_path, code)?;

    let mut child = Command::new("python3")
        .arg(&script_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| anyhow!("failed to spawn python3: {}", e))?;

    // Drain both pipes off-thread so a chatty program cannot deadlock
    // against a full pipe buffer while we poll for exit.
    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout not captured"))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child stderr not captured"))?;
    let stdout_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        buf
    });
    let stderr_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        buf
    });

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    };

    let stdout = stdout_reader
        .join()
        .map_err(|_| anyhow!("stdout reader thread panicked"))?;
    let stderr = stderr_reader
        .join()
        .map_err(|_| anyhow!("stderr reader thread panicked"))?;
    let _ = fs::remove_file(&script_path);

    Ok(ProgramOutput {
        status: status.and_then(|s| s.code()),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        timed_out,
    })
}
