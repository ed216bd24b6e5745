//! Chrome executable discovery, launch and PID-file bookkeeping.
//!
//! The PID file records the browser we auto-launched so a later instance can
//! sweep it. A PID read from the file is killed only when it can be verified
//! to still be a Chrome/Chromium process; PIDs are reused by the OS.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::BrowserError;
use crate::Result;

const LAUNCH_READY_TIMEOUT: Duration = Duration::from_secs(15);
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(200);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[cfg(target_os = "macos")]
const CHROME_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Google Chrome Canary.app/Contents/MacOS/Google Chrome Canary",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

#[cfg(target_os = "linux")]
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/opt/google/chrome/chrome",
];

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
const CHROME_PATHS: &[&str] = &[];

/// Locate a Chrome/Chromium executable: explicit override first, then the
/// platform-conventional install locations.
pub fn locate(override_path: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        warn!("configured browser path does not exist: {}", path.display());
        return None;
    }
    CHROME_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

/// A browser process we launched ourselves.
#[derive(Debug)]
pub struct ChromeHandle {
    pub pid: u32,
    pub profile_dir: PathBuf,
}

/// Launch Chrome with its remote-debugging port open and wait for the
/// inspection endpoint to come up.
pub async fn launch(
    executable: &Path,
    host: &str,
    port: u16,
    launch_url: Option<&str>,
) -> Result<ChromeHandle> {
    let profile_dir = std::env::temp_dir().join(format!(
        "pagebridge-profile-{}-{}",
        std::process::id(),
        port
    ));

    let mut command = tokio::process::Command::new(executable);
    command
        .arg(format!("--remote-debugging-port={port}"))
        .arg(format!("--user-data-dir={}", profile_dir.display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg(launch_url.unwrap_or("about:blank"))
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(false);

    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|e| {
        BrowserError::Unreachable(format!(
            "failed to launch {}: {e}",
            executable.display()
        ))
    })?;
    let pid = child
        .id()
        .ok_or_else(|| BrowserError::Unreachable("launched browser exited immediately".into()))?;

    info!("launched browser pid={pid} debug port {port}");
    wait_until_ready(host, port).await?;

    Ok(ChromeHandle { pid, profile_dir })
}

/// Poll the version endpoint until the debug port answers.
async fn wait_until_ready(host: &str, port: u16) -> Result<()> {
    let url = format!("http://{host}:{port}/json/version");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| BrowserError::Unreachable(e.to_string()))?;

    let deadline = Instant::now() + LAUNCH_READY_TIMEOUT;
    loop {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("debug endpoint ready at {url}");
                return Ok(());
            }
            _ if Instant::now() >= deadline => {
                return Err(BrowserError::Unreachable(format!(
                    "browser did not open {url} within {LAUNCH_READY_TIMEOUT:?}"
                )));
            }
            _ => sleep(LAUNCH_POLL_INTERVAL).await,
        }
    }
}

pub fn is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 probes for existence without delivering anything.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Whether `pid` names a Chrome/Chromium process. Fails closed: any failure
/// to read the process name means "no".
pub fn is_browser_process(pid: u32) -> bool {
    process_name(pid)
        .map(|name| {
            let name = name.to_ascii_lowercase();
            name.contains("chrome") || name.contains("chromium")
        })
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn process_name(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_name(pid: u32) -> Option<String> {
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(not(unix))]
fn process_name(_pid: u32) -> Option<String> {
    None
}

/// SIGTERM the whole process group, escalating to SIGKILL after a grace
/// period if the root process is still around.
pub async fn kill_tree(pid: u32) {
    #[cfg(unix)]
    {
        let pid = pid as i32;
        unsafe {
            if libc::kill(-pid, libc::SIGTERM) != 0 {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        let deadline = Instant::now() + KILL_GRACE;
        while is_alive(pid as u32) && Instant::now() < deadline {
            sleep(Duration::from_millis(100)).await;
        }
        if is_alive(pid as u32) {
            warn!("pid {pid} survived SIGTERM, sending SIGKILL");
            unsafe {
                if libc::kill(-pid, libc::SIGKILL) != 0 {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

pub fn pid_file_path(debug_port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("pagebridge-chrome-{debug_port}.pid"))
}

pub fn write_pid_file(debug_port: u16, pid: u32) -> Result<()> {
    std::fs::write(pid_file_path(debug_port), pid.to_string())?;
    Ok(())
}

pub fn read_pid_file(debug_port: u16) -> Option<u32> {
    let contents = std::fs::read_to_string(pid_file_path(debug_port)).ok()?;
    contents.trim().parse().ok()
}

/// Synchronous removal, callable from an exit handler.
pub fn remove_pid_file(debug_port: u16) {
    let _ = std::fs::remove_file(pid_file_path(debug_port));
}

/// Crash-recovery sweep: if a previous instance left a PID file and that PID
/// is still a live browser, tree-kill it so the debug port frees up. The file
/// is removed either way; an unverifiable PID is never killed.
pub async fn sweep_stale_pid_file(debug_port: u16) {
    let Some(pid) = read_pid_file(debug_port) else {
        return;
    };
    if is_alive(pid) && is_browser_process(pid) {
        info!("sweeping stale browser pid={pid} from previous run");
        kill_tree(pid).await;
    } else {
        debug!("stale PID file pid={pid} not verified as browser, not killing");
    }
    remove_pid_file(debug_port);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pid_file_path_includes_port() {
        let path = pid_file_path(9222);
        let name = path.file_name().map(|n| n.to_string_lossy().to_string());
        assert_eq!(name.as_deref(), Some("pagebridge-chrome-9222.pid"));
    }

    #[test]
    fn pid_file_round_trip() {
        // Use a port outside the real range of this test environment.
        let port = 64999;
        write_pid_file(port, 12345).unwrap();
        assert_eq!(read_pid_file(port), Some(12345));
        remove_pid_file(port);
        assert_eq!(read_pid_file(port), None);
    }

    #[test]
    fn locate_with_missing_override_returns_none() {
        assert_eq!(locate(Some("/definitely/not/a/browser")), None);
    }

    #[cfg(unix)]
    #[test]
    fn current_process_is_alive_but_not_a_browser() {
        let pid = std::process::id();
        assert!(is_alive(pid));
        assert!(!is_browser_process(pid));
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_is_not_alive() {
        // PID 0 addresses the caller's process group for kill(); use an
        // improbable high pid instead.
        assert!(!is_alive(4_000_000));
    }
}
