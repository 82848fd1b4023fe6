//! Host-OS side effects behind the executor gates.
//!
//! Everything here runs after policy, validation, and confirmation have
//! passed. Child processes get a 30 s wall-clock timeout and bounded
//! output; file payloads are size-checked before touching content. The
//! window and volume recipes are PowerShell-flavoured and best-effort on
//! other hosts.

use super::FunctionError;
use super::guards::{MAX_FILE_BYTES, WindowAction};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Wall-clock limit for any spawned process.
const PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum stdout returned from a shell query.
const MAX_STDOUT_CHARS: usize = 5_000;

/// Maximum stderr returned from a shell query.
const MAX_STDERR_CHARS: usize = 1_000;

/// Read payload cap; the true size is always reported alongside.
const READ_PAYLOAD_BYTES: usize = 1_000;

/// Cap on search results.
const MAX_SEARCH_RESULTS: usize = 100;

/// Truncate to a character boundary at or below `max` characters.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    s.chars().take(max).collect()
}

/// Run a process to completion under [`PROCESS_TIMEOUT`].
async fn run_with_timeout(
    program: &str,
    args: &[&str],
) -> Result<(i32, String, String), FunctionError> {
    let child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FunctionError::Execution(format!("failed to spawn {program}: {e}")))?;

    let output = tokio::time::timeout(PROCESS_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| FunctionError::Timeout(PROCESS_TIMEOUT.as_secs()))?
        .map_err(|e| FunctionError::Execution(format!("{program} failed: {e}")))?;

    let stdout = truncate_chars(&String::from_utf8_lossy(&output.stdout), MAX_STDOUT_CHARS);
    let stderr = truncate_chars(&String::from_utf8_lossy(&output.stderr), MAX_STDERR_CHARS);
    Ok((output.status.code().unwrap_or(-1), stdout, stderr))
}

/// Spawn a process without waiting for it (application launch, openers).
fn spawn_detached(program: &str, args: &[&str]) -> Result<(), FunctionError> {
    Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map(|_| ())
        .map_err(|e| FunctionError::Execution(format!("failed to launch {program}: {e}")))
}

/// Launch a whitelisted application executable.
pub fn launch_application(executable: &str) -> Result<Value, FunctionError> {
    spawn_detached(executable, &[])?;
    Ok(json!({ "launched": executable }))
}

/// Open a file or URL with the platform default handler.
pub fn open_with_default(target: &str) -> Result<Value, FunctionError> {
    #[cfg(target_os = "windows")]
    spawn_detached("cmd", &["/C", "start", "", target])?;
    #[cfg(target_os = "macos")]
    spawn_detached("open", &[target])?;
    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    spawn_detached("xdg-open", &[target])?;

    Ok(json!({ "opened": target }))
}

/// Run a validated read-only shell query.
pub async fn run_shell_query(command: &str) -> Result<Value, FunctionError> {
    debug!(command, "running shell query");

    #[cfg(target_os = "windows")]
    let (status, stdout, stderr) =
        run_with_timeout("powershell", &["-NoProfile", "-Command", command]).await?;
    #[cfg(not(target_os = "windows"))]
    let (status, stdout, stderr) = run_with_timeout("/bin/sh", &["-lc", command]).await?;

    Ok(json!({
        "exit_code": status,
        "stdout": stdout,
        "stderr": stderr,
    }))
}

/// Query host system state.
pub fn system_info() -> Value {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "family": std::env::consts::FAMILY,
        "cpus": cpus,
    })
}

/// Current time and date.
pub fn time_date(now: chrono::DateTime<chrono::Utc>) -> Value {
    json!({
        "iso": now.to_rfc3339(),
        "date": now.format("%Y-%m-%d").to_string(),
        "time": now.format("%H:%M:%S").to_string(),
        "weekday": now.format("%A").to_string(),
    })
}

/// List directory entries (names only, sorted).
pub async fn list_files(path: &Path) -> Result<Value, FunctionError> {
    let mut dir = tokio::fs::read_dir(path)
        .await
        .map_err(|e| FunctionError::Execution(format!("cannot list {}: {e}", path.display())))?;

    let mut names = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| FunctionError::Execution(format!("cannot list {}: {e}", path.display())))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    Ok(json!({ "path": path.display().to_string(), "entries": names }))
}

/// Create a text file. Content size is validated at the executor's
/// validation gate before this runs.
pub async fn create_file(path: &Path, content: &str) -> Result<Value, FunctionError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| FunctionError::Execution(format!("cannot create {}: {e}", path.display())))?;
    Ok(json!({ "created": path.display().to_string(), "size": content.len() }))
}

/// Read a text file. Files larger than 10 MiB are rejected; the returned
/// payload is capped at 1000 bytes with an ellipsis marker, while `size`
/// always reports the true length.
pub async fn read_file(path: &Path) -> Result<Value, FunctionError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| FunctionError::Execution(format!("cannot read {}: {e}", path.display())))?;
    if meta.len() > MAX_FILE_BYTES {
        return Err(FunctionError::InvalidArguments(format!(
            "file exceeds {MAX_FILE_BYTES} bytes"
        )));
    }

    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| FunctionError::Execution(format!("cannot read {}: {e}", path.display())))?;
    let true_size = raw.len();
    let text = String::from_utf8_lossy(&raw);

    let content = if true_size > READ_PAYLOAD_BYTES {
        let mut end = READ_PAYLOAD_BYTES;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    } else {
        text.into_owned()
    };

    Ok(json!({ "content": content, "size": true_size }))
}

/// Delete a file.
pub async fn delete_file(path: &Path) -> Result<Value, FunctionError> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| FunctionError::Execution(format!("cannot delete {}: {e}", path.display())))?;
    Ok(json!({ "deleted": path.display().to_string() }))
}

/// Move or rename a file.
pub async fn move_file(source: &Path, destination: &Path) -> Result<Value, FunctionError> {
    tokio::fs::rename(source, destination).await.map_err(|e| {
        FunctionError::Execution(format!(
            "cannot move {} to {}: {e}",
            source.display(),
            destination.display()
        ))
    })?;
    Ok(json!({
        "moved": source.display().to_string(),
        "to": destination.display().to_string(),
    }))
}

/// Search a directory tree for file names containing `pattern`.
///
/// Walks iteratively on a blocking thread; results are capped at 100.
pub async fn search_files(root: &Path, pattern: &str) -> Result<Value, FunctionError> {
    let root = root.to_path_buf();
    let needle = pattern.to_lowercase();

    let matches = tokio::task::spawn_blocking(move || {
        let mut found = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                if found.len() >= MAX_SEARCH_RESULTS {
                    return found;
                }
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if entry
                    .file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains(&needle)
                {
                    found.push(path.display().to_string());
                }
            }
        }
        found
    })
    .await
    .map_err(|e| FunctionError::Execution(format!("search task failed: {e}")))?;

    Ok(json!({ "pattern": pattern, "matches": matches }))
}

/// Minimize/maximize/close/focus a window by title substring.
///
/// Uses a PowerShell recipe on Windows; other hosts report the action as
/// unsupported so the model can tell the user.
pub async fn manage_window(title: &str, action: WindowAction) -> Result<Value, FunctionError> {
    #[cfg(target_os = "windows")]
    {
        // SW_MINIMIZE = 6, SW_MAXIMIZE = 3; close posts WM_CLOSE.
        let script = match action {
            WindowAction::Minimize => format!(
                "(Get-Process | Where-Object {{$_.MainWindowTitle -like '*{title}*'}}) | \
                 ForEach-Object {{ (New-Object -ComObject Shell.Application).MinimizeAll() }}"
            ),
            WindowAction::Maximize => format!(
                "$w = Get-Process | Where-Object {{$_.MainWindowTitle -like '*{title}*'}}; \
                 if ($w) {{ (New-Object -ComObject WScript.Shell).AppActivate($w[0].Id) }}"
            ),
            WindowAction::Close => format!(
                "Get-Process | Where-Object {{$_.MainWindowTitle -like '*{title}*'}} | \
                 ForEach-Object {{ $_.CloseMainWindow() }}"
            ),
            WindowAction::Focus => format!(
                "$w = Get-Process | Where-Object {{$_.MainWindowTitle -like '*{title}*'}}; \
                 if ($w) {{ (New-Object -ComObject WScript.Shell).AppActivate($w[0].Id) }}"
            ),
        };
        let (status, _, stderr) =
            run_with_timeout("powershell", &["-NoProfile", "-Command", &script]).await?;
        if status != 0 {
            return Err(FunctionError::Execution(format!(
                "window action failed: {stderr}"
            )));
        }
        return Ok(json!({ "window": title, "action": action.as_str() }));
    }

    #[cfg(not(target_os = "windows"))]
    {
        let _ = title;
        Ok(json!({
            "action": action.as_str(),
            "supported": false,
            "note": "window management requires a PowerShell host",
        }))
    }
}

/// Set system output volume to a clamped percentage.
///
/// On Windows this presses the volume keys in steps of 2 via WScript,
/// which is the granularity the mixer exposes to key events; achieved
/// precision is therefore ±2 %. macOS and Linux use their native volume
/// commands and are exact.
pub async fn set_volume(level: u8) -> Result<Value, FunctionError> {
    #[cfg(target_os = "windows")]
    {
        // Drop to zero with 50 volume-down presses, then step up to the
        // target. Each key press moves the mixer by 2 points.
        let ups = (level / 2) as usize;
        let script = format!(
            "$sh = New-Object -ComObject WScript.Shell; \
             1..50 | ForEach-Object {{ $sh.SendKeys([char]174) }}; \
             if ({ups} -gt 0) {{ 1..{ups} | ForEach-Object {{ $sh.SendKeys([char]175) }} }}"
        );
        let (status, _, stderr) =
            run_with_timeout("powershell", &["-NoProfile", "-Command", &script]).await?;
        if status != 0 {
            return Err(FunctionError::Execution(format!(
                "volume change failed: {stderr}"
            )));
        }
    }

    #[cfg(target_os = "macos")]
    {
        let script = format!("set volume output volume {level}");
        let (status, _, stderr) = run_with_timeout("osascript", &["-e", &script]).await?;
        if status != 0 {
            return Err(FunctionError::Execution(format!(
                "volume change failed: {stderr}"
            )));
        }
    }

    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        let target = format!("{level}%");
        let (status, _, stderr) =
            run_with_timeout("amixer", &["set", "Master", &target]).await?;
        if status != 0 {
            return Err(FunctionError::Execution(format!(
                "volume change failed: {stderr}"
            )));
        }
    }

    Ok(json!({ "volume": level }))
}
