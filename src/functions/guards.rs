//! Per-function safety checks applied after schema validation.
//!
//! Paths must land inside an allowed base directory, URLs must point at
//! public http(s) hosts, shell commands must start with a read-only verb
//! and avoid destructive patterns, applications resolve through a
//! whitelist, and numeric arguments are clamped.

use super::FunctionError;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use url::{Host, Url};

/// Maximum accepted shell command length.
const MAX_COMMAND_LEN: usize = 500;

/// Maximum file size accepted for read/create.
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Substrings that mark a command as destructive regardless of its verb.
const DENIED_COMMAND_PATTERNS: &[&str] = &[
    // Recursive / forced deletion.
    "rm -rf",
    "rm -r",
    "remove-item -recurse",
    "remove-item -force",
    "rd /s",
    "del /f",
    "del /s",
    "del /q",
    // Disk and filesystem destruction.
    "format ",
    "format-volume",
    "mkfs",
    "diskpart",
    "clear-disk",
    // Registry mutation.
    "reg add",
    "reg delete",
    "regedit",
    "set-itemproperty",
    "new-itemproperty",
    // User / group / ownership changes.
    "net user",
    "net localgroup",
    "takeown",
    "icacls",
    // Power and system state.
    "shutdown",
    "restart-computer",
    "stop-computer",
    "bcdedit",
    "sfc /scannow",
    "cipher /w",
    "attrib +",
    "attrib -",
    // Deletion smuggled through pipelines, substitution, or backticks.
    "| del",
    "|del",
    "| remove-item",
    "|remove-item",
    "; del",
    ";del",
    "; remove-item",
    "$(",
    "`d",
    "`r",
    "invoke-expression",
    "iex ",
];

/// Read-only verbs a command must start with to be accepted.
const ALLOWED_COMMAND_PREFIXES: &[&str] = &[
    "get-",
    "dir",
    "ls",
    "echo",
    "write-output",
    "select-",
    "where-object",
    "measure-object",
    "sort-object",
    "format-",
    "out-string",
    "test-path",
    "get-content",
    "get-childitem",
    "get-process",
    "get-service",
    "get-date",
    "get-location",
    "[datetime]",
    "[math]",
];

/// Window actions accepted by `manage_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    Minimize,
    Maximize,
    Close,
    Focus,
}

impl WindowAction {
    /// Parse an action string; anything outside the closed set is invalid.
    pub fn parse(raw: &str) -> Result<Self, FunctionError> {
        match raw {
            "minimize" => Ok(Self::Minimize),
            "maximize" => Ok(Self::Maximize),
            "close" => Ok(Self::Close),
            "focus" => Ok(Self::Focus),
            other => Err(FunctionError::InvalidArguments(format!(
                "unknown window action '{other}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
            Self::Close => "close",
            Self::Focus => "focus",
        }
    }
}

/// Base directories a path argument may resolve into.
pub fn allowed_bases() -> Vec<PathBuf> {
    let mut bases = Vec::with_capacity(3);
    if let Some(home) = dirs::home_dir() {
        bases.push(home);
    }
    bases.push(std::env::temp_dir());
    if let Ok(cwd) = std::env::current_dir() {
        bases.push(cwd);
    }
    bases
}

/// Lexically normalize a path: resolve `.` and `..` without touching the
/// filesystem, so nonexistent targets (e.g. files about to be created)
/// still validate.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Validate a path argument against the allowed base set.
///
/// Relative inputs are resolved against the current working directory.
/// After `..` normalization the result must be prefixed by one of the
/// bases; anything else fails with [`FunctionError::PathDenied`].
pub fn validate_path(raw: &str, bases: &[PathBuf]) -> Result<PathBuf, FunctionError> {
    if raw.trim().is_empty() {
        return Err(FunctionError::InvalidArguments("path is empty".into()));
    }

    let candidate = Path::new(raw);
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| FunctionError::Execution(format!("cannot resolve cwd: {e}")))?;
        cwd.join(candidate)
    };

    let resolved = normalize(&absolute);
    let permitted = bases.iter().any(|base| {
        let base = normalize(base);
        resolved.starts_with(&base)
    });

    if !permitted {
        return Err(FunctionError::PathDenied(raw.to_owned()));
    }
    Ok(resolved)
}

/// Validate a URL argument: http(s) only, public hosts only.
pub fn validate_url(raw: &str) -> Result<Url, FunctionError> {
    let url =
        Url::parse(raw).map_err(|e| FunctionError::UrlDenied(format!("{raw}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(FunctionError::UrlDenied(format!(
                "{raw}: scheme '{other}' is not allowed"
            )));
        }
    }

    match url.host() {
        Some(Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return Err(FunctionError::UrlDenied(format!("{raw}: loopback host")));
            }
        }
        Some(Host::Ipv4(ip)) => {
            if ip.is_loopback() || ip.is_unspecified() || ip.is_private() {
                return Err(FunctionError::UrlDenied(format!(
                    "{raw}: non-public address {ip}"
                )));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if ip.is_loopback() || ip.is_unspecified() {
                return Err(FunctionError::UrlDenied(format!(
                    "{raw}: non-public address {ip}"
                )));
            }
        }
        None => {
            return Err(FunctionError::UrlDenied(format!("{raw}: missing host")));
        }
    }

    // Hosts like "127.0.0.1:8080" parse as Ipv4 above; a literal in a
    // domain position (rare resolver tricks) is caught here.
    if let Some(host) = url.host_str()
        && let Ok(ip) = host.parse::<IpAddr>()
        && match ip {
            IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified() || v4.is_private(),
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        }
    {
        return Err(FunctionError::UrlDenied(format!(
            "{raw}: non-public address {ip}"
        )));
    }

    Ok(url)
}

/// Validate a shell command: bounded length, no destructive patterns,
/// read-only verb prefix required.
pub fn validate_command(raw: &str) -> Result<String, FunctionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(FunctionError::InvalidArguments("command is empty".into()));
    }
    if trimmed.len() > MAX_COMMAND_LEN {
        return Err(FunctionError::CommandDenied(format!(
            "command exceeds {MAX_COMMAND_LEN} characters"
        )));
    }

    let lower = trimmed.to_lowercase();
    for pattern in DENIED_COMMAND_PATTERNS {
        if lower.contains(pattern) {
            return Err(FunctionError::CommandDenied(format!(
                "command matches denied pattern '{pattern}'"
            )));
        }
    }

    if !ALLOWED_COMMAND_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
    {
        return Err(FunctionError::CommandDenied(
            "command must start with a read-only verb".into(),
        ));
    }

    Ok(trimmed.to_owned())
}

/// Resolve an application short name through the launch whitelist.
pub fn resolve_application(name: &str) -> Result<&'static str, FunctionError> {
    match name.trim().to_lowercase().as_str() {
        "chrome" => Ok("chrome.exe"),
        "vscode" | "code" => Ok("code.cmd"),
        "notepad" => Ok("notepad.exe"),
        "calculator" => Ok("calc.exe"),
        "explorer" => Ok("explorer.exe"),
        "edge" => Ok("msedge.exe"),
        "firefox" => Ok("firefox.exe"),
        other => Err(FunctionError::AppDenied(other.to_owned())),
    }
}

/// Clamp a requested volume level to the valid percentage range.
pub fn clamp_volume(level: i64) -> u8 {
    level.clamp(0, 100) as u8
}

/// Validate inline file content against the size cap.
pub fn validate_content_size(content: &str) -> Result<(), FunctionError> {
    if content.len() as u64 > MAX_FILE_BYTES {
        return Err(FunctionError::InvalidArguments(format!(
            "content exceeds {MAX_FILE_BYTES} bytes"
        )));
    }
    Ok(())
}
