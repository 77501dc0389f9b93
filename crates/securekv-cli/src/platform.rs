use std::{env, fs, process::Command};

/// Human-readable platform name and OS version, e.g. `macOS 14.5` or `Linux 6.8.0`.
pub fn platform_version() -> String {
    let version = os_version().unwrap_or_else(|| "unknown".to_string());
    format!("{} {}", os_label(env::consts::OS), version)
}

fn os_label(os: &str) -> &str {
    match os {
        "macos" => "macOS",
        "ios" => "iOS",
        "linux" => "Linux",
        "android" => "Android",
        "windows" => "Windows",
        "freebsd" => "FreeBSD",
        other => other,
    }
}

fn os_version() -> Option<String> {
    let raw = if cfg!(any(target_os = "linux", target_os = "android")) {
        fs::read_to_string("/proc/sys/kernel/osrelease").ok()?
    } else if cfg!(target_os = "macos") {
        command_output("sw_vers", &["-productVersion"])?
    } else if cfg!(target_os = "windows") {
        command_output("cmd", &["/C", "ver"])?
    } else {
        return None;
    };
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}
