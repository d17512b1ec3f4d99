use crate::types::{OsInfo, Platform};
use std::env;

pub fn detect() -> OsInfo {
    let platform = match env::consts::OS {
        "windows" => Platform::Windows,
        "macos" => Platform::Macos,
        _ => Platform::Linux,
    };
    OsInfo {
        platform,
        arch: env::consts::ARCH.to_string(),
        shell: detect_shell(platform),
    }
}

fn detect_shell(platform: Platform) -> String {
    if platform == Platform::Windows {
        if env::var_os("PSModulePath").is_some() && env::var_os("PROMPT").is_none() {
            return "powershell".to_string();
        }
        return env::var("ComSpec")
            .ok()
            .and_then(|p| shell_name(&p))
            .unwrap_or_else(|| "cmd".to_string());
    }

    env::var("SHELL")
        .ok()
        .and_then(|p| shell_name(&p))
        .unwrap_or_else(|| "sh".to_string())
}

fn shell_name(path: &str) -> Option<String> {
    let base = path.rsplit(['/', '\\']).next()?.trim();
    let base = base.strip_suffix(".exe").unwrap_or(base);
    if base.is_empty() {
        None
    } else {
        Some(base.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_name_strips_path_and_extension() {
        assert_eq!(shell_name("/usr/bin/zsh").as_deref(), Some("zsh"));
        assert_eq!(
            shell_name("C:\\Windows\\System32\\cmd.exe").as_deref(),
            Some("cmd")
        );
        assert_eq!(shell_name(""), None);
    }

    #[test]
    fn test_detect_reports_compile_target_arch() {
        let info = detect();
        assert_eq!(info.arch, env::consts::ARCH);
        assert!(!info.shell.is_empty());
    }
}
