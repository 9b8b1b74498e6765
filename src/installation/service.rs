// Boot unit and post-apply service restarts

use anyhow::{Context, Result};
use log::{info, warn};
use std::path::Path;
use tokio::time::Duration;

use crate::installation::run_cmd_with_timeout;

pub const UNIT_NAME: &str = "setup-tool.service";

const RESTART_TIMEOUT: Duration = Duration::from_secs(90);

/// Build the systemd unit that runs the wizard on the console until the
/// completion marker exists.
///
/// This is a pure function for testability on any OS.
pub fn build_systemd_unit_text(exec_path: &Path, marker: &Path) -> String {
    let exec_quoted = quote_systemd_path(&exec_path.to_string_lossy());

    format!(
        r#"[Unit]
Description=First-boot setup wizard
ConditionPathExists=!{marker}
After=network-online.target systemd-user-sessions.service
Wants=network-online.target
Before=getty@tty1.service

[Service]
Type=oneshot
ExecStart={exec_quoted}
StandardInput=tty
StandardOutput=tty
StandardError=journal
TTYPath=/dev/tty1
TTYReset=yes
TTYVHangup=yes

[Install]
WantedBy=multi-user.target
"#,
        marker = marker.display(),
        exec_quoted = exec_quoted,
    )
}

/// Quote a path for systemd unit files if it contains spaces or special characters.
fn quote_systemd_path(path: &str) -> String {
    if path.contains(' ') || path.contains('\t') || path.contains('"') {
        format!("\"{}\"", path.replace('"', "\\\""))
    } else {
        path.to_string()
    }
}

/// `systemctl restart <unit>`; callers treat failure as a warning.
pub async fn restart_unit(unit: &str) -> Result<()> {
    let args = vec!["restart".to_string(), unit.to_string()];
    let out = run_cmd_with_timeout("systemctl", &args, RESTART_TIMEOUT, "systemctl_restart")
        .await
        .with_context(|| format!("Failed to run systemctl restart {}", unit))?;
    if out.exit_code != Some(0) {
        warn!(
            "[PHASE: apply] [STEP: restart] systemctl restart {} failed (exit_code={:?}): {}",
            unit,
            out.exit_code,
            out.stderr.trim()
        );
        anyhow::bail!("systemctl restart {} exited with {:?}", unit, out.exit_code);
    }
    info!("[PHASE: apply] [STEP: restart] restarted {}", unit);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_is_gated_on_marker() {
        let text = build_systemd_unit_text(
            Path::new("/run/current-system/sw/bin/setup-tool"),
            Path::new("/var/lib/setup-tool/.configured"),
        );
        assert!(text.contains("ConditionPathExists=!/var/lib/setup-tool/.configured\n"));
        assert!(text.contains("ExecStart=/run/current-system/sw/bin/setup-tool\n"));
        assert!(text.contains("Type=oneshot"));
        assert!(text.contains("StandardInput=tty"));
    }

    #[test]
    fn exec_path_with_spaces_is_quoted() {
        let text = build_systemd_unit_text(
            Path::new("/opt/setup tool/bin/setup-tool"),
            Path::new("/var/lib/setup-tool/.configured"),
        );
        assert!(text.contains("ExecStart=\"/opt/setup tool/bin/setup-tool\""));
    }
}
