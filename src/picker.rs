use std::io::ErrorKind;

use tokio::process::Command;
use tracing::{info, warn};

/// Opens the platform folder dialog. `None` when the user cancels or no
/// dialog tool is available.
pub async fn pick_directory() -> Option<String> {
    let (program, args) = dialog_command();

    let output = match Command::new(program).args(args).output().await {
        Ok(output) => output,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            warn!("{program} is not available; directory picker disabled");
            return None;
        }
        Err(error) => {
            warn!("Could not open the directory picker: {error}");
            return None;
        }
    };

    if !output.status.success() {
        info!("Directory selection cancelled");
        return None;
    }

    parse_dialog_output(&output.stdout)
}

#[cfg(target_os = "macos")]
fn dialog_command() -> (&'static str, Vec<&'static str>) {
    (
        "osascript",
        vec!["-e", "POSIX path of (choose folder with prompt \"Select download folder\")"],
    )
}

#[cfg(target_os = "windows")]
fn dialog_command() -> (&'static str, Vec<&'static str>) {
    (
        "powershell",
        vec![
            "-NoProfile",
            "-Command",
            "Add-Type -AssemblyName System.Windows.Forms; $d = New-Object System.Windows.Forms.FolderBrowserDialog; if ($d.ShowDialog() -eq 'OK') { $d.SelectedPath } else { exit 1 }",
        ],
    )
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn dialog_command() -> (&'static str, Vec<&'static str>) {
    (
        "zenity",
        vec![
            "--file-selection",
            "--directory",
            "--title=Select download folder",
        ],
    )
}

fn parse_dialog_output(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(ToString::to_string)
}
