//! Binary self-update: download → verify → swap → restart, with rollback.
//!
//! Only one update may run at a time; the progress snapshot is the single
//! piece of process-global state and is exposed to the status endpoint.
//! The current binary is *removed* before the new one is copied in — writing
//! over a live-executing file fails with "text file busy" on Linux.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{error, info, warn};

const REPO_OWNER: &str = "aihive";
const REPO_NAME: &str = "aihive";
const BIN_NAME: &str = "aihive";
pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const RESTART_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Downloading,
    Verifying,
    Applying,
    Done,
    Failed,
    Rolledback,
}

impl Stage {
    fn is_busy(self) -> bool {
        matches!(self, Stage::Downloading | Stage::Verifying | Stage::Applying)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateStatus {
    pub stage: Stage,
    /// 0–100, meaningful during download.
    pub progress: u8,
    pub message: String,
    pub old_version: String,
    pub new_version: String,
    pub updated_at: i64,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            progress: 0,
            message: String::new(),
            old_version: CURRENT_VERSION.to_string(),
            new_version: String::new(),
            updated_at: 0,
        }
    }
}

static STATUS: Lazy<Mutex<UpdateStatus>> = Lazy::new(|| Mutex::new(UpdateStatus::default()));

/// Current progress snapshot for `/api/update/status`.
pub fn status() -> UpdateStatus {
    STATUS.lock().expect("update status lock").clone()
}

fn set_stage(stage: Stage, progress: u8, message: impl Into<String>) {
    let mut s = STATUS.lock().expect("update status lock");
    s.stage = stage;
    s.progress = progress;
    s.message = message.into();
    s.updated_at = Utc::now().timestamp_millis();
}

/// Claim the update slot. A second apply while one is running is refused —
/// the HTTP layer maps this to 409.
fn try_begin(new_version: &str) -> anyhow::Result<()> {
    let mut s = STATUS.lock().expect("update status lock");
    if s.stage.is_busy() {
        anyhow::bail!("an update is already in progress");
    }
    *s = UpdateStatus {
        stage: Stage::Downloading,
        progress: 0,
        message: "starting download".into(),
        old_version: CURRENT_VERSION.to_string(),
        new_version: new_version.to_string(),
        updated_at: Utc::now().timestamp_millis(),
    };
    Ok(())
}

/// GitHub release asset name for this platform: `aihive-{os}-{arch}[.exe]`.
pub fn asset_name() -> anyhow::Result<String> {
    let os = if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        anyhow::bail!("unsupported platform for self-update");
    };
    let arch = if cfg!(target_arch = "x86_64") {
        "amd64"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        anyhow::bail!("unsupported architecture for self-update");
    };
    let suffix = if cfg!(target_os = "windows") { ".exe" } else { "" };
    Ok(format!("{}-{}-{}{}", BIN_NAME, os, arch, suffix))
}

pub fn release_url(tag: &str) -> anyhow::Result<String> {
    Ok(format!(
        "https://github.com/{}/{}/releases/download/{}/{}",
        REPO_OWNER,
        REPO_NAME,
        tag,
        asset_name()?
    ))
}

/// Query GitHub for the latest release. Returns `Some(tag)` when it is
/// newer than the running version. 10-second budget.
pub async fn check_latest() -> anyhow::Result<Option<String>> {
    let url = format!(
        "https://api.github.com/repos/{}/{}/releases/latest",
        REPO_OWNER, REPO_NAME
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent(BIN_NAME)
        .build()?;
    let resp = client.get(&url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("release check HTTP {}", status.as_u16());
    }
    let body: serde_json::Value = resp.json().await?;
    let tag = body["tag_name"].as_str().unwrap_or("").to_string();
    if tag.is_empty() {
        anyhow::bail!("release response carried no tag_name");
    }
    if version_is_newer(tag.trim_start_matches('v'), CURRENT_VERSION) {
        Ok(Some(tag))
    } else {
        Ok(None)
    }
}

/// Numeric dotted-version comparison; non-numeric segments compare as 0.
fn version_is_newer(candidate: &str, current: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(candidate), parse(current));
    for i in 0..a.len().max(b.len()) {
        let (x, y) = (
            a.get(i).copied().unwrap_or(0),
            b.get(i).copied().unwrap_or(0),
        );
        if x != y {
            return x > y;
        }
    }
    false
}

/// Download, verify, and install the release `tag`, then signal the process
/// to restart under its supervisor. On failure after the binary was
/// replaced, the backup is restored and the status ends `rolledback`; a
/// failed restore ends `failed`.
pub async fn apply(tag: &str) -> anyhow::Result<()> {
    try_begin(tag)?;

    let result = apply_inner(tag).await;
    match &result {
        Ok(()) => {
            set_stage(Stage::Done, 100, "update applied, restarting");
            schedule_restart();
        }
        Err(e) => {
            // apply_inner normally sets failed/rolledback with detail; make
            // sure an early `?` can never leave the slot stuck busy.
            if status().stage.is_busy() {
                set_stage(Stage::Failed, 0, e.to_string());
            }
            error!("update failed: {}", e);
        }
    }
    result
}

async fn apply_inner(tag: &str) -> anyhow::Result<()> {
    let url = release_url(tag).map_err(|e| {
        set_stage(Stage::Failed, 0, e.to_string());
        e
    })?;

    let current = std::env::current_exe()?;
    let tmp_path = current.with_extension("download");

    if let Err(e) = download_with_progress(&url, &tmp_path).await {
        set_stage(Stage::Failed, 0, format!("download failed: {}", e));
        return Err(e);
    }

    set_stage(Stage::Verifying, 100, "verifying downloaded binary");
    if let Err(e) = verify_binary(&tmp_path).await {
        let _ = std::fs::remove_file(&tmp_path);
        set_stage(Stage::Failed, 100, format!("verification failed: {}", e));
        return Err(e);
    }

    set_stage(Stage::Applying, 100, "installing new binary");
    let backup = current.with_file_name(format!(
        "{}.bak",
        current.file_name().unwrap_or_default().to_string_lossy()
    ));
    // A failed backup is not fatal, but it removes the rollback net.
    if let Err(e) = std::fs::copy(&current, &backup) {
        warn!("backup failed (continuing without rollback): {}", e);
    }

    if let Err(e) = swap_binary(&current, &tmp_path) {
        // The old binary may already be gone; restore from backup.
        match std::fs::copy(&backup, &current) {
            Ok(_) => {
                set_stage(
                    Stage::Rolledback,
                    100,
                    format!("install failed, rolled back: {}", e),
                );
            }
            Err(restore_err) => {
                set_stage(
                    Stage::Failed,
                    100,
                    format!("install failed ({}) and rollback failed ({})", e, restore_err),
                );
            }
        }
        return Err(e);
    }

    let _ = std::fs::remove_file(&tmp_path);
    Ok(())
}

async fn download_with_progress(url: &str, dest: &Path) -> anyhow::Result<()> {
    use std::io::Write;

    let resp = reqwest::get(url).await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("download HTTP {}", status.as_u16());
    }
    let total = resp.content_length().unwrap_or(0);

    let mut file = std::fs::File::create(dest)?;
    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)?;
        downloaded += chunk.len() as u64;
        let progress = if total > 0 {
            ((downloaded * 100) / total).min(100) as u8
        } else {
            0
        };
        set_stage(Stage::Downloading, progress, "downloading");
    }
    file.flush()?;
    info!(bytes = downloaded, "downloaded update");
    Ok(())
}

/// Sanity check: the downloaded file must at least answer `--version`.
async fn verify_binary(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    let output = tokio::process::Command::new(path)
        .arg("--version")
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("cannot execute downloaded binary: {}", e))?;
    if !output.status.success() {
        anyhow::bail!(
            "downloaded binary failed --version (exit {:?})",
            output.status.code()
        );
    }
    Ok(())
}

/// Remove the live binary, then copy the new one into place. chmod 0755 so
/// the supervisor can exec it.
fn swap_binary(current: &Path, new_binary: &Path) -> anyhow::Result<()> {
    std::fs::remove_file(current)?;
    std::fs::copy(new_binary, current)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(current, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// SIGTERM ourselves after a short grace so the HTTP response flushes; the
/// service supervisor restarts the process on the new binary.
fn schedule_restart() {
    tokio::spawn(async {
        tokio::time::sleep(RESTART_GRACE).await;
        info!("restarting to apply update");
        #[cfg(unix)]
        unsafe {
            libc::kill(std::process::id() as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        std::process::exit(0);
    });
}
