use std::path::PathBuf;
use std::process::{Command, Stdio};

use click_core::{app_id, IoResultExt, Result};
use tracing::{debug, warn};

/// Liveness oracle and stopper for installed applications.
pub trait AppSupervisor: Send + Sync {
    fn is_running(&self, package: &str, app_name: &str, version: &str) -> Result<bool>;

    fn stop(&self, package: &str, app_name: &str, version: &str) -> Result<()>;
}

const PID_TOOLS: [&str; 2] = ["ubuntu-app-pid", "upstart-app-pid"];
const STOP_TOOLS: [&str; 2] = ["ubuntu-app-stop", "upstart-app-stop"];

/// Asks the session's app launcher helpers. When no helper is installed,
/// nothing is considered running.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    fn find_tool(candidates: &[&str]) -> Option<PathBuf> {
        candidates.iter().find_map(|name| which::which(name).ok())
    }
}

impl AppSupervisor for ProcessSupervisor {
    fn is_running(&self, package: &str, app_name: &str, version: &str) -> Result<bool> {
        let Some(tool) = Self::find_tool(&PID_TOOLS) else {
            debug!("no app pid helper available");
            return Ok(false);
        };
        let id = app_id(package, version, app_name)?;
        let status = Command::new(&tool)
            .arg(&id)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .at_path(&tool)?;
        Ok(status.success())
    }

    fn stop(&self, package: &str, app_name: &str, version: &str) -> Result<()> {
        let Some(tool) = Self::find_tool(&STOP_TOOLS) else {
            return Ok(());
        };
        let id = app_id(package, version, app_name)?;
        let status = Command::new(&tool).arg(&id).status().at_path(&tool)?;
        if !status.success() {
            warn!(app_id = %id, %status, "failed to stop app");
        }
        Ok(())
    }
}

/// Never reports anything running.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleSupervisor;

impl AppSupervisor for IdleSupervisor {
    fn is_running(&self, _package: &str, _app_name: &str, _version: &str) -> Result<bool> {
        Ok(false)
    }

    fn stop(&self, _package: &str, _app_name: &str, _version: &str) -> Result<()> {
        Ok(())
    }
}
