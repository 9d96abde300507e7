//! In-container egress firewall installation

use pycell_spec::{validate_allow_list, FIREWALL_SCRIPT_PATH};
use tracing::instrument;

use crate::container::SandboxContainer;
use crate::error::{ContainerError, Result};

impl SandboxContainer {
    /// Install egress rules permitting outbound traffic only to the listed
    /// domains, IP addresses and CIDR ranges.
    ///
    /// Runs the privileged firewall script inside the container via sudo.
    /// The container must run as a non-root user; on a root container the
    /// script is not a privilege boundary, so the call fails with
    /// [`ContainerError::UnsupportedMode`]. An empty allow-list blocks all
    /// egress except loopback.
    #[instrument(skip(self, allow_list), fields(container = %self.name(), entries = allow_list.len()))]
    pub async fn install_firewall(&self, allow_list: &[String]) -> Result<()> {
        validate_allow_list(allow_list)?;

        let (code, stdout, _) = self.exec(&["whoami"]).await?;
        if code != 0 {
            return Err(ContainerError::ExecFailed {
                name: self.name().to_string(),
                reason: "could not determine container user".to_string(),
            });
        }
        if stdout.trim() == "root" {
            return Err(ContainerError::UnsupportedMode {
                reason: "container runs as root; the egress firewall requires the non-root image layout"
                    .to_string(),
            });
        }

        let mut cmd: Vec<&str> = vec!["sudo", FIREWALL_SCRIPT_PATH];
        cmd.extend(allow_list.iter().map(String::as_str));

        let (code, stdout, stderr) = self.exec(&cmd).await?;
        if code != 0 {
            return Err(ContainerError::FirewallFailed {
                output: format!("{stdout}{stderr}").trim().to_string(),
            });
        }

        tracing::info!(container = %self.name(), "egress firewall installed");
        Ok(())
    }
}
