//! Validation of sandbox and tool-server specifications
//!
//! All checks here are synchronous configuration checks; they run before any
//! container or network operation and are never retried.

use std::net::IpAddr;
use std::path::Component;

use crate::{
    BindMount, RemoteServerParams, SandboxSpec, SpecError, StdioServerParams, ToolServerParams,
};

impl SandboxSpec {
    /// Validate the whole descriptor
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.image.trim().is_empty() {
            return Err(SpecError::InvalidImage {
                reason: "image reference is empty".to_string(),
            });
        }
        for port in [self.executor_port, self.resource_port].into_iter().flatten() {
            if port == 0 {
                return Err(SpecError::InvalidPort {
                    port: u32::from(port),
                    reason: "fixed host ports must be non-zero".to_string(),
                });
            }
        }
        for bind in &self.binds {
            validate_bind(bind)?;
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(SpecError::InvalidEnv {
                    key: key.clone(),
                    reason: "keys must be non-empty and must not contain '='".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl ToolServerParams {
    /// Validate transport parameters
    pub fn validate(&self) -> Result<(), SpecError> {
        match self {
            ToolServerParams::Stdio(StdioServerParams { command, .. }) => {
                if command.trim().is_empty() {
                    return Err(SpecError::InvalidTransport {
                        reason: "stdio server command is empty".to_string(),
                    });
                }
            }
            ToolServerParams::Remote(RemoteServerParams { url, .. }) => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(SpecError::InvalidTransport {
                        reason: format!("remote server URL must be http(s), got {url:?}"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Validate one bind mount: host path absolute, container path relative and
/// confined to the working directory
pub fn validate_bind(bind: &BindMount) -> Result<(), SpecError> {
    let err = |reason: &str| SpecError::InvalidBind {
        host: bind.host.display().to_string(),
        container: bind.container.clone(),
        reason: reason.to_string(),
    };

    if !bind.host.is_absolute() {
        return Err(err("host path must be absolute"));
    }
    if bind.container.is_empty() {
        return Err(err("container path is empty"));
    }
    let rel = std::path::Path::new(&bind.container);
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(err("container path must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(err("container path must be relative"))
            }
        }
    }
    Ok(())
}

/// Validate an egress allow-list: every entry must be a domain name, an IP
/// address or a CIDR range
pub fn validate_allow_list(entries: &[String]) -> Result<(), SpecError> {
    for entry in entries {
        validate_allow_entry(entry)?;
    }
    Ok(())
}

fn validate_allow_entry(entry: &str) -> Result<(), SpecError> {
    let err = |reason: &str| SpecError::InvalidAllowList {
        entry: entry.to_string(),
        reason: reason.to_string(),
    };

    if entry.is_empty() {
        return Err(err("entry is empty"));
    }
    if entry.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if let Some((addr, prefix)) = entry.split_once('/') {
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| err("CIDR base is not an IP address"))?;
        let bits: u8 = prefix.parse().map_err(|_| err("CIDR prefix is not a number"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(err("CIDR prefix out of range"));
        }
        return Ok(());
    }
    if is_valid_domain(entry) {
        return Ok(());
    }
    Err(err("not a domain name, IP address or CIDR range"))
}

fn is_valid_domain(name: &str) -> bool {
    if name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Validate a tool-server name: it names the generated Python package, so it
/// must be a valid Python identifier
pub fn validate_server_name(name: &str) -> Result<(), SpecError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SpecError::InvalidServerName {
            name: name.to_string(),
        })
    }
}
