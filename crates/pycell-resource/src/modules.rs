//! Python module source resolution
//!
//! The resource server runs next to the sandbox interpreter, so module
//! lookup asks that interpreter directly instead of re-implementing import
//! machinery: `find_spec` locates the module, and only pure-Python origins
//! are readable as source.

use thiserror::Error;

const FIND_SPEC_SNIPPET: &str = r#"
import importlib.util
import sys

name = sys.argv[1]
try:
    spec = importlib.util.find_spec(name)
except (ImportError, ValueError):
    spec = None
if spec is None:
    sys.exit(3)
origin = spec.origin
if origin in (None, "built-in", "frozen") or not origin.endswith(".py"):
    sys.exit(4)
print(origin)
"#;

/// Errors from module source lookup
#[derive(Debug, Error)]
pub enum ModuleError {
    /// No importable module with this name
    #[error("module {name} not found")]
    NotFound { name: String },

    /// The module exists but has no pure-Python source
    #[error("module {name} is not pure Python")]
    NotPurePython { name: String },

    /// The interpreter could not be interrogated
    #[error("module lookup for {name} failed: {reason}")]
    Lookup { name: String, reason: String },
}

/// Resolves importable modules to their source text via a Python
/// interpreter
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    python: String,
}

impl ModuleResolver {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    /// Source text of one importable module
    pub async fn source(&self, name: &str) -> Result<String, ModuleError> {
        if !is_module_name(name) {
            return Err(ModuleError::NotFound {
                name: name.to_string(),
            });
        }

        let output = tokio::process::Command::new(&self.python)
            .arg("-c")
            .arg(FIND_SPEC_SNIPPET)
            .arg(name)
            .output()
            .await
            .map_err(|e| ModuleError::Lookup {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        match output.status.code() {
            Some(0) => {}
            Some(3) => {
                return Err(ModuleError::NotFound {
                    name: name.to_string(),
                })
            }
            Some(4) => {
                return Err(ModuleError::NotPurePython {
                    name: name.to_string(),
                })
            }
            other => {
                return Err(ModuleError::Lookup {
                    name: name.to_string(),
                    reason: format!(
                        "interpreter exited with {other:?}: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                })
            }
        }

        let origin = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tokio::fs::read_to_string(&origin)
            .await
            .map_err(|e| ModuleError::Lookup {
                name: name.to_string(),
                reason: format!("failed to read {origin}: {e}"),
            })
    }
}

/// Dotted-name check applied before anything reaches the interpreter
fn is_module_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    (first.is_ascii_alphabetic() || first == '_')
                        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                None => false,
            }
        })
}
