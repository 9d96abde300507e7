//! Host-side client for the in-container resource service

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use pycell_spec::ToolServerParams;
use serde_json::json;

use crate::archive::{pack_dir, unpack_archive};
use crate::error::{ResourceError, Result};

/// Options controlling connection gating and retry behavior
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Probes of `/status` before the connection is declared failed
    pub connect_retries: u32,
    /// Delay between connection probes
    pub connect_retry_interval: Duration,
    /// Attempts for idempotent requests (GET, DELETE)
    pub request_retries: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_retries: 10,
            connect_retry_interval: Duration::from_secs(1),
            request_retries: 3,
        }
    }
}

/// Typed client for the resource port of a sandbox container.
///
/// Stateless per call. Idempotent operations are retried with bounded
/// exponential backoff on transport failures; uploads and generation fail
/// fast.
#[derive(Debug)]
pub struct ResourceClient {
    http: reqwest::Client,
    base_url: String,
    request_retries: u32,
}

impl ResourceClient {
    /// Connect to the resource server on `host:port` with default options
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with(host, port, ConnectOptions::default()).await
    }

    /// Connect with explicit options. Gates on `GET /status` with bounded
    /// retries, since the container may still be starting up.
    pub async fn connect_with(host: &str, port: u16, options: ConnectOptions) -> Result<Self> {
        let base_url = format!("http://{host}:{port}");
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ResourceError::Connect {
                url: base_url.clone(),
                reason: e.to_string(),
            })?;

        let client = Self {
            http,
            base_url,
            request_retries: options.request_retries.max(1),
        };

        let mut last_reason = String::new();
        for attempt in 0..options.connect_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(options.connect_retry_interval).await;
            }
            match client
                .http
                .get(client.url("status"))
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(client),
                Ok(response) => last_reason = format!("status returned {}", response.status()),
                Err(e) => last_reason = e.to_string(),
            }
        }

        Err(ResourceError::Connect {
            url: client.base_url,
            reason: last_reason,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Write bytes to a file in the container; parents are created and an
    /// existing file is overwritten
    pub async fn write_file(&self, container_path: &str, data: impl Into<Bytes>) -> Result<()> {
        let response = self
            .http
            .put(self.url(&format!("files/{container_path}")))
            .body(data.into())
            .send()
            .await
            .map_err(|e| ResourceError::Request {
                op: "upload file",
                reason: e.to_string(),
            })?;
        check_status("upload file", response).await?;
        Ok(())
    }

    /// Upload a local file to the container
    pub async fn upload_file(&self, container_path: &str, local_path: &Path) -> Result<()> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| ResourceError::Io {
                path: local_path.to_path_buf(),
                source: e,
            })?;
        self.write_file(container_path, data).await
    }

    /// Read a container file into memory
    pub async fn read_file(&self, container_path: &str) -> Result<Bytes> {
        let url = self.url(&format!("files/{container_path}"));
        self.with_retries("download file", || async {
            let response = self.http.get(&url).send().await.map_err(|e| {
                ResourceError::Request {
                    op: "download file",
                    reason: e.to_string(),
                }
            })?;
            let response = check_status_with(
                "download file",
                response,
                |status| match status {
                    404 => Some(ResourceError::NotFound {
                        what: url.clone(),
                    }),
                    _ => None,
                },
            )
            .await?;
            response.bytes().await.map_err(|e| ResourceError::Request {
                op: "download file",
                reason: e.to_string(),
            })
        })
        .await
    }

    /// Download a container file to a local path
    pub async fn download_file(&self, container_path: &str, local_path: &Path) -> Result<()> {
        let data = self.read_file(container_path).await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ResourceError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        tokio::fs::write(local_path, &data)
            .await
            .map_err(|e| ResourceError::Io {
                path: local_path.to_path_buf(),
                source: e,
            })
    }

    /// Upload a local directory as a tar archive; the container target is
    /// replaced atomically
    pub async fn upload_dir(&self, container_path: &str, local_dir: &Path) -> Result<()> {
        let data = pack_dir(local_dir).await?;
        let response = self
            .http
            .put(self.url(&format!("dirs/{container_path}")))
            .body(data)
            .send()
            .await
            .map_err(|e| ResourceError::Request {
                op: "upload directory",
                reason: e.to_string(),
            })?;
        check_status("upload directory", response).await?;
        Ok(())
    }

    /// Download a container directory into a local directory
    pub async fn download_dir(&self, container_path: &str, local_dir: &Path) -> Result<()> {
        let url = self.url(&format!("dirs/{container_path}"));
        let data = self
            .with_retries("download directory", || async {
                let response = self.http.get(&url).send().await.map_err(|e| {
                    ResourceError::Request {
                        op: "download directory",
                        reason: e.to_string(),
                    }
                })?;
                let response = check_status_with(
                    "download directory",
                    response,
                    |status| match status {
                        404 => Some(ResourceError::NotFound {
                            what: url.clone(),
                        }),
                        _ => None,
                    },
                )
                .await?;
                response.bytes().await.map_err(|e| ResourceError::Request {
                    op: "download directory",
                    reason: e.to_string(),
                })
            })
            .await?;

        tokio::fs::create_dir_all(local_dir)
            .await
            .map_err(|e| ResourceError::Io {
                path: local_dir.to_path_buf(),
                source: e,
            })?;
        unpack_archive(data.to_vec(), local_dir).await?;
        Ok(())
    }

    /// Server-side copy; the destination is overwritten
    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url("copy"))
            .json(&json!({"src": src, "dst": dst}))
            .send()
            .await
            .map_err(|e| ResourceError::Request {
                op: "copy",
                reason: e.to_string(),
            })?;
        check_status_with("copy", response, |status| match status {
            404 => Some(ResourceError::NotFound {
                what: src.to_string(),
            }),
            _ => None,
        })
        .await?;
        Ok(())
    }

    /// Delete a container file or directory; deleting a missing path
    /// succeeds
    pub async fn delete(&self, container_path: &str) -> Result<()> {
        let url = self.url(&format!("files/{container_path}"));
        self.with_retries("delete", || async {
            let response =
                self.http
                    .delete(&url)
                    .send()
                    .await
                    .map_err(|e| ResourceError::Request {
                        op: "delete",
                        reason: e.to_string(),
                    })?;
            check_status("delete", response).await?;
            Ok(())
        })
        .await
    }

    /// Source code of importable Python modules, keyed by module name
    pub async fn module_sources(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        let url = self.url("modules");
        let query: Vec<(&str, &str)> = names.iter().map(|name| ("q", *name)).collect();
        self.with_retries("module sources", || async {
            let response = self
                .http
                .get(&url)
                .query(&query)
                .send()
                .await
                .map_err(|e| ResourceError::Request {
                    op: "module sources",
                    reason: e.to_string(),
                })?;
            let response = check_status_with(
                "module sources",
                response,
                |status| match status {
                    404 => Some(ResourceError::NotFound {
                        what: format!("one of modules {names:?}"),
                    }),
                    422 => Some(ResourceError::NotPurePython {
                        module: format!("{names:?}"),
                    }),
                    _ => None,
                },
            )
            .await?;
            response
                .json::<HashMap<String, String>>()
                .await
                .map_err(|e| ResourceError::Request {
                    op: "module sources",
                    reason: e.to_string(),
                })
        })
        .await
    }

    /// Generate tool-client modules for a tool server inside the container.
    ///
    /// Returns the sanitized tool names; re-generation for the same server
    /// name overwrites atomically.
    pub async fn generate_tool_clients(
        &self,
        server_name: &str,
        server_params: &ToolServerParams,
    ) -> Result<Vec<String>> {
        let response = self
            .http
            .post(self.url("tools"))
            .json(&json!({
                "server_name": server_name,
                "server_params": server_params,
            }))
            .send()
            .await
            .map_err(|e| ResourceError::Request {
                op: "generate tool clients",
                reason: e.to_string(),
            })?;
        let response = check_status("generate tool clients", response).await?;
        response
            .json::<Vec<String>>()
            .await
            .map_err(|e| ResourceError::Request {
                op: "generate tool clients",
                reason: e.to_string(),
            })
    }

    /// Fetch previously generated tool-client modules into a local
    /// directory
    pub async fn fetch_tool_clients(&self, server_name: &str, local_dir: &Path) -> Result<()> {
        let url = self.url(&format!("tools/{server_name}"));
        let data = self
            .with_retries("fetch tool clients", || async {
                let response =
                    self.http
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| ResourceError::Request {
                            op: "fetch tool clients",
                            reason: e.to_string(),
                        })?;
                let response = check_status_with(
                    "fetch tool clients",
                    response,
                    |status| match status {
                        404 => Some(ResourceError::NotFound {
                            what: format!("tool clients for server {server_name:?}"),
                        }),
                        _ => None,
                    },
                )
                .await?;
                response.bytes().await.map_err(|e| ResourceError::Request {
                    op: "fetch tool clients",
                    reason: e.to_string(),
                })
            })
            .await?;

        tokio::fs::create_dir_all(local_dir)
            .await
            .map_err(|e| ResourceError::Io {
                path: local_dir.to_path_buf(),
                source: e,
            })?;
        unpack_archive(data.to_vec(), local_dir).await?;
        Ok(())
    }

    /// Retry an idempotent request on transport failures with bounded
    /// exponential backoff
    async fn with_retries<T, F, Fut>(&self, op: &'static str, request: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = Duration::from_millis(250);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match request().await {
                Ok(value) => return Ok(value),
                Err(e @ ResourceError::Request { .. }) if attempt < self.request_retries => {
                    tracing::debug!(op = op, attempt = attempt, error = %e, "retrying request");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Map a non-success response to an error
async fn check_status(
    op: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    check_status_with(op, response, |_| None).await
}

/// Like [`check_status`] but with an operation-specific mapping for
/// well-known statuses
async fn check_status_with(
    op: &'static str,
    response: reqwest::Response,
    map: impl Fn(u16) -> Option<ResourceError>,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if let Some(error) = map(status.as_u16()) {
        return Err(error);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ResourceError::Http {
        op,
        status: status.as_u16(),
        message,
    })
}
