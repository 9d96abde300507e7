//! Image pull with surfaced progress

use bollard::models::CreateImageInfo;
use bollard::query_parameters::CreateImageOptions;
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use pycell_spec::PullPolicy;

use crate::error::{ContainerError, Result};

/// One layer/status record emitted while an image is pulled.
///
/// Absence of progress records is not an error; small images may complete
/// in a handful of status lines.
#[derive(Debug, Clone)]
pub struct PullProgress {
    /// Layer identifier, when the record refers to a layer
    pub layer: Option<String>,
    /// Status line, e.g. `Downloading` or `Pull complete`
    pub status: Option<String>,
    /// Human-readable progress detail, e.g. a byte counter
    pub detail: Option<String>,
}

impl From<CreateImageInfo> for PullProgress {
    fn from(info: CreateImageInfo) -> Self {
        Self {
            layer: info.id,
            status: info.status,
            detail: info.progress,
        }
    }
}

/// Parse an image reference into name and tag
fn parse_image_ref(image: &str) -> (&str, &str) {
    // Digest references (image@sha256:...) are passed through whole
    if image.contains('@') {
        return (image, "");
    }

    if let Some((name, tag)) = image.rsplit_once(':') {
        // A '/' after the ':' means the colon belongs to a registry port
        // (e.g. localhost:5000/image), not a tag
        if !tag.contains('/') {
            return (name, tag);
        }
    }

    (image, "latest")
}

/// Pull `image`, yielding progress records as the daemon reports them
pub(crate) fn pull_events<'a>(
    docker: &'a Docker,
    image: &str,
) -> impl Stream<Item = Result<PullProgress>> + 'a {
    let image = image.to_string();
    let (name, tag) = parse_image_ref(&image);

    let options = CreateImageOptions {
        from_image: Some(name.to_string()),
        tag: if tag.is_empty() {
            None
        } else {
            Some(tag.to_string())
        },
        ..Default::default()
    };

    docker
        .create_image(Some(options), None, None)
        .map(move |result| match result {
            Ok(info) => Ok(PullProgress::from(info)),
            Err(e) => Err(ContainerError::PullFailed {
                image: image.clone(),
                reason: e.to_string(),
            }),
        })
}

/// Ensure `image` is present locally according to `policy`, draining pull
/// progress into the log
pub(crate) async fn ensure_image(docker: &Docker, image: &str, policy: PullPolicy) -> Result<()> {
    let present = docker.inspect_image(image).await.is_ok();

    match policy {
        PullPolicy::Never => {
            if present {
                Ok(())
            } else {
                Err(ContainerError::ImageMissing {
                    image: image.to_string(),
                })
            }
        }
        PullPolicy::IfNotPresent if present => {
            tracing::debug!(image = %image, "image already present, skipping pull");
            Ok(())
        }
        _ => {
            tracing::info!(image = %image, "pulling image");
            let mut stream = std::pin::pin!(pull_events(docker, image));
            while let Some(progress) = stream.next().await {
                let progress = progress?;
                if let Some(status) = &progress.status {
                    tracing::debug!(
                        layer = progress.layer.as_deref().unwrap_or(""),
                        status = %status,
                        "pull progress"
                    );
                }
            }
            tracing::info!(image = %image, "image pulled");
            Ok(())
        }
    }
}
