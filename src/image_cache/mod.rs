//! Image Cache (§4.F) — builds and caches per-(base image, dependency set)
//! derived runtime images, keyed by content hash.

use crate::docker::DockerRuntime;
use crate::error::Result;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::info;

const BOOTSTRAP_LIBRARY: &str = "ling-core-agent-bootstrap";
pub const CACHE_TAG_PREFIX: &str = "function-runner-";

pub struct ImageCache {
    docker: Arc<dyn DockerRuntime>,
    /// Single-flight registry: one build per cache key runs at a time,
    /// concurrent callers wait on the same [`Notify`] (teacher's
    /// `LockManager` shape, generalized from path-globs to cache keys).
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ImageCache {
    pub fn new(docker: Arc<dyn DockerRuntime>) -> Self {
        Self { docker, in_flight: Mutex::new(HashMap::new()) }
    }

    /// Returns the image tag for `(base_image, dependencies)`, building it
    /// on cache miss. Concurrent requests for the same key coalesce onto
    /// the single in-flight build.
    pub async fn get_or_build(&self, base_image: &str, dependencies: &[String]) -> Result<String> {
        let tag = cache_tag(base_image, dependencies);

        loop {
            if self.docker.image_exists(&tag).await? {
                return Ok(tag);
            }

            let notify = {
                let mut in_flight = self.in_flight.lock().unwrap();
                if let Some(existing) = in_flight.get(&tag) {
                    Some(existing.clone())
                } else {
                    in_flight.insert(tag.clone(), Arc::new(Notify::new()));
                    None
                }
            };

            match notify {
                Some(notify) => {
                    // Another caller is already building this key; wait for
                    // it to finish, then loop back to the existence check.
                    notify.notified().await;
                }
                None => {
                    let result = self.build(base_image, dependencies, &tag).await;
                    let notify = {
                        let mut in_flight = self.in_flight.lock().unwrap();
                        in_flight.remove(&tag)
                    };
                    if let Some(notify) = notify {
                        notify.notify_waiters();
                    }
                    result?;
                    return Ok(tag);
                }
            }
        }
    }

    async fn build(&self, base_image: &str, dependencies: &[String], tag: &str) -> Result<()> {
        info!(base_image, tag, "building derived runtime image");
        if !self.docker.image_exists(base_image).await? {
            self.docker.pull_image(base_image).await?;
        }
        let context = build_context_tar(base_image, dependencies)?;
        self.docker.build_image(context, tag).await?;
        Ok(())
    }

    /// Removes every cached tag under [`CACHE_TAG_PREFIX`]. Cache eviction
    /// is otherwise manual (§4.F: "not automatic").
    pub async fn purge_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.docker.remove_images_with_prefix(prefix).await
    }
}

/// `function-runner-<sanitized base>-<md5-12>`, matching the original's
/// tag scheme exactly so `purge_prefix("function-runner-")` is legal.
pub fn cache_tag(base_image: &str, dependencies: &[String]) -> String {
    let mut sorted = dependencies.to_vec();
    sorted.sort();
    let mut hasher = Md5::new();
    hasher.update(base_image.as_bytes());
    for dep in &sorted {
        hasher.update(b"|");
        hasher.update(dep.as_bytes());
    }
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    let short_hash = &hex[..12];
    let sanitized_base = sanitize(base_image);
    format!("{CACHE_TAG_PREFIX}{sanitized_base}-{short_hash}")
}

fn sanitize(base_image: &str) -> String {
    base_image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Builds an in-memory tar archive containing a single-`RUN` `Dockerfile`
/// that installs the bootstrap client library plus the sorted
/// dependencies on top of `base_image` (§4.F).
fn build_context_tar(base_image: &str, dependencies: &[String]) -> Result<Vec<u8>> {
    let mut sorted = dependencies.to_vec();
    sorted.sort();
    let mut packages = vec![BOOTSTRAP_LIBRARY.to_string()];
    packages.extend(sorted);

    let dockerfile = format!(
        "FROM {base_image}\nRUN pip install --no-cache-dir {}\n",
        packages.join(" ")
    );

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_path("Dockerfile").map_err(|e| {
        crate::error::CoreError::ToolError(format!("building image context: {e}"))
    })?;
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, dockerfile.as_bytes())
        .map_err(|e| crate::error::CoreError::ToolError(format!("building image context: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| crate::error::CoreError::ToolError(format!("building image context: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeRuntime;

    #[test]
    fn cache_tag_is_order_independent_and_matches_prefix() {
        let a = cache_tag("python:3.11-slim", &["requests".into(), "pyyaml".into()]);
        let b = cache_tag("python:3.11-slim", &["pyyaml".into(), "requests".into()]);
        assert_eq!(a, b);
        assert!(a.starts_with(CACHE_TAG_PREFIX));
    }

    #[tokio::test]
    async fn get_or_build_builds_once_then_hits_cache() {
        let docker: Arc<dyn DockerRuntime> = Arc::new(FakeRuntime::default());
        let cache = ImageCache::new(docker);
        let deps = vec!["requests".to_string()];
        let tag1 = cache.get_or_build("python:3.11-slim", &deps).await.unwrap();
        let tag2 = cache.get_or_build("python:3.11-slim", &deps).await.unwrap();
        assert_eq!(tag1, tag2);
    }

    #[tokio::test]
    async fn purge_prefix_removes_built_tags() {
        let docker: Arc<dyn DockerRuntime> = Arc::new(FakeRuntime::default());
        let cache = ImageCache::new(docker);
        let tag = cache
            .get_or_build("python:3.11-slim", &["requests".to_string()])
            .await
            .unwrap();
        let removed = cache.purge_prefix(CACHE_TAG_PREFIX).await.unwrap();
        assert_eq!(removed, vec![tag]);
    }
}
