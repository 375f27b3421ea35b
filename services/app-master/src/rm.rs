//! Resource-manager client boundary.
//!
//! The master only ever issues container requests and releases and reacts
//! to grants; the resource manager's own placement policy stays on the
//! other side of this trait. A mock implementation records traffic for
//! tests and development.

use anyhow::Result;
use async_trait::async_trait;
use roost_model::{ContainerId, ResourceProfile};
use tracing::{debug, info};

/// One recorded container request, for inspection in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub priority: u32,
    pub profile: ResourceProfile,
    pub host_hints: Vec<String>,
    pub relax_locality: bool,
}

/// Client interface to the cluster resource manager.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Submit a container request at the given role priority.
    async fn request_container(
        &self,
        priority: u32,
        profile: ResourceProfile,
        host_hints: &[String],
        relax_locality: bool,
    ) -> Result<()>;

    /// Release a granted container back to the resource manager.
    async fn release_container(&self, container: &ContainerId) -> Result<()>;
}

/// Mock resource manager for testing and development.
///
/// Records every request and release; tests synthesize grants and
/// completions by posting events through the gateway.
#[derive(Default)]
pub struct MockResourceManager {
    requests: std::sync::Mutex<Vec<RecordedRequest>>,
    releases: std::sync::Mutex<Vec<ContainerId>>,
}

impl MockResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests recorded so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Releases recorded so far.
    pub fn releases(&self) -> Vec<ContainerId> {
        self.releases.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn release_count(&self) -> usize {
        self.releases.lock().unwrap().len()
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    async fn request_container(
        &self,
        priority: u32,
        profile: ResourceProfile,
        host_hints: &[String],
        relax_locality: bool,
    ) -> Result<()> {
        info!(
            priority,
            cores = profile.cores,
            memory_mb = profile.memory_mb,
            hints = host_hints.len(),
            relax_locality,
            "[MOCK] Container requested"
        );
        self.requests.lock().unwrap().push(RecordedRequest {
            priority,
            profile,
            host_hints: host_hints.to_vec(),
            relax_locality,
        });
        Ok(())
    }

    async fn release_container(&self, container: &ContainerId) -> Result<()> {
        debug!(container = %container, "[MOCK] Container released");
        self.releases.lock().unwrap().push(container.clone());
        Ok(())
    }
}
