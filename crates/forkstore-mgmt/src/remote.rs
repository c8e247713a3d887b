//! Sources for the `s3_storage_size` metric.

use forkstore_meta::TenantSnapshot;

use crate::config::RemoteStorageConfig;

/// Reports how many bytes of a tenant live on the remote tier.
pub trait RemoteSizeSource: Send + Sync {
    fn remote_size(&self, snapshot: &TenantSnapshot) -> u64;

    /// False when no remote tier exists and every size is zero.
    fn is_configured(&self) -> bool;
}

/// No remote tier: every tenant reports zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemoteStorage;

impl RemoteSizeSource for NoRemoteStorage {
    fn remote_size(&self, _snapshot: &TenantSnapshot) -> u64 {
        0
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// A remote tier that holds a copy of every retained layer.
#[derive(Debug, Clone)]
pub struct LocalMirrorRemote {
    config: RemoteStorageConfig,
}

impl LocalMirrorRemote {
    pub fn new(config: RemoteStorageConfig) -> Self {
        Self { config }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }
}

impl RemoteSizeSource for LocalMirrorRemote {
    fn remote_size(&self, snapshot: &TenantSnapshot) -> u64 {
        snapshot.physical_size()
    }

    fn is_configured(&self) -> bool {
        true
    }
}

/// Builds the source matching the configured remote tier.
pub fn from_config(config: Option<&RemoteStorageConfig>) -> Box<dyn RemoteSizeSource> {
    match config {
        Some(remote) => Box::new(LocalMirrorRemote::new(remote.clone())),
        None => Box::new(NoRemoteStorage),
    }
}
