use async_trait::async_trait;
use tracing::*;

use crate::api::GitLab;
use crate::context::{NewCluster, RegisteredCluster, Target};
use crate::error::{Error, Result};

/// The GitLab side of the bootstrap: confirm the target, then attach a cluster to it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterRegistrar: Send + Sync {
    /// Confirm the project or group exists and the token can see it.
    async fn validate(&self, target: &Target) -> Result<()>;

    async fn add_cluster(&self, target: &Target, cluster: &NewCluster) -> Result<RegisteredCluster>;
}

#[async_trait]
impl ClusterRegistrar for GitLab {
    async fn validate(&self, target: &Target) -> Result<()> {
        match self.get_namespace(target).await {
            Ok(Some(namespace)) => {
                info!(
                    "Found GitLab {} {} ({})",
                    target.kind(),
                    namespace.name,
                    namespace.web_url
                );
                debug!(id = namespace.id, base_url = %self.base_url(), "GitLab target resolved");
                Ok(())
            }
            Ok(None) => Err(Error::NotFound {
                target: target.clone(),
            }),
            Err(source) => Err(Error::GitLabUnreachable {
                target: target.clone(),
                source,
            }),
        }
    }

    async fn add_cluster(&self, target: &Target, cluster: &NewCluster) -> Result<RegisteredCluster> {
        info!("Adding cluster {} to GitLab {target}", cluster.name);
        self.add_user_cluster(target, cluster)
            .await
            .map_err(|source| Error::Registration {
                target: target.clone(),
                source,
            })
    }
}
