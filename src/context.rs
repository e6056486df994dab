use std::fmt;

/// The GitLab object a cluster is attached to. Picked once, from `--gitlab-use-group`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Project(String),
    Group(String),
}

impl Target {
    pub fn new(id: String, use_group: bool) -> Self {
        if use_group {
            Target::Group(id)
        } else {
            Target::Project(id)
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Target::Project(id) | Target::Group(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::Project(_) => "project",
            Target::Group(_) => "group",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// What GitLab needs to know about the cluster, read from the active kubeconfig context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub name: String,
    pub host: String,
    pub ca_cert: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAccountRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ServiceAccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct NewCluster {
    pub name: String,
    pub environment_scope: String,
    pub api_url: String,
    pub ca_cert: String,
    pub token: String,
}

impl NewCluster {
    pub fn new(identity: &ClusterIdentity, token: String) -> Self {
        NewCluster {
            name: identity.name.clone(),
            environment_scope: "*".to_string(),
            api_url: identity.host.clone(),
            ca_cert: identity.ca_cert.clone(),
            token,
        }
    }
}

impl fmt::Debug for NewCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCluster")
            .field("name", &self.name)
            .field("environment_scope", &self.environment_scope)
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredCluster {
    pub id: u64,
    /// Web URL of the project or group the cluster now belongs to.
    pub web_url: String,
}

impl RegisteredCluster {
    pub fn url(&self) -> String {
        format!("{}/clusters/{}", self.web_url.trim_end_matches('/'), self.id)
    }
}
