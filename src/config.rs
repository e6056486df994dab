use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use base64::Engine;
use clap::{ArgAction, Args, Parser};
use kube::config::{Cluster, KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::*;

use crate::context::{ClusterIdentity, Target};
use crate::error::{Error, Result};

#[derive(Parser, Debug)]
#[command(
    name = "kubectl-gitlab_bootstrap",
    bin_name = "kubectl gitlab-bootstrap",
    version,
    about = "Bootstraps a Kubernetes cluster into a GitLab project"
)]
pub struct Cli {
    /// GitLab project id, or group id with --gitlab-use-group
    #[arg(value_name = "ID")]
    pub id: Option<String>,

    /// Private token from GitLab. Pulled from env["GITLAB_API_TOKEN"] if not provided
    #[arg(long)]
    pub gitlab_api_token: Option<String>,

    /// Set to override default connection to GitLab
    #[arg(long)]
    pub gitlab_url: Option<String>,

    /// Add the cluster to the group identified by the id rather than a project
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub gitlab_use_group: bool,

    /// How many times to look for the ServiceAccount token secret before giving up
    #[arg(long, default_value_t = 10)]
    pub token_attempts: u32,

    #[command(flatten)]
    pub kube: KubeFlags,
}

/// Standard Kubernetes connection flags.
#[derive(Args, Debug, Clone, Default)]
pub struct KubeFlags {
    /// Path to the kubeconfig file to use
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// The name of the kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// The name of the kubeconfig cluster to use
    #[arg(long)]
    pub cluster: Option<String>,

    /// The name of the kubeconfig user to use
    #[arg(long)]
    pub user: Option<String>,

    /// Namespace that holds the gitlab-admin ServiceAccount
    #[arg(short, long, default_value = "kube-system")]
    pub namespace: String,
}

/// GitLab half of the resolved configuration.
#[derive(Clone)]
pub struct GitLabOptions {
    pub id: String,
    pub token: String,
    pub url: Option<String>,
    pub use_group: bool,
}

impl std::fmt::Debug for GitLabOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitLabOptions")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("use_group", &self.use_group)
            .finish_non_exhaustive()
    }
}

impl GitLabOptions {
    /// Check credentials are present and decide, once, whether we talk to a project or a group.
    pub fn target(&self) -> Result<Target> {
        if self.token.is_empty() {
            return Err(Error::MissingCredential("GitLab API token"));
        }
        if self.id.is_empty() {
            return Err(Error::MissingCredential("GitLab project id"));
        }
        Ok(Target::new(self.id.clone(), self.use_group))
    }
}

pub const TOKEN_ENV: &str = "GITLAB_API_TOKEN";

impl Cli {
    pub fn gitlab_options(&self) -> Result<GitLabOptions> {
        self.gitlab_options_with(std::env::var(TOKEN_ENV).ok())
    }

    /// An unset or empty `--gitlab-api-token` falls back to `env_token`.
    fn gitlab_options_with(&self, env_token: Option<String>) -> Result<GitLabOptions> {
        let id = self.id.clone().ok_or(Error::MissingArgument)?;
        let token = self
            .gitlab_api_token
            .clone()
            .filter(|token| !token.is_empty())
            .or(env_token)
            .unwrap_or_default();
        Ok(GitLabOptions {
            id,
            token,
            url: self.gitlab_url.clone(),
            use_group: self.gitlab_use_group,
        })
    }
}

/// Kubernetes half of the resolved configuration.
pub struct KubeContext {
    pub identity: ClusterIdentity,
    pub client: Client,
}

/// `--kubeconfig`, else the first `KUBECONFIG` entry, else `~/.kube/config`.
pub fn kubeconfig_path(
    explicit: Option<&Path>,
    env: Option<OsString>,
    home: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Some(paths) = env {
        if let Some(first) = std::env::split_paths(&paths).find(|p| !p.as_os_str().is_empty()) {
            return Ok(first);
        }
    }

    let home = home.ok_or_else(|| {
        Error::config_load("can't get home dir", anyhow!("no home directory for the current user"))
    })?;
    Ok(home.join(".kube").join("config"))
}

/// Pick the context and pull the cluster's name, server and CA out of the kubeconfig.
pub fn cluster_identity(
    kubeconfig: &Kubeconfig,
    base_dir: &Path,
    flags: &KubeFlags,
) -> Result<ClusterIdentity> {
    if kubeconfig.contexts.is_empty() {
        return Err(Error::NoContext("no contexts found in kubeconfig".into()));
    }

    let context_name = flags
        .context
        .as_deref()
        .or(kubeconfig.current_context.as_deref())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::NoContext("no context currently set".into()))?;

    let context = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .and_then(|c| c.context.as_ref())
        .ok_or_else(|| Error::NoContext(format!("context {context_name} not found")))?;

    let name = flags.cluster.clone().unwrap_or_else(|| context.cluster.clone());

    let cluster = kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == name)
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| {
            Error::config_load(
                "error building config from kubeconfig",
                anyhow!("cluster {name} not found"),
            )
        })?;

    let host = cluster
        .server
        .clone()
        .filter(|server| !server.is_empty())
        .ok_or_else(|| {
            Error::config_load(
                "error building config from kubeconfig",
                anyhow!("cluster {name} has no server"),
            )
        })?;

    let ca_cert = match cluster_ca(cluster, base_dir)? {
        Some(ca) => ca,
        None => {
            warn!("Cluster {name} has no certificate authority; registering without one");
            String::new()
        }
    };

    Ok(ClusterIdentity {
        name,
        host,
        ca_cert,
    })
}

/// PEM text of the cluster CA, from inline data or from the referenced file.
fn cluster_ca(cluster: &Cluster, base_dir: &Path) -> Result<Option<String>> {
    if let Some(data) = &cluster.certificate_authority_data {
        let pem = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| Error::config_load("invalid certificate-authority-data", e))?;
        let pem = String::from_utf8(pem)
            .map_err(|e| Error::config_load("invalid certificate-authority-data", e))?;
        return Ok(Some(pem));
    }

    if let Some(path) = &cluster.certificate_authority {
        let path = base_dir.join(path);
        let pem = std::fs::read_to_string(&path).map_err(|e| {
            Error::config_load(format!("can't read certificate-authority {}", path.display()), e)
        })?;
        return Ok(Some(pem));
    }

    Ok(None)
}

pub async fn load_kube_context(flags: &KubeFlags) -> Result<KubeContext> {
    let path = kubeconfig_path(
        flags.kubeconfig.as_deref(),
        std::env::var_os("KUBECONFIG"),
        dirs::home_dir(),
    )?;
    debug!(path = %path.display(), "Loading kubeconfig");

    let kubeconfig = Kubeconfig::read_from(&path)
        .map_err(|e| Error::config_load(format!("error loading kubeconfig {}", path.display()), e))?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let identity = cluster_identity(&kubeconfig, base_dir, flags)?;

    let options = KubeConfigOptions {
        context: flags.context.clone().or_else(|| kubeconfig.current_context.clone()),
        cluster: Some(identity.name.clone()),
        user: flags.user.clone(),
    };
    let config = Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| Error::config_load("error building config from kubeconfig", e))?;
    let client = Client::try_from(config)
        .map_err(|e| Error::config_load("error creating client from config", e))?;

    info!("Using cluster {} at {}", identity.name, identity.host);

    Ok(KubeContext { identity, client })
}
