use thiserror::Error;

use crate::context::Target;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("GitLab project id is required")]
    MissingArgument,

    #[error("{context}")]
    ConfigLoad {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no usable context in kubeconfig: {0}")]
    NoContext(String),

    #[error("{0} is required")]
    MissingCredential(&'static str),

    #[error("unable to get GitLab {target}")]
    GitLabUnreachable {
        target: Target,
        #[source]
        source: anyhow::Error,
    },

    #[error("GitLab {target} not found")]
    NotFound { target: Target },

    #[error("unable to {action} {resource}")]
    Provisioning {
        action: &'static str,
        resource: String,
        #[source]
        source: kube::Error,
    },

    #[error("no secret matching {prefix}* attached to serviceaccount {account}")]
    TokenNotFound { account: String, prefix: String },

    #[error("unable to get serviceaccount token secret {secret}")]
    SecretFetch {
        secret: String,
        #[source]
        source: kube::Error,
    },

    #[error("no data in serviceaccount token secret {secret}")]
    EmptyToken { secret: String },

    #[error("unable to assign kubernetes cluster to {target}")]
    Registration {
        target: Target,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub(crate) fn config_load(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::ConfigLoad {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Only a missing token secret is worth waiting for; the cluster creates it asynchronously.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, Error::TokenNotFound { .. })
    }
}
