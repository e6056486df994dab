use std::sync::LazyLock;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use regex::Regex;
use tracing::*;

use crate::cluster::ClusterApi;
use crate::context::{ClusterIdentity, NewCluster, RegisteredCluster, ServiceAccountRef, Target};
use crate::error::{Error, Result};
use crate::registrar::ClusterRegistrar;
use crate::retry::{retry_with_backoff, RetryConfig};

pub const SERVICE_ACCOUNT_NAME: &str = "gitlab-admin";
pub const CLUSTER_ROLE_BINDING_NAME: &str = "gitlab-admin";
pub const CLUSTER_ROLE_NAME: &str = "cluster-admin";
const TOKEN_SECRET_PREFIX: &str = "gitlab-admin-token-";

static TOKEN_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{}", regex::escape(TOKEN_SECRET_PREFIX))).expect("token secret pattern is valid")
});

/// Everything one run needs, fixed before the first network call.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub target: Target,
    pub identity: ClusterIdentity,
    pub namespace: String,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub target: Target,
    pub cluster: RegisteredCluster,
}

impl Bootstrap {
    /// Validate the GitLab target, provision the admin account, read its token and
    /// register the cluster. Stops at the first error; nothing is rolled back.
    pub async fn run(
        &self,
        cluster: &dyn ClusterApi,
        registrar: &dyn ClusterRegistrar,
    ) -> Result<Registration> {
        registrar.validate(&self.target).await?;

        let account = ensure_service_account(cluster, &self.namespace).await?;
        ensure_cluster_role_binding(cluster, &account).await?;

        let token = service_account_token(cluster, &account, &self.retry).await?;

        let registered = registrar
            .add_cluster(&self.target, &NewCluster::new(&self.identity, token))
            .await?;

        Ok(Registration {
            target: self.target.clone(),
            cluster: registered,
        })
    }
}

/// Get-or-create the `gitlab-admin` ServiceAccount. An existing one is reused untouched.
pub async fn ensure_service_account(
    api: &dyn ClusterApi,
    namespace: &str,
) -> Result<ServiceAccountRef> {
    let account = ServiceAccountRef {
        namespace: namespace.to_string(),
        name: SERVICE_ACCOUNT_NAME.to_string(),
    };

    match api.get_service_account(namespace, SERVICE_ACCOUNT_NAME).await {
        Ok(Some(_)) => {
            info!("Using existing {} account", account.name);
            return Ok(account);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Could not look up serviceaccount {account}, creating it"),
    }

    let desired = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT_NAME.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create_service_account(namespace, &desired)
        .await
        .map_err(|source| Error::Provisioning {
            action: "create",
            resource: format!("serviceaccount {account}"),
            source,
        })?;

    info!("Created serviceaccount {account}");
    Ok(account)
}

pub fn cluster_role_binding(account: &ServiceAccountRef) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CLUSTER_ROLE_BINDING_NAME.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: account.name.clone(),
            namespace: Some(account.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// Get-or-create the binding of the account to `cluster-admin`. An existing binding is
/// trusted as-is, even if its subjects differ.
pub async fn ensure_cluster_role_binding(
    api: &dyn ClusterApi,
    account: &ServiceAccountRef,
) -> Result<()> {
    match api.get_cluster_role_binding(CLUSTER_ROLE_BINDING_NAME).await {
        Ok(Some(_)) => {
            info!("Using existing clusterrolebinding {CLUSTER_ROLE_BINDING_NAME}");
            return Ok(());
        }
        Ok(None) => {}
        Err(e) => warn!(
            error = %e,
            "Could not look up clusterrolebinding {CLUSTER_ROLE_BINDING_NAME}, creating it"
        ),
    }

    api.create_cluster_role_binding(&cluster_role_binding(account))
        .await
        .map_err(|source| Error::Provisioning {
            action: "create",
            resource: format!("clusterrolebinding {CLUSTER_ROLE_BINDING_NAME}"),
            source,
        })?;

    info!("Created clusterrolebinding {CLUSTER_ROLE_BINDING_NAME} for {account}");
    Ok(())
}

/// Name of the first secret reference that looks like the account's token secret.
pub fn find_token_secret(account: &ServiceAccount) -> Option<&str> {
    account
        .secrets
        .iter()
        .flatten()
        .filter_map(|reference| reference.name.as_deref())
        .find(|name| TOKEN_SECRET.is_match(name))
}

/// Read the account's bearer token, polling while the token secret has not been attached yet.
pub async fn service_account_token(
    api: &dyn ClusterApi,
    account: &ServiceAccountRef,
    retry: &RetryConfig,
) -> Result<String> {
    retry_with_backoff(
        retry,
        "read serviceaccount token",
        Error::is_retryable,
        || read_token(api, account),
    )
    .await
}

async fn read_token(api: &dyn ClusterApi, account: &ServiceAccountRef) -> Result<String> {
    let not_found = || Error::TokenNotFound {
        account: account.to_string(),
        prefix: TOKEN_SECRET_PREFIX.to_string(),
    };

    let sa = api
        .get_service_account(&account.namespace, &account.name)
        .await
        .map_err(|source| Error::Provisioning {
            action: "get",
            resource: format!("serviceaccount {account}"),
            source,
        })?
        .ok_or_else(not_found)?;

    let secret_name = find_token_secret(&sa).ok_or_else(not_found)?.to_string();
    debug!("Reading token from secret {secret_name}");

    let secret = api
        .get_secret(&account.namespace, &secret_name)
        .await
        .map_err(|source| Error::SecretFetch {
            secret: secret_name.clone(),
            source,
        })?;

    let token = secret
        .data
        .as_ref()
        .and_then(|data| data.get("token"))
        .map(|token| String::from_utf8_lossy(&token.0).trim().to_string())
        .unwrap_or_default();

    if token.is_empty() {
        return Err(Error::EmptyToken {
            secret: secret_name,
        });
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::registrar::MockClusterRegistrar;
    use k8s_openapi::api::core::v1::{ObjectReference, Secret};
    use k8s_openapi::ByteString;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const SECRET_NAME: &str = "gitlab-admin-token-abc123";

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "InternalError".to_string(),
            code,
        })
    }

    fn account() -> ServiceAccountRef {
        ServiceAccountRef {
            namespace: "kube-system".to_string(),
            name: SERVICE_ACCOUNT_NAME.to_string(),
        }
    }

    fn service_account(secrets: &[&str]) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(SERVICE_ACCOUNT_NAME.to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            secrets: Some(
                secrets
                    .iter()
                    .map(|name| ObjectReference {
                        name: Some(name.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn token_secret(token: &str) -> Secret {
        Secret {
            data: Some(BTreeMap::from([(
                "token".to_string(),
                ByteString(token.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn instant(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn existing_service_account_is_reused() {
        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .with(eq("kube-system"), eq(SERVICE_ACCOUNT_NAME))
            .times(1)
            .returning(|_, _| Ok(Some(service_account(&[]))));
        api.expect_create_service_account().never();

        let ensured = ensure_service_account(&api, "kube-system").await.unwrap();
        assert_eq!(ensured, account());
    }

    #[tokio::test]
    async fn missing_service_account_is_created_with_only_a_name() {
        let expected = ServiceAccount {
            metadata: ObjectMeta {
                name: Some("gitlab-admin".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .returning(|_, _| Ok(None));
        api.expect_create_service_account()
            .withf(move |namespace: &str, sa: &ServiceAccount| {
                namespace == "kube-system" && *sa == expected
            })
            .times(1)
            .returning(|_, sa| Ok(sa.clone()));

        ensure_service_account(&api, "kube-system").await.unwrap();
    }

    #[tokio::test]
    async fn lookup_failure_still_attempts_create() {
        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .returning(|_, _| Err(api_error(500)));
        api.expect_create_service_account()
            .times(1)
            .returning(|_, sa| Ok(sa.clone()));

        ensure_service_account(&api, "kube-system").await.unwrap();
    }

    #[tokio::test]
    async fn create_failure_is_provisioning_error() {
        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .returning(|_, _| Ok(None));
        api.expect_create_service_account()
            .returning(|_, _| Err(api_error(403)));

        let err = ensure_service_account(&api, "kube-system").await.unwrap_err();
        assert!(matches!(err, Error::Provisioning { action: "create", .. }));
        assert_eq!(
            err.to_string(),
            "unable to create serviceaccount kube-system/gitlab-admin"
        );
    }

    #[tokio::test]
    async fn existing_binding_is_reused() {
        let mut api = MockClusterApi::new();
        api.expect_get_cluster_role_binding()
            .with(eq(CLUSTER_ROLE_BINDING_NAME))
            .returning(|_| Ok(Some(ClusterRoleBinding::default())));
        api.expect_create_cluster_role_binding().never();

        ensure_cluster_role_binding(&api, &account()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_binding_grants_cluster_admin() {
        let mut api = MockClusterApi::new();
        api.expect_get_cluster_role_binding()
            .returning(|_| Ok(None));
        api.expect_create_cluster_role_binding()
            .withf(|crb: &ClusterRoleBinding| {
                let subjects = crb.subjects.as_deref().unwrap_or_default();
                crb.metadata.name.as_deref() == Some("gitlab-admin")
                    && crb.role_ref.kind == "ClusterRole"
                    && crb.role_ref.name == "cluster-admin"
                    && subjects.len() == 1
                    && subjects[0].kind == "ServiceAccount"
                    && subjects[0].name == "gitlab-admin"
                    && subjects[0].namespace.as_deref() == Some("kube-system")
            })
            .times(1)
            .returning(|crb| Ok(crb.clone()));

        ensure_cluster_role_binding(&api, &account()).await.unwrap();
    }

    #[tokio::test]
    async fn binding_create_failure_is_provisioning_error() {
        let mut api = MockClusterApi::new();
        api.expect_get_cluster_role_binding()
            .returning(|_| Ok(None));
        api.expect_create_cluster_role_binding()
            .returning(|_| Err(api_error(403)));

        assert!(matches!(
            ensure_cluster_role_binding(&api, &account()).await,
            Err(Error::Provisioning { .. })
        ));
    }

    #[test]
    fn token_secret_is_found_by_prefix() {
        assert_eq!(
            find_token_secret(&service_account(&["foo", SECRET_NAME])),
            Some(SECRET_NAME)
        );
        assert_eq!(find_token_secret(&service_account(&["foo"])), None);
        assert_eq!(
            find_token_secret(&service_account(&["my-gitlab-admin-token-x"])),
            None
        );
        assert_eq!(find_token_secret(&ServiceAccount::default()), None);
    }

    #[tokio::test]
    async fn token_is_read_from_matching_secret() {
        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(&["foo", SECRET_NAME]))));
        api.expect_get_secret()
            .with(eq("kube-system"), eq(SECRET_NAME))
            .times(1)
            .returning(|_, _| Ok(token_secret("bearer-token")));

        let token = service_account_token(&api, &account(), &instant(1))
            .await
            .unwrap();
        assert_eq!(token, "bearer-token");
    }

    #[tokio::test]
    async fn token_waits_for_secret_to_be_attached() {
        let mut api = MockClusterApi::new();
        let mut calls = 0;
        api.expect_get_service_account()
            .times(3)
            .returning(move |_, _| {
                calls += 1;
                if calls < 3 {
                    Ok(Some(service_account(&[])))
                } else {
                    Ok(Some(service_account(&[SECRET_NAME])))
                }
            });
        api.expect_get_secret()
            .times(1)
            .returning(|_, _| Ok(token_secret("late-token")));

        let token = service_account_token(&api, &account(), &instant(5))
            .await
            .unwrap();
        assert_eq!(token, "late-token");
    }

    #[tokio::test]
    async fn token_not_found_after_budget() {
        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .times(3)
            .returning(|_, _| Ok(Some(service_account(&["foo"]))));
        api.expect_get_secret().never();

        let err = service_account_token(&api, &account(), &instant(3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenNotFound { .. }));
    }

    #[tokio::test]
    async fn secret_fetch_failure_is_not_retried() {
        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .times(1)
            .returning(|_, _| Ok(Some(service_account(&[SECRET_NAME]))));
        api.expect_get_secret()
            .times(1)
            .returning(|_, _| Err(api_error(404)));

        let err = service_account_token(&api, &account(), &instant(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecretFetch { .. }));
    }

    #[tokio::test]
    async fn blank_token_is_rejected() {
        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(&[SECRET_NAME]))));
        api.expect_get_secret()
            .returning(|_, _| Ok(token_secret("  \n")));

        let err = service_account_token(&api, &account(), &instant(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyToken { .. }));
    }

    fn bootstrap(target: Target) -> Bootstrap {
        Bootstrap {
            target,
            identity: ClusterIdentity {
                name: "prod".to_string(),
                host: "https://10.0.0.1:6443".to_string(),
                ca_cert: "CA".to_string(),
            },
            namespace: "kube-system".to_string(),
            retry: instant(1),
        }
    }

    fn provisioned_cluster() -> MockClusterApi {
        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(&[SECRET_NAME]))));
        api.expect_get_cluster_role_binding()
            .returning(|_| Ok(Some(ClusterRoleBinding::default())));
        api.expect_get_secret()
            .returning(|_, _| Ok(token_secret("bearer-token")));
        api
    }

    #[tokio::test]
    async fn project_registration() {
        let api = provisioned_cluster();
        let target = Target::Project("17".to_string());

        let mut registrar = MockClusterRegistrar::new();
        registrar
            .expect_validate()
            .with(eq(target.clone()))
            .times(1)
            .returning(|_| Ok(()));
        registrar
            .expect_add_cluster()
            .withf(|target: &Target, cluster: &NewCluster| {
                *target == Target::Project("17".to_string())
                    && cluster.name == "prod"
                    && cluster.api_url == "https://10.0.0.1:6443"
                    && cluster.ca_cert == "CA"
                    && cluster.token == "bearer-token"
                    && cluster.environment_scope == "*"
            })
            .times(1)
            .returning(|_, _| {
                Ok(RegisteredCluster {
                    id: 42,
                    web_url: "https://gitlab.example/proj".to_string(),
                })
            });

        let registration = bootstrap(target.clone()).run(&api, &registrar).await.unwrap();
        assert_eq!(registration.target, target);
        assert!(registration.cluster.url().ends_with("/clusters/42"));
    }

    #[tokio::test]
    async fn group_registration_uses_group_endpoints() {
        let api = provisioned_cluster();

        let mut registrar = MockClusterRegistrar::new();
        registrar
            .expect_validate()
            .with(eq(Target::Group("7".to_string())))
            .times(1)
            .returning(|_| Ok(()));
        registrar
            .expect_add_cluster()
            .withf(|target: &Target, _: &NewCluster| *target == Target::Group("7".to_string()))
            .times(1)
            .returning(|_, _| {
                Ok(RegisteredCluster {
                    id: 3,
                    web_url: "https://gitlab.example/groups/ops".to_string(),
                })
            });

        let registration = bootstrap(Target::Group("7".to_string()))
            .run(&api, &registrar)
            .await
            .unwrap();
        assert_eq!(
            registration.cluster.url(),
            "https://gitlab.example/groups/ops/clusters/3"
        );
    }

    #[tokio::test]
    async fn failed_validation_touches_nothing() {
        // No expectations: any cluster call panics.
        let api = MockClusterApi::new();

        let mut registrar = MockClusterRegistrar::new();
        registrar.expect_validate().returning(|target| {
            Err(Error::NotFound {
                target: target.clone(),
            })
        });
        registrar.expect_add_cluster().never();

        let err = bootstrap(Target::Project("404".to_string()))
            .run(&api, &registrar)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "GitLab project 404 not found");
    }

    #[tokio::test]
    async fn missing_token_stops_before_registration() {
        let mut api = MockClusterApi::new();
        api.expect_get_service_account()
            .returning(|_, _| Ok(Some(service_account(&[]))));
        api.expect_get_cluster_role_binding()
            .returning(|_| Ok(Some(ClusterRoleBinding::default())));

        let mut registrar = MockClusterRegistrar::new();
        registrar.expect_validate().returning(|_| Ok(()));
        registrar.expect_add_cluster().never();

        let err = bootstrap(Target::Project("1".to_string()))
            .run(&api, &registrar)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenNotFound { .. }));
    }
}
