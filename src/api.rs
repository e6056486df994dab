use anyhow::{anyhow, bail, Context};
use reqwest::{header, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::context::{NewCluster, RegisteredCluster, Target};

pub(crate) const DEFAULT_BASE_URL: &str = "https://gitlab.com/";
const API_VERSION_PATH: &str = "api/v4/";

/// A project or group as returned by `GET projects/:id` and `GET groups/:id`.
#[derive(Deserialize, Debug)]
pub(crate) struct Namespace {
    pub id: u64,
    pub name: String,
    pub web_url: String,
}

#[derive(Serialize)]
struct PlatformKubernetes<'a> {
    api_url: &'a str,
    token: &'a str,
    ca_cert: &'a str,
}

#[derive(Serialize)]
struct AddClusterRequest<'a> {
    name: &'a str,
    environment_scope: &'a str,
    platform_kubernetes_attributes: PlatformKubernetes<'a>,
}

impl<'a> From<&'a NewCluster> for AddClusterRequest<'a> {
    fn from(cluster: &'a NewCluster) -> Self {
        AddClusterRequest {
            name: &cluster.name,
            environment_scope: &cluster.environment_scope,
            platform_kubernetes_attributes: PlatformKubernetes {
                api_url: &cluster.api_url,
                token: &cluster.token,
                ca_cert: &cluster.ca_cert,
            },
        }
    }
}

#[derive(Deserialize)]
struct WebLink {
    web_url: String,
}

#[derive(Deserialize)]
struct ClusterResponse {
    id: u64,
    #[serde(default)]
    project: Option<WebLink>,
    #[serde(default)]
    group: Option<WebLink>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: serde_json::Value,
}

/// Authenticated handle on the GitLab REST API.
pub(crate) struct GitLab {
    http: reqwest::Client,
    base_url: Url,
}

impl GitLab {
    pub fn new(token: &str, base_url: Option<&str>) -> anyhow::Result<Self> {
        Self::with_builder(token, base_url, reqwest::Client::builder())
    }

    pub fn with_builder(
        token: &str,
        base_url: Option<&str>,
        builder: reqwest::ClientBuilder,
    ) -> anyhow::Result<Self> {
        let base_url = normalize_base_url(base_url.unwrap_or(DEFAULT_BASE_URL))?;

        let mut headers = header::HeaderMap::new();
        let mut auth_value =
            header::HeaderValue::from_str(token).context("GitLab API token is not a valid header value")?;
        auth_value.set_sensitive(true);
        headers.insert("PRIVATE-TOKEN", auth_value);

        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let http = builder
            .default_headers(headers)
            .user_agent(concat!("kubectl-gitlab_bootstrap/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(GitLab { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `<base>/projects/<id>/...` or `<base>/groups/<id>/...`, with the id as one escaped segment.
    pub fn endpoint(&self, target: &Target, rest: &[&str]) -> anyhow::Result<Url> {
        let collection = match target {
            Target::Project(_) => "projects",
            Target::Group(_) => "groups",
        };

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("GitLab URL {} cannot be a base", self.base_url))?
            .pop_if_empty()
            .push(collection)
            .push(target.id())
            .extend(rest);
        Ok(url)
    }

    /// Look up a project or group. `None` when GitLab answers 404.
    pub async fn get_namespace(&self, target: &Target) -> anyhow::Result<Option<Namespace>> {
        let resp = self
            .http
            .get(self.endpoint(target, &[])?)
            .send()
            .await
            .with_context(|| format!("Failed to get {target}"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let outcome = check(resp)
            .await?
            .json::<Namespace>()
            .await
            .context("Failed to parse response")?;

        Ok(Some(outcome))
    }

    pub async fn add_user_cluster(
        &self,
        target: &Target,
        cluster: &NewCluster,
    ) -> anyhow::Result<RegisteredCluster> {
        let resp = self
            .http
            .post(self.endpoint(target, &["clusters", "user"])?)
            .json(&AddClusterRequest::from(cluster))
            .send()
            .await
            .with_context(|| format!("Failed to add cluster to {target}"))?;

        let outcome = check(resp)
            .await?
            .json::<ClusterResponse>()
            .await
            .context("Failed to parse response")?;

        registered_cluster(target, outcome)
    }
}

/// Mirror the GitLab client convention: the base always ends in `/api/v4/`.
pub(crate) fn normalize_base_url(raw: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("Invalid GitLab URL {raw}"))?;
    if url.cannot_be_a_base() {
        bail!("Invalid GitLab URL {raw}");
    }

    let mut path = url.path().to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    if !path.ends_with(API_VERSION_PATH) {
        path.push_str(API_VERSION_PATH);
    }
    url.set_path(&path);

    Ok(url)
}

fn registered_cluster(target: &Target, outcome: ClusterResponse) -> anyhow::Result<RegisteredCluster> {
    let owner = match target {
        Target::Project(_) => outcome.project,
        Target::Group(_) => outcome.group,
    };
    let web_url = owner
        .with_context(|| format!("Response is missing the {} web_url", target.kind()))?
        .web_url;

    Ok(RegisteredCluster {
        id: outcome.id,
        web_url,
    })
}

/// Like `error_for_status`, but keeps GitLab's `message` in the error.
async fn check(resp: Response) -> anyhow::Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = match resp.text().await {
        Ok(body) => body,
        Err(e) => bail!("GitLab returned {status} (body unreadable: {e})"),
    };
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody {
            message: serde_json::Value::String(message),
        }) => bail!("GitLab returned {status}: {message}"),
        Ok(ErrorBody { message }) => bail!("GitLab returned {status}: {message}"),
        Err(_) if body.is_empty() => bail!("GitLab returned {status}"),
        Err(_) => bail!("GitLab returned {status}: {body}"),
    }
}
