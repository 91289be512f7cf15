//! Region API client: look up, create and delete Android instances.

use crate::error::{Error, Result};
use crate::session::SessionOptions;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Label carrying the caller-chosen instance name.
pub const NAME_LABEL: &str = "limbar.io/name";

const API_PREFIX: &str = "/apis/android.limbar.io/v1alpha1";
const MAX_NAME_LEN: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Unknown,
    Creating,
    Ready,
    Terminated,
}

impl InstanceState {
    fn as_str(self) -> &'static str {
        match self {
            InstanceState::Unknown => "unknown",
            InstanceState::Creating => "creating",
            InstanceState::Ready => "ready",
            InstanceState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    pub name: String,
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub state: InstanceState,
    #[serde(default)]
    pub connection_url: Option<String>,
    #[serde(default)]
    pub webrtc_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub metadata: InstanceMetadata,
    #[serde(default)]
    pub spec: Option<InstanceSpec>,
    #[serde(default)]
    pub status: Option<InstanceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Request body for a new instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCreate {
    pub metadata: CreateMetadata,
    #[serde(default)]
    pub spec: InstanceSpec,
}

impl InstanceCreate {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            metadata: CreateMetadata {
                name: name.into(),
                labels: BTreeMap::new(),
            },
            spec: InstanceSpec::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: InstanceState,
    pub connection_url: String,
    pub webrtc_url: String,
}

/// An instance together with a token that can connect to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceWithToken {
    pub metadata: InstanceMetadata,
    pub token: String,
    pub status: ConnectionStatus,
}

impl InstanceWithToken {
    /// Session options pointing at this instance's endpoints.
    pub fn session_options(&self) -> SessionOptions {
        let mut options = SessionOptions::new(&self.status.webrtc_url, &self.token);
        if !self.status.connection_url.is_empty() {
            options.adb_url = Some(self.status.connection_url.clone());
        }
        options
    }
}

#[derive(Deserialize)]
struct TokenWithValue {
    token: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Serialize)]
struct PutInstance<'a> {
    instance: &'a InstanceCreate,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait: Option<bool>,
}

/// `k1=v1,k2=v2`
pub fn labels_to_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Label values joined by `-`, truncated so the random suffix fits in 60 chars.
pub fn generate_name(labels: &BTreeMap<String, String>) -> String {
    let entropy: String = uuid::Uuid::new_v4().simple().to_string().chars().take(24).collect();
    let keep = MAX_NAME_LEN - entropy.len() - 1;
    let prefix: String = labels
        .values()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(keep)
        .collect();
    format!("{prefix}-{entropy}")
}

#[derive(Debug, Clone)]
pub struct RegionClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RegionClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn instances_url(&self, organization_id: &str) -> String {
        format!(
            "{}{API_PREFIX}/organizations/{}/instances",
            self.base_url,
            urlencoding::encode(organization_id)
        )
    }

    fn instance_url(&self, organization_id: &str, name: &str) -> String {
        format!(
            "{}/{}",
            self.instances_url(organization_id),
            urlencoding::encode(name)
        )
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Api(format!("request failed: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(Error::Api(format!("{status}: {message}")))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        self.execute(request)
            .await?
            .json()
            .await
            .map_err(|e| Error::Api(format!("invalid response body: {e}")))
    }

    pub async fn list_instances(
        &self,
        organization_id: &str,
        state: Option<InstanceState>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Instance>> {
        let mut query = Vec::new();
        if let Some(state) = state {
            query.push(("state", state.as_str()));
        }
        if let Some(selector) = label_selector {
            query.push(("labelSelector", selector));
        }
        let request = self.http.get(self.instances_url(organization_id)).query(&query);
        self.json(request).await
    }

    pub async fn get_instance(&self, organization_id: &str, name: &str) -> Result<Instance> {
        self.json(self.http.get(self.instance_url(organization_id, name)))
            .await
    }

    /// Create an instance. With `wait`, returns only once it can be connected to.
    pub async fn create_instance(
        &self,
        organization_id: &str,
        instance: &InstanceCreate,
        wait: Option<bool>,
    ) -> Result<InstanceWithToken> {
        let body = PutInstance { instance, wait };
        let request = self.http.put(self.instances_url(organization_id)).json(&body);
        self.json(request).await
    }

    pub async fn delete_instance(&self, organization_id: &str, name: &str) -> Result<()> {
        self.execute(self.http.delete(self.instance_url(organization_id, name)))
            .await?;
        info!(name, "Deleted instance");
        Ok(())
    }

    /// Mint a fresh connection token for an existing instance.
    pub async fn create_instance_token(&self, organization_id: &str, name: &str) -> Result<String> {
        let url = format!("{}/tokens", self.instance_url(organization_id, name));
        let request = self.http.post(url).json(&serde_json::json!({}));
        let token: TokenWithValue = self.json(request).await?;
        Ok(token.token)
    }

    /// Reuse a ready instance carrying the same name label, or create one.
    ///
    /// Instance names are not historically unique, so the requested name is
    /// stored as a label and the real name gets a random suffix.
    pub async fn get_or_create_instance(
        &self,
        organization_id: &str,
        instance: InstanceCreate,
        wait: Option<bool>,
    ) -> Result<InstanceWithToken> {
        let mut labels = instance.metadata.labels.clone();
        labels.insert(NAME_LABEL.to_string(), instance.metadata.name.clone());
        let selector = labels_to_selector(&labels);

        let ready = self
            .list_instances(organization_id, Some(InstanceState::Ready), Some(&selector))
            .await?;
        if let Some(existing) = ready.into_iter().next() {
            debug!(name = %existing.metadata.name, "Reusing ready instance");
            let token = self
                .create_instance_token(organization_id, &existing.metadata.name)
                .await?;
            let status = existing.status.unwrap_or(InstanceStatus {
                state: InstanceState::Ready,
                connection_url: None,
                webrtc_url: None,
            });
            return Ok(InstanceWithToken {
                metadata: existing.metadata,
                token,
                status: ConnectionStatus {
                    state: InstanceState::Ready,
                    connection_url: status.connection_url.unwrap_or_default(),
                    webrtc_url: status.webrtc_url.unwrap_or_default(),
                },
            });
        }

        let create = InstanceCreate {
            metadata: CreateMetadata {
                name: generate_name(&labels),
                labels,
            },
            spec: instance.spec,
        };
        info!(name = %create.metadata.name, "Creating instance");
        self.create_instance(organization_id, &create, wait).await
    }
}
