//! HTTP implementations of the collaborator traits.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use irs_shared::{GlobalAssetId, IrsError, Result, ShellDescriptor, SubmodelDescriptor};

use crate::{
    BusinessPartnerClient, CallbackEvent, CallbackNotifier, RegistryClient, SchemaClient,
    SubmodelClient,
};

/// User-Agent string for collaborator requests.
const USER_AGENT: &str = concat!("irs/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 3;

/// Specific asset id name carrying the manufacturer.
const MANUFACTURER_ID_KEY: &str = "manufacturerId";

/// Build a reqwest client shared by all live collaborators.
pub fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| IrsError::Transport(format!("failed to build HTTP client: {e}")))
}

/// Join path segments onto a base URL, percent-encoding each segment.
fn endpoint(base_url: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| IrsError::configuration(format!("invalid base URL '{base_url}': {e}")))?;
    url.path_segments_mut()
        .map_err(|_| IrsError::configuration(format!("base URL '{base_url}' cannot be a base")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn get(client: &Client, url: &str) -> Result<reqwest::Response> {
    client
        .get(url)
        .send()
        .await
        .map_err(|e| IrsError::Transport(format!("{url}: {e}")))
}

/// Turn a non-success status into the matching error.
fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(IrsError::NotFound(url.to_string()));
    }
    if !status.is_success() {
        return Err(IrsError::Transport(format!("{url}: HTTP {status}")));
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Wire format of an AAS shell descriptor.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AasShellDescriptor {
    global_asset_id: String,
    #[serde(default)]
    id_short: Option<String>,
    #[serde(default)]
    specific_asset_ids: Vec<AasSpecificAssetId>,
    #[serde(default)]
    submodel_descriptors: Vec<AasSubmodelDescriptor>,
}

#[derive(Debug, Deserialize)]
struct AasSpecificAssetId {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AasSubmodelDescriptor {
    semantic_id: AasReference,
    #[serde(default)]
    endpoints: Vec<AasEndpoint>,
}

#[derive(Debug, Deserialize)]
struct AasReference {
    #[serde(default)]
    keys: Vec<AasKey>,
}

#[derive(Debug, Deserialize)]
struct AasKey {
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AasEndpoint {
    protocol_information: AasProtocolInformation,
}

#[derive(Debug, Deserialize)]
struct AasProtocolInformation {
    href: String,
}

impl From<AasShellDescriptor> for ShellDescriptor {
    fn from(aas: AasShellDescriptor) -> Self {
        let manufacturer_id = aas
            .specific_asset_ids
            .into_iter()
            .find(|id| id.name == MANUFACTURER_ID_KEY)
            .map(|id| id.value);

        // Descriptors without a semantic id or endpoint cannot be fetched.
        let submodel_descriptors = aas
            .submodel_descriptors
            .into_iter()
            .filter_map(|sd| {
                let semantic_id = sd.semantic_id.keys.into_iter().next()?.value;
                let href = sd.endpoints.into_iter().next()?.protocol_information.href;
                Some(SubmodelDescriptor::new(semantic_id, href))
            })
            .collect();

        Self {
            global_asset_id: GlobalAssetId::from_payload(aas.global_asset_id),
            id_short: aas.id_short,
            manufacturer_id,
            submodel_descriptors,
        }
    }
}

/// Digital twin registry client.
pub struct HttpRegistryClient {
    client: Client,
    base_url: String,
}

impl HttpRegistryClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn get_shell(&self, id: &GlobalAssetId) -> Result<ShellDescriptor> {
        let url = endpoint(&self.base_url, &["shell-descriptors", id.as_str()])?;
        debug!(%url, "requesting shell descriptor");

        let response = check_status(url.as_str(), get(&self.client, url.as_str()).await?)?;
        let aas: AasShellDescriptor = response
            .json()
            .await
            .map_err(|e| IrsError::Transport(format!("{url}: invalid shell descriptor: {e}")))?;
        Ok(aas.into())
    }
}

// ---------------------------------------------------------------------------
// Submodels
// ---------------------------------------------------------------------------

/// Fetches aspect payloads from the endpoint announced in the shell.
pub struct HttpSubmodelClient {
    client: Client,
}

impl HttpSubmodelClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SubmodelClient for HttpSubmodelClient {
    async fn fetch(&self, endpoint: &str) -> Result<Vec<u8>> {
        debug!(%endpoint, "fetching submodel payload");
        let response = check_status(endpoint, get(&self.client, endpoint).await?)?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| IrsError::Transport(format!("{endpoint}: failed to read body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Semantics hub
// ---------------------------------------------------------------------------

/// Resolves JSON schemas at `{base}/models/{urn}/json-schema`.
pub struct SemanticsHubClient {
    client: Client,
    base_url: String,
}

impl SemanticsHubClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl SchemaClient for SemanticsHubClient {
    async fn get_schema(&self, urn: &str) -> Result<Value> {
        let url = endpoint(&self.base_url, &["models", urn, "json-schema"])?;
        let response = check_status(url.as_str(), get(&self.client, url.as_str()).await?)?;
        response
            .json()
            .await
            .map_err(|e| IrsError::Transport(format!("{url}: invalid schema document: {e}")))
    }
}

// ---------------------------------------------------------------------------
// BPDM
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LegalEntity {
    #[serde(default)]
    names: Vec<LegalEntityName>,
}

#[derive(Debug, Deserialize)]
struct LegalEntityName {
    value: String,
}

/// Business partner lookup at `{base}/legal-entities/{id}?idType=BPN`.
pub struct BpdmClient {
    client: Client,
    base_url: String,
}

impl BpdmClient {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl BusinessPartnerClient for BpdmClient {
    async fn lookup(&self, manufacturer_id: &str) -> Result<String> {
        let mut url = endpoint(&self.base_url, &["legal-entities", manufacturer_id])?;
        url.query_pairs_mut().append_pair("idType", "BPN");

        let response = check_status(url.as_str(), get(&self.client, url.as_str()).await?)?;
        let entity: LegalEntity = response
            .json()
            .await
            .map_err(|e| IrsError::Transport(format!("{url}: invalid legal entity: {e}")))?;

        entity
            .names
            .into_iter()
            .next()
            .map(|name| name.value)
            .ok_or_else(|| IrsError::NotFound(format!("no name for business partner {manufacturer_id}")))
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Delivers callbacks as HTTP GET on the expanded URL.
pub struct HttpCallbackNotifier {
    client: Client,
}

impl HttpCallbackNotifier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallbackNotifier for HttpCallbackNotifier {
    async fn notify(&self, event: &CallbackEvent) -> Result<()> {
        let url = event.resolved_url();
        debug!(%url, state = %event.state, "delivering callback");
        let response = get(&self.client, &url).await?;
        if !response.status().is_success() {
            return Err(IrsError::Transport(format!("{url}: HTTP {}", response.status())));
        }
        Ok(())
    }
}
