//! Identity and resource-management clients.
//!
//! [`authenticate`] performs the OAuth2 client-credentials grant against
//! the Active Directory token endpoint.  The resulting [`BearerToken`] is
//! attached to every call made by [`ManagementClients`]: a resource group
//! client (so `--location` can place a missing group) and a storage account
//! client (to fetch the account key for data-plane calls).
//!
//! Authentication is never retried.  A rejected secret will not start
//! working on the second attempt.

use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AzureConfig;
use crate::credentials::Credentials;
use crate::errors::{PushError, RemoteError};

/// Resource manager API version for resource groups.
const RESOURCE_GROUPS_API_VERSION: &str = "2021-04-01";

/// Resource manager API version for storage accounts.
const STORAGE_ACCOUNTS_API_VERSION: &str = "2023-01-01";

/// Access token returned by the identity endpoint.
#[derive(Clone)]
pub struct BearerToken {
    access_token: String,
    expires_in: Duration,
}

impl BearerToken {
    pub fn new(access_token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
        }
    }

    /// `Authorization` header value.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("access_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

/// `expires_in` arrives as a number from the v2 endpoint and as a string
/// from some older authorities.
fn parse_expires_in(value: Option<&serde_json::Value>) -> u64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(3600),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(3600),
        _ => 3600,
    }
}

fn token_url(endpoints: &AzureConfig, tenant_id: &str) -> String {
    format!(
        "{}/{}/oauth2/v2.0/token",
        endpoints.active_directory_endpoint.trim_end_matches('/'),
        tenant_id
    )
}

fn management_scope(endpoints: &AzureConfig) -> String {
    format!(
        "{}/.default",
        endpoints.resource_manager_endpoint.trim_end_matches('/')
    )
}

fn build_http_client(endpoints: &AzureConfig) -> Result<reqwest::Client, PushError> {
    reqwest::Client::builder()
        .timeout(endpoints.http_timeout())
        .build()
        .map_err(|e| PushError::Configuration(format!("failed to create HTTP client: {}", e)))
}

/// Exchange the service principal secret for a management bearer token.
pub async fn authenticate(
    endpoints: &AzureConfig,
    credentials: &Credentials,
) -> Result<BearerToken, PushError> {
    let client = build_http_client(endpoints)?;
    let url = token_url(endpoints, &credentials.tenant_id);
    let scope = management_scope(endpoints);

    debug!("Requesting token from {}", url);

    let resp = client
        .post(&url)
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("scope", scope.as_str()),
        ])
        .send()
        .await
        .map_err(|e| {
            PushError::Authentication(RemoteError::transport("identity", "token", e).into())
        })?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(PushError::Authentication(
            RemoteError::http("identity", "token", status, body).into(),
        ));
    }

    let token: TokenResponse = resp.json().await.map_err(|e| {
        PushError::Authentication(anyhow::anyhow!("malformed token response: {}", e))
    })?;
    let expires_in = parse_expires_in(token.expires_in.as_ref());

    info!(
        "Authenticated service principal {} (token valid for {}s)",
        credentials.client_id, expires_in
    );

    Ok(BearerToken::new(
        token.access_token,
        Duration::from_secs(expires_in),
    ))
}

// -- Management clients -------------------------------------------------------

/// Shared plumbing for authorized resource manager calls.
#[derive(Clone)]
struct ArmClient {
    client: reqwest::Client,
    base_url: String,
    subscription_id: String,
    token: BearerToken,
}

impl ArmClient {
    fn subscription_url(&self, path: &str, api_version: &str) -> String {
        format!(
            "{}/subscriptions/{}/{}?api-version={}",
            self.base_url, self.subscription_id, path, api_version
        )
    }

    async fn check(
        operation: &'static str,
        resp: reqwest::Response,
    ) -> anyhow::Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteError::http("management", operation, status, body).into())
    }
}

/// Authorized handles for the resource manager.
#[derive(Clone)]
pub struct ManagementClients {
    pub groups: ResourceGroupsClient,
    pub accounts: StorageAccountsClient,
}

impl std::fmt::Debug for ManagementClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementClients").finish_non_exhaustive()
    }
}

impl ManagementClients {
    /// Build both clients around `token`. Makes no network calls.
    pub fn new(
        subscription_id: &str,
        token: BearerToken,
        endpoints: &AzureConfig,
    ) -> Result<Self, PushError> {
        let arm = ArmClient {
            client: build_http_client(endpoints)?,
            base_url: endpoints
                .resource_manager_endpoint
                .trim_end_matches('/')
                .to_string(),
            subscription_id: subscription_id.to_string(),
            token,
        };
        Ok(Self {
            groups: ResourceGroupsClient { arm: arm.clone() },
            accounts: StorageAccountsClient { arm },
        })
    }
}

/// Result of [`ResourceGroupsClient::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    /// The group already existed and was left untouched.
    Existing { location: Option<String> },
    /// The group was missing and has been created.
    Created,
    /// The principal may not read the group. The account key lookup decides.
    Unverified,
}

/// Next step after a resource group lookup returned `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupAction {
    Keep,
    Create,
    Skip,
    Fail,
}

fn lookup_action(status: reqwest::StatusCode) -> LookupAction {
    match status.as_u16() {
        200..=299 => LookupAction::Keep,
        404 => LookupAction::Create,
        403 => LookupAction::Skip,
        _ => LookupAction::Fail,
    }
}

#[derive(Debug, Deserialize)]
struct ResourceGroupBody {
    #[serde(default)]
    location: Option<String>,
}

/// Resource group operations.
#[derive(Clone)]
pub struct ResourceGroupsClient {
    arm: ArmClient,
}

impl ResourceGroupsClient {
    fn group_url(&self, name: &str) -> String {
        self.arm.subscription_url(
            &format!("resourcegroups/{}", name),
            RESOURCE_GROUPS_API_VERSION,
        )
    }

    /// Make sure the resource group exists.
    ///
    /// An existing group is never updated, so its region need not match
    /// `location`. Only a missing group is created, in `location`.
    pub async fn ensure(&self, name: &str, location: &str) -> anyhow::Result<GroupOutcome> {
        let resp = self
            .arm
            .client
            .get(self.group_url(name))
            .header("Authorization", self.arm.token.header_value())
            .send()
            .await
            .map_err(|e| RemoteError::transport("management", "get_resource_group", e))?;

        match lookup_action(resp.status()) {
            LookupAction::Keep => {
                let body: ResourceGroupBody = resp.json().await.unwrap_or(ResourceGroupBody {
                    location: None,
                });
                info!(
                    "Resource group {} exists in {}",
                    name,
                    body.location.as_deref().unwrap_or("an unreported location")
                );
                Ok(GroupOutcome::Existing {
                    location: body.location,
                })
            }
            LookupAction::Create => {
                self.create(name, location).await?;
                Ok(GroupOutcome::Created)
            }
            LookupAction::Skip => {
                warn!(
                    "Not allowed to read resource group {}; assuming it exists",
                    name
                );
                Ok(GroupOutcome::Unverified)
            }
            LookupAction::Fail => {
                ArmClient::check("get_resource_group", resp).await?;
                Err(anyhow::anyhow!("unexpected resource group lookup status"))
            }
        }
    }

    /// Create the resource group in `location`.
    pub async fn create(&self, name: &str, location: &str) -> anyhow::Result<()> {
        debug!("Creating resource group {} in {}", name, location);

        let resp = self
            .arm
            .client
            .put(self.group_url(name))
            .header("Authorization", self.arm.token.header_value())
            .json(&serde_json::json!({ "location": location }))
            .send()
            .await
            .map_err(|e| RemoteError::transport("management", "create_resource_group", e))?;
        ArmClient::check("create_resource_group", resp).await?;

        info!("Resource group {} created in {}", name, location);
        Ok(())
    }
}

/// One storage account access key.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageAccountKey {
    #[serde(rename = "keyName")]
    pub key_name: String,
    pub value: String,
    #[serde(default)]
    pub permissions: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    keys: Vec<StorageAccountKey>,
}

/// Storage account operations.
#[derive(Clone)]
pub struct StorageAccountsClient {
    arm: ArmClient,
}

impl StorageAccountsClient {
    /// List the access keys of `account` in `resource_group`.
    pub async fn list_keys(
        &self,
        resource_group: &str,
        account: &str,
    ) -> anyhow::Result<Vec<StorageAccountKey>> {
        let url = self.arm.subscription_url(
            &format!(
                "resourceGroups/{}/providers/Microsoft.Storage/storageAccounts/{}/listKeys",
                resource_group, account
            ),
            STORAGE_ACCOUNTS_API_VERSION,
        );
        debug!("Listing keys for storage account {}", account);

        let resp = self
            .arm
            .client
            .post(&url)
            .header("Authorization", self.arm.token.header_value())
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| RemoteError::transport("management", "list_keys", e))?;
        let resp = ArmClient::check("list_keys", resp).await?;

        let parsed: ListKeysResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("malformed listKeys response: {}", e))?;
        Ok(parsed.keys)
    }

    /// First key of `account`, which authorizes the data-plane client.
    pub async fn primary_key(&self, resource_group: &str, account: &str) -> anyhow::Result<String> {
        let keys = self.list_keys(resource_group, account).await?;
        keys.into_iter()
            .next()
            .map(|k| k.value)
            .ok_or_else(|| anyhow::anyhow!("storage account {} has no access keys", account))
    }
}

// -- Tests -------------------------------------------------------------------
