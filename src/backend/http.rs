//! reqwest client for the listing service.
//!
//! Redirects are never followed: a redirect to the login page means the
//! session cookie expired and must surface as `BackendResponse::Redirect`.
//! Matching endpoints authenticate with the `X-License-Key` header.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::{redirect::Policy, Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    AnnouncementDiffRequest, AnnouncementRequest, BackendResponse, BackendResult, JobStatus,
    LicenseStatus, ListingBackend,
};
use crate::types::{AppId, Asset, AssetInInventory, AssetType, ListedUser, SetPart, SteamId, TransportError};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Envelope of every JSON body the service returns.
#[derive(Debug, Deserialize)]
struct GenericResponse<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct BackgroundTask {
    request_id: Uuid,
}

#[derive(Serialize)]
struct Identified<'a, B: Serialize> {
    guid: Uuid,
    #[serde(flatten)]
    body: &'a B,
}

#[derive(Serialize)]
struct SteamIdBody {
    steam_id: SteamId,
}

#[derive(Serialize)]
struct JobStatusBody {
    steam_id: SteamId,
    request_id: Uuid,
}

#[derive(Serialize)]
struct SetPartsBody<'a> {
    steam_id: SteamId,
    matchable_types: &'a [AssetType],
    real_app_ids: &'a [AppId],
}

#[derive(Serialize)]
struct InventoriesBody<'a> {
    steam_id: SteamId,
    trade_token: &'a str,
    inventory: Vec<AssetInInventory>,
    matchable_types: &'a [AssetType],
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP implementation of `ListingBackend`.
pub struct ListingClient {
    http: Client,
    base_url: String,
    /// Per-process identifier sent with every request.
    identifier: Uuid,
    license_key: Option<SecretString>,
}

impl ListingClient {
    pub fn new(base_url: &str, license_key: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .cookie_store(true)
            .user_agent(concat!("items-matcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client for listing service")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            identifier: Uuid::new_v4(),
            license_key,
        })
    }

    // -- Internal helpers ------------------------------------------------

    async fn post<B, T>(&self, path: &str, body: &B, licensed: bool) -> BackendResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Default,
    {
        let url = format!("{}{path}", self.base_url);

        debug!(url = %url, "Calling listing service");

        let mut request = self.http.post(&url).json(&Identified {
            guid: self.identifier,
            body,
        });

        if licensed {
            if let Some(key) = &self.license_key {
                request = request.header("X-License-Key", key.expose_secret().as_str());
            }
        }

        let response = request.send().await?;

        Self::classify(response).await
    }

    async fn classify<T>(response: Response) -> BackendResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let status = response.status();

        trace!(status = %status, "Listing service responded");

        if status == StatusCode::ACCEPTED {
            let body: GenericResponse<BackgroundTask> = Self::decode(response).await?;

            return match body.result {
                Some(task) => Ok(BackendResponse::Pending(task.request_id)),
                None => Err(TransportError::Decode("accepted job without request id".into())),
            };
        }

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            return Ok(BackendResponse::Redirect { location });
        }

        if status.is_client_error() {
            return Ok(BackendResponse::ClientRejected(status));
        }

        if status.is_server_error() {
            return Ok(BackendResponse::ServerError(status));
        }

        let body: GenericResponse<T> = Self::decode(response).await?;

        if !body.success {
            debug!(message = ?body.message, "Listing service reported failure in a 2xx body");
        }

        Ok(BackendResponse::Success(body.result.unwrap_or_default()))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<GenericResponse<T>, TransportError> {
        let bytes = response.bytes().await?;

        if bytes.is_empty() {
            return Ok(GenericResponse {
                success: true,
                message: None,
                result: None,
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ListingBackend for ListingClient {
    async fn sign_in(&self, steam_id: SteamId) -> BackendResult<()> {
        self.post("/Api/Auth/SignIn", &SteamIdBody { steam_id }, false).await
    }

    async fn announce(&self, request: &AnnouncementRequest) -> BackendResult<()> {
        self.post("/Api/Listing/Announce", request, false).await
    }

    async fn announce_diff(&self, request: &AnnouncementDiffRequest) -> BackendResult<()> {
        self.post("/Api/Listing/AnnounceDiff", request, false).await
    }

    async fn poll_announcement(
        &self,
        steam_id: SteamId,
        job_id: Uuid,
    ) -> BackendResult<JobStatus<()>> {
        let body = JobStatusBody {
            steam_id,
            request_id: job_id,
        };

        self.post("/Api/Listing/AnnouncementStatus", &body, false).await
    }

    async fn get_set_parts(
        &self,
        steam_id: SteamId,
        types: &[AssetType],
        app_ids: &[AppId],
    ) -> BackendResult<Vec<SetPart>> {
        let body = SetPartsBody {
            steam_id,
            matchable_types: types,
            real_app_ids: app_ids,
        };

        self.post("/Api/SetParts/Request", &body, false).await
    }

    async fn get_listed_users_for_matching(
        &self,
        steam_id: SteamId,
        trade_token: &str,
        assets: &[Asset],
        types: &[AssetType],
    ) -> BackendResult<Vec<ListedUser>> {
        let body = InventoriesBody {
            steam_id,
            trade_token,
            inventory: assets.iter().map(AssetInInventory::from).collect(),
            matchable_types: types,
        };

        self.post("/Api/Listing/Inventories", &body, true).await
    }

    async fn heart_beat(&self, steam_id: SteamId) -> BackendResult<()> {
        self.post("/Api/Listing/HeartBeat", &SteamIdBody { steam_id }, false).await
    }

    async fn get_license_status(&self) -> BackendResult<LicenseStatus> {
        if self.license_key.is_none() {
            return Ok(BackendResponse::Success(LicenseStatus::default()));
        }

        self.post("/Api/Licenses/Status", &serde_json::Map::new(), true).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
