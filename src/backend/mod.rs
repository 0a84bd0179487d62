//! Listing service integration.
//!
//! Defines the `ListingBackend` trait consumed by the announcer and the
//! matcher, the tagged `BackendResponse` every call resolves to, and the
//! request payloads. The reqwest implementation lives in `http`.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::listing::AssetForListing;
use crate::types::{AppId, Asset, AssetType, ListedUser, SetPart, SteamId, TransportError};

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Outcome of a backend call that reached the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendResponse<T> {
    Success(T),
    /// Accepted as a background job; poll with the given id.
    Pending(Uuid),
    Redirect { location: Option<String> },
    ClientRejected(StatusCode),
    ServerError(StatusCode),
}

/// `Err` is a network-class failure: nothing (or nothing usable) came back.
pub type BackendResult<T> = Result<BackendResponse<T>, TransportError>;

/// The non-success arm of a `BackendResponse`, detached from its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    Redirect { location: Option<String> },
    ClientRejected(StatusCode),
    ServerError(StatusCode),
}

impl<T> BackendResponse<T> {
    pub fn refusal(&self) -> Option<Refusal> {
        match self {
            BackendResponse::Success(_) | BackendResponse::Pending(_) => None,
            BackendResponse::Redirect { location } => Some(Refusal::Redirect {
                location: location.clone(),
            }),
            BackendResponse::ClientRejected(status) => Some(Refusal::ClientRejected(*status)),
            BackendResponse::ServerError(status) => Some(Refusal::ServerError(*status)),
        }
    }
}

impl Refusal {
    /// The session cookie expired and the service bounced us to its login page.
    pub fn is_login_redirect(&self) -> bool {
        matches!(self, Refusal::Redirect { location: Some(location) }
            if location.to_ascii_lowercase().contains("login"))
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Refusal::Redirect { .. } => None,
            Refusal::ClientRejected(status) | Refusal::ServerError(status) => Some(*status),
        }
    }
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refusal::Redirect { location } => {
                write!(f, "redirect to {}", location.as_deref().unwrap_or("<none>"))
            }
            Refusal::ClientRejected(status) => write!(f, "client rejected ({status})"),
            Refusal::ServerError(status) => write!(f, "server error ({status})"),
        }
    }
}

/// Status of a background job on the listing service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus<T> {
    pub request_id: Uuid,
    pub finished: bool,
    pub result: Option<T>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseStatus {
    pub active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Full listing announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementRequest {
    pub steam_id: SteamId,
    pub trade_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_hash: Option<String>,
    pub matchable_types: Vec<AssetType>,
    pub match_everything: bool,
    pub max_trade_hold_duration: u8,
    /// Size of the whole inventory snapshot, not just the listing.
    pub total_inventory_count: u32,
    pub inventory: Vec<AssetForListing>,
    pub inventory_checksum: String,
}

/// Incremental announcement against a previously accepted listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementDiffRequest {
    /// `inventory` holds only added or changed assets here.
    #[serde(flatten)]
    pub announcement: AnnouncementRequest,
    pub inventory_removed: Vec<AssetForListing>,
    pub previous_inventory_checksum: String,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Remote listing service: announcements, heartbeats, set membership and
/// candidate discovery.
#[async_trait]
pub trait ListingBackend: Send + Sync {
    /// Authenticate `steam_id` with the service for this process lifetime.
    async fn sign_in(&self, steam_id: SteamId) -> BackendResult<()>;

    async fn announce(&self, request: &AnnouncementRequest) -> BackendResult<()>;

    async fn announce_diff(&self, request: &AnnouncementDiffRequest) -> BackendResult<()>;

    async fn poll_announcement(&self, steam_id: SteamId, job_id: Uuid)
        -> BackendResult<JobStatus<()>>;

    /// Canonical membership of every set of the given types and apps.
    async fn get_set_parts(
        &self,
        steam_id: SteamId,
        types: &[AssetType],
        app_ids: &[AppId],
    ) -> BackendResult<Vec<SetPart>>;

    async fn get_listed_users_for_matching(
        &self,
        steam_id: SteamId,
        trade_token: &str,
        assets: &[Asset],
        types: &[AssetType],
    ) -> BackendResult<Vec<ListedUser>>;

    async fn heart_beat(&self, steam_id: SteamId) -> BackendResult<()>;

    async fn get_license_status(&self) -> BackendResult<LicenseStatus>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
