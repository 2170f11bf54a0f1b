use std::collections::BTreeSet;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

use crate::model::{AboutSnapshot, ChangeEntry, ChangeListPage};

const DEFAULT_BASE_URL: &str = "https://drive.example.com";
const DEFAULT_PAGE_SIZE: u32 = 500;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid modification time: {0}")]
    Time(#[from] time::error::Parse),
}

impl From<reqwest::Error> for DriveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DriveError::Timeout
        } else {
            DriveError::Request(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
    page_size: u32,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self, DriveError> {
        self.http = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn get_about(&self) -> Result<AboutSnapshot, DriveError> {
        let url = self.endpoint("/v1/about")?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Lists changes with a change stamp of at least `start_change_id`.
    /// A start of 0 lists every live resource.
    pub async fn list_changes(
        &self,
        start_change_id: i64,
        page_token: Option<&str>,
    ) -> Result<ChangeListPage, DriveError> {
        let mut url = self.endpoint("/v1/changes")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("start_change_id", &start_change_id.to_string())
                .append_pair("max_results", &self.page_size.to_string());
            if let Some(token) = page_token {
                query.append_pair("page_token", token);
            }
        }
        self.get_listing(url).await
    }

    pub async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChangeListPage, DriveError> {
        let mut url = self.endpoint("/v1/files")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("parent_id", folder_id)
                .append_pair("max_results", &self.page_size.to_string());
            if let Some(token) = page_token {
                query.append_pair("page_token", token);
            }
        }
        self.get_listing(url).await
    }

    async fn get_listing(&self, url: Url) -> Result<ChangeListPage, DriveError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let payload: ListingResponse = Self::handle_response(response).await?;
        let entries = payload
            .items
            .into_iter()
            .map(RemoteChange::into_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ChangeListPage {
            entries,
            next_page_token: payload.next_page_token.filter(|token| !token.is_empty()),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            DriveError::Timeout => Some(ApiErrorClass::Transient),
            DriveError::Request(err) if err.is_connect() => Some(ApiErrorClass::Transient),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ResourceType {
    File,
    Dir,
}

#[derive(Debug, Deserialize, Serialize)]
struct RemoteChange {
    id: String,
    change_stamp: i64,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    title: String,
    #[serde(rename = "type", default)]
    resource_type: Option<ResourceType>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    modified: Option<String>,
}

impl RemoteChange {
    fn into_entry(self) -> Result<ChangeEntry, DriveError> {
        let modified = parse_modified(self.modified.as_deref())?;
        Ok(ChangeEntry {
            id: self.id,
            change_stamp: self.change_stamp,
            deleted: self.deleted,
            parent_ids: self.parents.into_iter().collect::<BTreeSet<_>>(),
            title: self.title,
            is_directory: self.resource_type == Some(ResourceType::Dir),
            content_hash: self.md5,
            modified,
        })
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct ListingResponse {
    #[serde(default)]
    items: Vec<RemoteChange>,
    #[serde(default)]
    next_page_token: Option<String>,
}

fn parse_modified(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}
