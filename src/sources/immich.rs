//! Immich photo-management API source backed by `ureq`.

use std::time::Duration;

use log::debug;
use serde_json::Value;

use crate::error::SourceError;
use crate::model::Asset;
use crate::sources::{buckets_by_year, AssetSource, BucketRef, GroupRef};

pub struct ImmichSource {
    http_client: ureq::Agent,
    base_url: String,
    api_key: String,
}

impl ImmichSource {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(30))
            .timeout_write(Duration::from_secs(15))
            .build();
        Self {
            http_client,
            base_url: endpoint_base(base_url),
            api_key: api_key.to_string(),
        }
    }

    fn request_json(&self, path: &str) -> Result<Value, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .get(&url)
            .set("Accept", "application/json")
            .set("x-api-key", &self.api_key)
            .call()
            .map_err(|err| SourceError::Http {
                url: url.clone(),
                message: match err {
                    ureq::Error::Status(code, _) => format!("HTTP status {code}"),
                    ureq::Error::Transport(transport) => transport.to_string(),
                },
            })?;
        response.into_json().map_err(|err| SourceError::Malformed {
            url,
            message: err.to_string(),
        })
    }
}

pub fn endpoint_base(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

/// Parses the `GET /api/albums` payload into groups.
pub fn parse_albums(payload: &Value) -> Result<Vec<GroupRef>, String> {
    let albums = payload
        .as_array()
        .ok_or_else(|| "album listing is not an array".to_string())?;
    albums
        .iter()
        .map(|album| {
            let id = album
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| "album without string id".to_string())?;
            let name = album
                .get("albumName")
                .and_then(Value::as_str)
                .ok_or_else(|| format!("album '{id}' without string albumName"))?;
            Ok(GroupRef {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

/// Year buckets of the album listing. Only bracketed `[YYYY]` album names
/// carry a year here.
pub fn album_buckets(payload: &Value) -> Result<Vec<BucketRef>, String> {
    Ok(buckets_by_year(parse_albums(payload)?, false))
}

/// Parses the `GET /api/albums/{id}` payload, keeping only allow-listed images.
pub fn parse_album_assets(payload: &Value) -> Result<Vec<Asset>, String> {
    let assets = payload
        .get("assets")
        .and_then(Value::as_array)
        .ok_or_else(|| "album payload without assets array".to_string())?;
    let mut result = Vec::with_capacity(assets.len());
    for asset in assets {
        let id = asset
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| "asset without string id".to_string())?;
        let mime = asset
            .get("originalMimeType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match Asset::from_mime(id, mime) {
            Some(parsed) => result.push(parsed),
            None => debug!("Ignoring unsupported asset '{}' ({})", id, mime),
        }
    }
    Ok(result)
}

impl AssetSource for ImmichSource {
    fn list_buckets(&self) -> Result<Vec<BucketRef>, SourceError> {
        let path = "/api/albums";
        let payload = self.request_json(path)?;
        album_buckets(&payload).map_err(|message| SourceError::Malformed {
            url: format!("{}{}", self.base_url, path),
            message,
        })
    }

    fn list_assets(&self, group: &GroupRef) -> Result<Vec<Asset>, SourceError> {
        let path = format!("/api/albums/{}", urlencoding::encode(&group.id));
        let payload = self.request_json(&path)?;
        parse_album_assets(&payload).map_err(|message| SourceError::Malformed {
            url: format!("{}{}", self.base_url, path),
            message,
        })
    }

    fn describe(&self) -> String {
        format!("Immich at {}", self.base_url)
    }
}
