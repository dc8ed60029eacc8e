//! Asset id to fetchable URL.

use crate::model::Asset;

/// Builds the URL the device (and the pre-fetcher) fetch an asset from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetUrlResolver {
    /// Signed original-file URL on the photo server.
    Immich { base_url: String, api_key: String },
    /// URL on the embedded static server, carrying the per-process token.
    Local { origin: String, token: String },
}

impl AssetUrlResolver {
    pub fn immich(base_url: &str, api_key: &str) -> Self {
        Self::Immich {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn local(origin: &str, token: &str) -> Self {
        Self::Local {
            origin: origin.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn resolve(&self, asset: &Asset) -> String {
        match self {
            Self::Immich { base_url, api_key } => format!(
                "{}/api/assets/{}/original?apiKey={}",
                base_url,
                urlencoding::encode(&asset.id),
                urlencoding::encode(api_key)
            ),
            Self::Local { origin, token } => {
                let path = asset
                    .id
                    .split('/')
                    .map(|segment| urlencoding::encode(segment).into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                format!("{}/{}?key={}", origin, path, urlencoding::encode(token))
            }
        }
    }

    /// Whether a content id currently on the device could have come from us.
    /// Local URLs match on scheme and host only, since the server port and
    /// token change between runs.
    pub fn is_own_content(&self, content_id: &str) -> bool {
        match self {
            Self::Immich { base_url, .. } => {
                !base_url.is_empty()
                    && content_id
                        .strip_prefix(base_url.as_str())
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            }
            Self::Local { origin, .. } => {
                let host = origin_without_port(origin);
                !host.is_empty()
                    && content_id.strip_prefix(host).is_some_and(|rest| {
                        let rest = match rest.strip_prefix(':') {
                            Some(port) => port.trim_start_matches(|ch: char| ch.is_ascii_digit()),
                            None => rest,
                        };
                        rest.is_empty() || rest.starts_with('/')
                    })
            }
        }
    }
}

/// `http://host:8123` -> `http://host`; IPv6 brackets are kept.
fn origin_without_port(origin: &str) -> &str {
    let authority_start = origin.find("://").map_or(0, |index| index + 3);
    let authority_end = origin[authority_start..]
        .find('/')
        .map_or(origin.len(), |index| authority_start + index);
    let authority = &origin[authority_start..authority_end];
    match authority.rfind(':') {
        Some(colon)
            if !authority[colon..].contains(']')
                && authority[colon + 1..].chars().all(|ch| ch.is_ascii_digit()) =>
        {
            &origin[..authority_start + colon]
        }
        _ => &origin[..authority_end],
    }
}
