use std::sync::LazyLock;

use regex::Regex;
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Method, StatusCode,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{ModelpackError, ModelpackResult};

use super::{HttpTransport, ACCEPT_MANIFEST_TYPES};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static BEARER_CHALLENGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Bearer\s+realm="([^"]+)"(?:,\s*service="([^"]+)")?(?:,\s*scope="([^"]+)")?"#)
        .expect("bearer challenge pattern is valid")
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The parsed parts of a `WWW-Authenticate: Bearer …` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// The token endpoint URL. Required.
    pub realm: String,

    /// The service the token is requested for.
    pub service: Option<String>,

    /// The access scope; defaulted to `repository:<repo>:pull` when absent.
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a `WWW-Authenticate` header into its bearer parameters.
pub fn parse_bearer_challenge(header: &str) -> ModelpackResult<BearerChallenge> {
    let captures = BEARER_CHALLENGE_RE
        .captures(header)
        .ok_or_else(|| ModelpackError::AuthChallenge(header.to_string()))?;

    Ok(BearerChallenge {
        realm: captures[1].to_string(),
        service: captures.get(2).map(|m| m.as_str().to_string()),
        scope: captures.get(3).map(|m| m.as_str().to_string()),
    })
}

/// Resolves a bearer token for pulling `repository` from `registry`.
///
/// Probes the manifest endpoint without credentials first. A `200` means the
/// registry is open and the empty token is returned for reuse; a `401` is
/// expected to carry a bearer challenge whose realm is then queried for a
/// token. Any other status fails the pull.
pub async fn resolve_token(
    transport: &HttpTransport,
    registry: &str,
    repository: &str,
    reference: &str,
    cancel: &CancellationToken,
) -> ModelpackResult<String> {
    let manifest_url = format!(
        "{}/v2/{}/manifests/{}",
        registry.trim_end_matches('/'),
        repository,
        reference
    );
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT_MANIFEST_TYPES));

    let response = transport
        .execute(Method::GET, &manifest_url, headers, cancel)
        .await?;

    match response.status() {
        StatusCode::OK => Ok(String::new()),
        StatusCode::UNAUTHORIZED => {
            let challenge_header = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .ok_or_else(|| {
                    ModelpackError::AuthChallenge(
                        "missing WWW-Authenticate header for bearer challenge".to_string(),
                    )
                })?
                .to_str()
                .map_err(|_| {
                    ModelpackError::AuthChallenge(
                        "WWW-Authenticate header is not valid UTF-8".to_string(),
                    )
                })?
                .to_string();

            let challenge = parse_bearer_challenge(&challenge_header)?;
            fetch_token(transport, repository, &challenge, cancel).await
        }
        status => Err(ModelpackError::UnexpectedStatus {
            context: "probing auth",
            status,
        }),
    }
}

/// Queries a challenge's realm for a token.
async fn fetch_token(
    transport: &HttpTransport,
    repository: &str,
    challenge: &BearerChallenge,
    cancel: &CancellationToken,
) -> ModelpackResult<String> {
    let scope = match challenge.scope.as_deref() {
        Some(scope) if !scope.is_empty() => scope.to_string(),
        _ => format!("repository:{repository}:pull"),
    };

    let mut realm_url = Url::parse(&challenge.realm)
        .map_err(|e| ModelpackError::AuthChallenge(format!("invalid realm: {e}")))?;
    {
        let mut pairs = realm_url.query_pairs_mut();
        if let Some(service) = challenge.service.as_deref() {
            if !service.is_empty() {
                pairs.append_pair("service", service);
            }
        }
        pairs.append_pair("scope", &scope);
    }

    let response = transport
        .execute(Method::GET, realm_url.as_str(), HeaderMap::new(), cancel)
        .await?;
    if response.status() != StatusCode::OK {
        return Err(ModelpackError::UnexpectedStatus {
            context: "fetching token",
            status: response.status(),
        });
    }

    let token: TokenResponse = response.json().await?;
    if !token.token.is_empty() {
        Ok(token.token)
    } else if !token.access_token.is_empty() {
        Ok(token.access_token)
    } else {
        Err(ModelpackError::TokenMissing)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_challenge() {
        let header = r#"Bearer realm="https://auth.example/token",service="reg",scope="repository:library/m:pull""#;
        let challenge = parse_bearer_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.example/token");
        assert_eq!(challenge.service.as_deref(), Some("reg"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/m:pull")
        );
    }

    #[test]
    fn test_parse_realm_only_challenge() {
        let header = r#"Bearer realm="https://auth.example/token""#;
        let challenge = parse_bearer_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.example/token");
        assert!(challenge.service.is_none());
        assert!(challenge.scope.is_none());
    }

    #[test]
    fn test_parse_rejects_basic_scheme() {
        let err = parse_bearer_challenge(r#"Basic realm="classic""#).unwrap_err();
        assert!(matches!(err, ModelpackError::AuthChallenge(_)));
    }

    #[test]
    fn test_parse_rejects_missing_realm() {
        assert!(parse_bearer_challenge("Bearer error=\"denied\"").is_err());
    }

    #[test]
    fn test_token_response_prefers_token_field() {
        let parsed: TokenResponse =
            serde_json::from_str(r#"{"token":"a","access_token":"b"}"#).unwrap();
        assert_eq!(parsed.token, "a");
        assert_eq!(parsed.access_token, "b");

        let parsed: TokenResponse = serde_json::from_str(r#"{"access_token":"b"}"#).unwrap();
        assert!(parsed.token.is_empty());
        assert_eq!(parsed.access_token, "b");
    }
}
