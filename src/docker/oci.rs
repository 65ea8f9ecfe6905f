use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::core::{ForgeError, ForgeResult};

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const FEATURE_LAYER_MEDIA_TYPE: &str = "application/vnd.devcontainers.layer.v1+tar";

lazy_static! {
    static ref CHALLENGE_PARAM: Regex = Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge pattern is valid");
}

/// A feature reference such as `ghcr.io/devcontainers/features/git:1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureRef {
    pub registry: String,
    pub repository: String,
    /// A tag, or a `sha256:` digest.
    pub reference: String,
}

impl FeatureRef {
    /// Directory name used when staging the feature inside a container.
    pub fn staging_name(&self) -> String {
        format!("{}-{}", self.repository, self.reference)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
            .collect()
    }

    fn url(&self, kind: &str, reference: &str) -> String {
        format!("https://{}/v2/{}/{}/{}", self.registry, self.repository, kind, reference)
    }
}

impl FromStr for FeatureRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, reference) = match s.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => match s.rsplit_once(':') {
                Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
                _ => (s, "latest".to_string()),
            },
        };

        let (registry, repository) = name
            .split_once('/')
            .ok_or_else(|| format!("feature '{}' has no registry", s))?;
        if !(registry.contains('.') || registry.contains(':') || registry == "localhost") {
            return Err(format!("feature '{}' does not start with a registry host", s));
        }
        if repository.is_empty() || reference.is_empty() {
            return Err(format!("feature '{}' is incomplete", s));
        }

        Ok(FeatureRef {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference,
        })
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.reference.contains(':') { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub layers: Vec<LayerDescriptor>,
}

impl Manifest {
    /// The layer holding the feature's `install.sh`.
    pub fn feature_layer(&self) -> Option<&LayerDescriptor> {
        self.layers
            .iter()
            .find(|l| l.media_type == FEATURE_LAYER_MEDIA_TYPE)
            .or_else(|| self.layers.first())
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let params: HashMap<&str, &str> = CHALLENGE_PARAM
            .captures_iter(params)
            .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
            .collect();

        Some(BearerChallenge {
            realm: params.get("realm")?.to_string(),
            service: params.get("service").map(|s| s.to_string()),
            scope: params.get("scope").map(|s| s.to_string()),
        })
    }
}

/// Pulls feature archives from an OCI registry, anonymously or with the token the
/// registry hands out for public pulls.
#[derive(Clone, Default)]
pub struct FeatureFetcher {
    client: Client,
}

impl FeatureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Download the feature's layer, an uncompressed tar with `install.sh` at its root.
    pub async fn fetch(&self, feature: &FeatureRef) -> ForgeResult<Vec<u8>> {
        info!(feature = %feature, "Fetching feature");
        let (response, token) = self
            .get(&feature.url("manifests", &feature.reference), MANIFEST_MEDIA_TYPE, None)
            .await?;
        let manifest: Manifest = response.json().await.map_err(registry_error)?;
        let layer = manifest
            .feature_layer()
            .ok_or_else(|| ForgeError::Registry(format!("{} has no layers", feature)))?;

        let (response, _) = self
            .get(&feature.url("blobs", &layer.digest), "*/*", token)
            .await?;
        let archive = response.bytes().await.map_err(registry_error)?.to_vec();
        verify_digest(&layer.digest, &archive)?;

        debug!(feature = %feature, bytes = archive.len(), "Feature archive downloaded");
        Ok(archive)
    }

    async fn get(
        &self,
        url: &str,
        accept: &str,
        token: Option<String>,
    ) -> ForgeResult<(Response, Option<String>)> {
        let response = self.send(url, accept, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok((response.error_for_status().map_err(registry_error)?, token));
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(|| ForgeError::Registry(format!("{} requires unsupported authentication", url)))?;
        let token = self.token(&challenge).await?;

        let response = self
            .send(url, accept, Some(&token))
            .await?
            .error_for_status()
            .map_err(registry_error)?;
        Ok((response, Some(token)))
    }

    async fn send(&self, url: &str, accept: &str, token: Option<&str>) -> ForgeResult<Response> {
        let mut request = self.client.get(url).header(ACCEPT, accept);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        request.send().await.map_err(registry_error)
    }

    async fn token(&self, challenge: &BearerChallenge) -> ForgeResult<String> {
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let body = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await
            .map_err(registry_error)?
            .error_for_status()
            .map_err(registry_error)?
            .json::<HashMap<String, Value>>()
            .await
            .map_err(registry_error)?;

        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ForgeError::Registry(format!("{} returned no token", challenge.realm)))
    }
}

/// Only `sha256:` digests are checked.
pub fn verify_digest(digest: &str, content: &[u8]) -> ForgeResult<()> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        debug!(digest, "Unsupported digest algorithm, not verified");
        return Ok(());
    };
    let actual = format!("{:x}", Sha256::digest(content));
    if actual != expected {
        return Err(ForgeError::Registry(format!(
            "digest mismatch: expected {}, got sha256:{}",
            digest, actual
        )));
    }
    Ok(())
}

fn registry_error(e: reqwest::Error) -> ForgeError {
    ForgeError::Registry(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("ghcr.io/devcontainers/features/git:1", "ghcr.io", "devcontainers/features/git", "1" ; "tagged")]
    #[test_case("ghcr.io/devcontainers/features/common-utils", "ghcr.io", "devcontainers/features/common-utils", "latest" ; "untagged")]
    #[test_case("localhost:5000/features/flask:2.1", "localhost:5000", "features/flask", "2.1" ; "registry with port")]
    #[test_case("ghcr.io/acme/x@sha256:abc", "ghcr.io", "acme/x", "sha256:abc" ; "digest")]
    fn test_parse_feature_ref(raw: &str, registry: &str, repository: &str, reference: &str) {
        let parsed: FeatureRef = raw.parse().unwrap();
        assert_eq!(parsed.registry, registry);
        assert_eq!(parsed.repository, repository);
        assert_eq!(parsed.reference, reference);
    }

    #[test_case("git" ; "bare name")]
    #[test_case("devcontainers/features/git:1" ; "no registry host")]
    fn test_reject_feature_ref(raw: &str) {
        assert!(raw.parse::<FeatureRef>().is_err());
    }

    #[test]
    fn test_feature_ref_display_and_staging() {
        let git: FeatureRef = "ghcr.io/devcontainers/features/git:1".parse().unwrap();
        assert_eq!(git.to_string(), "ghcr.io/devcontainers/features/git:1");
        assert_eq!(git.staging_name(), "devcontainers-features-git-1");
        assert_eq!(
            git.url("manifests", "1"),
            "https://ghcr.io/v2/devcontainers/features/git/manifests/1"
        );

        let pinned: FeatureRef = "ghcr.io/acme/x@sha256:abc".parse().unwrap();
        assert_eq!(pinned.to_string(), "ghcr.io/acme/x@sha256:abc");
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:devcontainers/features/git:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service.as_deref(), Some("ghcr.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:devcontainers/features/git:pull")
        );

        assert!(BearerChallenge::parse(r#"Basic realm="registry""#).is_none());
        assert!(BearerChallenge::parse(r#"Bearer service="ghcr.io""#).is_none());
    }

    #[test]
    fn test_manifest_prefers_feature_layer() {
        let manifest: Manifest = serde_json::from_str(&format!(
            r#"{{"schemaVersion": 2, "layers": [
                {{"mediaType": "application/octet-stream", "digest": "sha256:aaa", "size": 1}},
                {{"mediaType": "{}", "digest": "sha256:bbb", "size": 2}}]}}"#,
            FEATURE_LAYER_MEDIA_TYPE
        ))
        .unwrap();
        assert_eq!(manifest.feature_layer().map(|l| l.digest.as_str()), Some("sha256:bbb"));

        let empty: Manifest = serde_json::from_str(r#"{"layers": []}"#).unwrap();
        assert!(empty.feature_layer().is_none());
    }

    #[test]
    fn test_verify_digest() {
        let content = b"#!/bin/sh\necho installed\n";
        let digest = format!("sha256:{:x}", Sha256::digest(content));
        assert!(verify_digest(&digest, content).is_ok());
        assert!(matches!(
            verify_digest("sha256:0000", content),
            Err(ForgeError::Registry(_))
        ));
        assert!(verify_digest("sha512:whatever", content).is_ok());
    }
}
