use crate::cache::{ManifestHolder, PullRequest};
use crate::configuration::RegistryConfig;
use crate::oci::{Digest, ACCEPTED_MANIFEST_TYPES};
use crate::upstream::auth_scheme::AuthenticationScheme;
use crate::upstream::bearer_token::BearerToken;
use crate::upstream::registry::{default_client, HttpClient, UpstreamRegistry};
use crate::upstream::token_cache::TokenCache;
use crate::upstream::{Error, Upstream};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use hyper::http::uri::PathAndQuery;
use hyper::{Method, Request, Response, StatusCode, Uri};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

const MAX_REDIRECT: u8 = 5;

/// Upstream fetcher backed by the per-registry options of the configuration.
pub struct RegistryClient {
    registries: ArcSwap<HashMap<String, Arc<UpstreamRegistry>>>,
    shared_client: HttpClient,
    tokens: TokenCache,
}

impl RegistryClient {
    pub fn new(configs: &[RegistryConfig]) -> Result<Self, Error> {
        let shared_client = default_client()?;
        let registries = Self::build_registries(configs, &shared_client)?;

        Ok(Self {
            registries: ArcSwap::from_pointee(registries),
            shared_client,
            tokens: TokenCache::new(),
        })
    }

    fn build_registries(
        configs: &[RegistryConfig],
        shared_client: &HttpClient,
    ) -> Result<HashMap<String, Arc<UpstreamRegistry>>, Error> {
        configs
            .iter()
            .map(|config| {
                let registry = UpstreamRegistry::new(config.clone(), shared_client)?;
                Ok((config.name.clone(), Arc::new(registry)))
            })
            .collect()
    }

    /// Replaces the per-registry options; in-flight requests keep the
    /// options they started with.
    pub fn update_registries(&self, configs: &[RegistryConfig]) -> Result<(), Error> {
        let registries = Self::build_registries(configs, &self.shared_client)?;
        self.registries.store(Arc::new(registries));
        info!("Upstream registry options reloaded");
        Ok(())
    }

    fn registry(&self, host: &str) -> Result<Arc<UpstreamRegistry>, Error> {
        if let Some(registry) = self.registries.load().get(host) {
            return Ok(registry.clone());
        }

        let registry = UpstreamRegistry::new(RegistryConfig::new(host), &self.shared_client)?;
        Ok(Arc::new(registry))
    }

    fn token_key(registry: &UpstreamRegistry, repository: &str) -> String {
        format!("{}/{repository}", registry.config.endpoint())
    }

    async fn authorization(&self, registry: &UpstreamRegistry, repository: &str) -> Option<String> {
        if let Some(token) = &registry.config.token {
            return Some(format!("Bearer {token}"));
        }
        self.tokens
            .retrieve(&Self::token_key(registry, repository))
            .await
    }

    /// Sends a request to the registry, authenticating on 401 and following
    /// redirects. Credentials are never forwarded to a redirect target.
    async fn request(
        &self,
        registry: &UpstreamRegistry,
        repository: &str,
        method: Method,
        uri: &str,
        accept: Option<&str>,
    ) -> Result<Response<Incoming>, Error> {
        let mut uri: Uri = uri
            .parse()
            .map_err(|e| Error::Transport(format!("Invalid URI '{uri}': {e}")))?;
        let mut redirects = 0;
        let mut authenticated = false;

        loop {
            let mut request = Request::builder().method(method.clone()).uri(uri.clone());
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if redirects == 0 {
                if let Some(authorization) = self.authorization(registry, repository).await {
                    request = request.header(AUTHORIZATION, authorization);
                }
            }

            debug!("{method} {uri}");
            let response = registry.client.request(request.body(Empty::new())?).await?;
            let status = response.status();

            if status.is_redirection() {
                if redirects >= MAX_REDIRECT {
                    return Err(Error::Transport(format!("Too many redirects for {uri}")));
                }

                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|location| location.to_str().ok())
                    .ok_or_else(|| Error::Transport("Missing Location header".to_string()))?;

                uri = resolve_location(&uri, location)?;
                redirects += 1;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED && !authenticated && redirects == 0 {
                let (authorization, ttl) = self.authenticate(registry, repository, &response).await?;
                self.tokens
                    .store(&Self::token_key(registry, repository), &authorization, ttl)
                    .await;
                authenticated = true;
                continue;
            }

            if !status.is_success() {
                return Err(Error::Status(status, uri.to_string()));
            }

            return Ok(response);
        }
    }

    async fn authenticate(
        &self,
        registry: &UpstreamRegistry,
        repository: &str,
        response: &Response<Incoming>,
    ) -> Result<(String, u64), Error> {
        let auth_header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| Error::Authentication("Missing WWW-Authenticate".to_string()))?;

        match AuthenticationScheme::from_www_authenticate_header(auth_header)? {
            AuthenticationScheme::Bearer(realm, mut params) => {
                params
                    .entry("scope".to_string())
                    .or_insert_with(|| format!("repository:{repository}:pull"));

                let query = serde_urlencoded::to_string(&params)
                    .map_err(|e| Error::Authentication(format!("Invalid token parameters: {e}")))?;

                let mut request = Request::builder()
                    .method(Method::GET)
                    .uri(format!("{realm}?{query}"));

                if let Some((user, pass)) = registry.basic_auth() {
                    let encoded = BASE64_STANDARD.encode(format!("{user}:{pass}"));
                    request = request.header(AUTHORIZATION, format!("Basic {encoded}"));
                }

                let token_response = registry.client.request(request.body(Empty::new())?).await?;

                if !token_response.status().is_success() {
                    return Err(Error::Authentication(format!(
                        "Token acquisition failed: {}",
                        token_response.status()
                    )));
                }

                let body = token_response.into_body().collect().await?.to_bytes();
                let bearer = BearerToken::from_slice(&body)?;
                let ttl = bearer.ttl();
                Ok((format!("Bearer {}", bearer.token()?), ttl))
            }
            AuthenticationScheme::Basic => {
                let (user, pass) = registry.basic_auth().ok_or_else(|| {
                    Error::Authentication(format!(
                        "Basic auth required by {} but not configured",
                        registry.config.name
                    ))
                })?;
                let encoded = BASE64_STANDARD.encode(format!("{user}:{pass}"));
                Ok((format!("Basic {encoded}"), 3600))
            }
        }
    }

    #[instrument(skip(self, registry, blob_dir))]
    async fn pull_blob(
        &self,
        registry: &UpstreamRegistry,
        repository: &str,
        digest: &Digest,
        blob_dir: &Path,
    ) -> Result<(), Error> {
        let uri = format!("{}/v2/{repository}/blobs/{digest}", registry.base_url());
        let response = self
            .request(registry, repository, Method::GET, &uri, None)
            .await?;

        let temp_file = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(blob_dir)?;
        let mut file = tokio::fs::File::from_std(temp_file.as_file().try_clone()?);

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            let frame = frame?;
            if let Some(data) = frame.data_ref() {
                hasher.update(data);
                file.write_all(data).await?;
                size += data.len() as u64;
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        let actual = Digest::Sha256(hex::encode(hasher.finalize().as_slice()));
        if &actual != digest {
            return Err(Error::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }

        temp_file.persist(blob_dir.join(digest.hash()))?;
        debug!("Stored blob {digest} ({size} bytes)");
        Ok(())
    }
}

fn resolve_location(current: &Uri, location: &str) -> Result<Uri, Error> {
    if location.starts_with('/') {
        let mut parts = current.clone().into_parts();
        parts.path_and_query = Some(
            location
                .parse::<PathAndQuery>()
                .map_err(hyper::http::Error::from)?,
        );
        return Ok(Uri::from_parts(parts).map_err(hyper::http::Error::from)?);
    }

    Ok(location.parse::<Uri>().map_err(hyper::http::Error::from)?)
}

#[async_trait]
impl Upstream for RegistryClient {
    #[instrument(skip(self, pull_request), fields(url = %pull_request))]
    async fn get_manifest(&self, pull_request: &PullRequest) -> Result<ManifestHolder, Error> {
        let registry = self.registry(&pull_request.remote)?;
        let repository = registry.repository(pull_request);
        let uri = format!(
            "{}/v2/{repository}/manifests/{}",
            registry.base_url(),
            pull_request.reference
        );

        let response = self
            .request(
                &registry,
                &repository,
                Method::GET,
                &uri,
                Some(&ACCEPTED_MANIFEST_TYPES.join(", ")),
            )
            .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let body = response.into_body().collect().await?.to_bytes();

        let holder = ManifestHolder::new(&pull_request.url(), content_type.as_deref(), body.to_vec())
            .map_err(|e| Error::InvalidManifest(e.to_string()))?;

        if let Some(expected) = pull_request.digest() {
            if expected != holder.digest {
                return Err(Error::DigestMismatch {
                    expected,
                    actual: holder.digest,
                });
            }
        }

        info!("Fetched {} manifest {}", holder.kind, holder.digest);
        Ok(holder)
    }

    #[instrument(skip(self, holder, blob_dir), fields(url = %holder.image_url))]
    async fn pull_blobs(&self, holder: &ManifestHolder, blob_dir: &Path) -> Result<(), Error> {
        let pull_request = PullRequest::parse(&holder.image_url)
            .map_err(|e| Error::InvalidManifest(e.to_string()))?;
        let registry = self.registry(&pull_request.remote)?;
        let repository = registry.repository(&pull_request);

        tokio::fs::create_dir_all(blob_dir).await?;

        for digest in holder.layers() {
            if tokio::fs::try_exists(blob_dir.join(digest.hash()))
                .await
                .unwrap_or(false)
            {
                debug!("Blob {digest} already cached");
                continue;
            }

            if let Err(e) = self.pull_blob(&registry, &repository, &digest, blob_dir).await {
                warn!("Failed to pull blob {digest}: {e}");
                return Err(e);
            }
        }

        Ok(())
    }
}
