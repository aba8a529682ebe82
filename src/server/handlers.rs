use std::io::SeekFrom;

use chrono::Utc;
use hyper::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, RANGE, WWW_AUTHENTICATE,
};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument};

use crate::cache::{self, PullRequest};
use crate::metrics_provider::METRICS_PROVIDER;
use crate::oci::Digest;
use crate::server::error::Error;
use crate::server::request_ext::{HeaderExt, X_REGISTRY};
use crate::server::response_body::ResponseBody;
use crate::server::ServerContext;

pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
pub const DOCKER_DISTRIBUTION_API_VERSION: &str = "Docker-Distribution-Api-Version";
const API_VERSION: &str = "registry/2.0";
const AUTH_TOKEN: &str = "pullthrough-anonymous";

/// Splits a request namespace into the upstream host and the repository
/// path on that host.
pub fn resolve_upstream<'a>(
    parts: &Parts,
    default_upstream: &str,
    namespace: &'a str,
) -> (String, &'a str) {
    if let Some(host) = parts
        .get_header(&X_REGISTRY)
        .or_else(|| parts.namespace_query())
    {
        return (host, namespace);
    }

    match namespace.split_once('/') {
        Some((host, repository)) if host.contains('.') => (host.to_string(), repository),
        _ => (default_upstream.to_string(), namespace),
    }
}

fn pull_request(
    context: &ServerContext,
    parts: &Parts,
    namespace: &str,
    reference: &str,
) -> Result<PullRequest, Error> {
    let (host, repository) = resolve_upstream(parts, &context.default_upstream, namespace);
    let separator = if reference.starts_with("sha256:") {
        '@'
    } else {
        ':'
    };

    let url = format!("{host}/{repository}{separator}{reference}");
    Ok(PullRequest::parse(&url)?)
}

#[instrument(skip(context, parts))]
pub async fn handle_get_manifest(
    context: &ServerContext,
    parts: &Parts,
    namespace: &str,
    reference: &str,
    with_body: bool,
) -> Result<Response<ResponseBody>, Error> {
    let pull_request = pull_request(context, parts, namespace, reference)?;
    let holder = context
        .coordinator
        .get_manifest(&pull_request, false)
        .await?;

    if let Some(digest) = pull_request.digest() {
        if holder.digest != digest {
            debug!("Requested {digest}, cache holds {}", holder.digest);
            return Err(cache::Error::NotFound.into());
        }
    }

    let body = if with_body {
        ResponseBody::fixed(holder.bytes.clone())
    } else {
        ResponseBody::empty()
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, holder.media_type.as_str())
        .header(DOCKER_CONTENT_DIGEST, holder.digest.to_string())
        .header(CONTENT_LENGTH, holder.bytes.len())
        .header(DOCKER_DISTRIBUTION_API_VERSION, API_VERSION)
        .body(body)?;

    Ok(response)
}

fn blob_error(error: cache::Error) -> Error {
    match error {
        cache::Error::NotFound => Error::blob_unknown(),
        error => error.into(),
    }
}

#[instrument(skip(context, parts))]
pub async fn handle_get_blob(
    context: &ServerContext,
    parts: &Parts,
    namespace: &str,
    digest: &Digest,
    with_body: bool,
) -> Result<Response<ResponseBody>, Error> {
    let range = if with_body { parts.range(RANGE)? } else { None };

    let (mut file, size) = context
        .coordinator
        .get_blob(digest)
        .await
        .map_err(blob_error)?;

    let builder = Response::builder()
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(ACCEPT_RANGES, "bytes")
        .header(ETAG, format!("\"{digest}\""))
        .header(DOCKER_CONTENT_DIGEST, digest.to_string());

    let response = match range {
        Some((start, end)) => {
            if start >= size {
                let msg = format!("Range start {start} is beyond blob size {size}");
                return Err(Error::RangeNotSatisfiable(msg));
            }

            let end = end.map_or(size - 1, |end| end.min(size - 1));
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start)).await?;

            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(CONTENT_RANGE, format!("bytes {start}-{end}/{size}"))
                .header(CONTENT_LENGTH, length)
                .body(ResponseBody::streaming(file.take(length)))?
        }
        None if with_body => builder
            .status(StatusCode::OK)
            .header(CONTENT_LENGTH, size)
            .body(ResponseBody::streaming(file))?,
        None => builder
            .status(StatusCode::OK)
            .header(CONTENT_LENGTH, size)
            .body(ResponseBody::empty())?,
    };

    Ok(response)
}

pub fn handle_api_version(
    context: &ServerContext,
    parts: &Parts,
    with_body: bool,
) -> Result<Response<ResponseBody>, Error> {
    let host = parts.host().unwrap_or_else(|| "localhost".to_string());
    let challenge = format!(
        r#"Bearer realm="{}://{host}/v2/auth",service="{host}""#,
        context.scheme()
    );

    let body = if with_body {
        ResponseBody::fixed("{}")
    } else {
        ResponseBody::empty()
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .header(WWW_AUTHENTICATE, challenge)
        .header(DOCKER_DISTRIBUTION_API_VERSION, API_VERSION)
        .body(body)?;

    Ok(response)
}

/// Hands out a fixed token; later requests are never checked against it.
pub fn handle_auth() -> Result<Response<ResponseBody>, Error> {
    let body = json!({
        "token": AUTH_TOKEN,
        "access_token": AUTH_TOKEN,
        "expires_in": 3600,
        "issued_at": Utc::now().to_rfc3339(),
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(ResponseBody::fixed(body.to_string()))?;

    Ok(response)
}

pub fn handle_healthz() -> Result<Response<ResponseBody>, Error> {
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(ResponseBody::fixed(r#"{"status":"ok"}"#))?;

    Ok(response)
}

pub fn handle_metrics() -> Result<Response<ResponseBody>, Error> {
    let (content_type, metrics) = METRICS_PROVIDER.gather()?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .body(ResponseBody::fixed(metrics))?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_resolve_upstream_order() {
        let request = parts(
            "/v2/ghcr.io/org/app/manifests/v1?ns=quay.io",
            &[("x-registry", "registry.local:5000")],
        );
        assert_eq!(
            resolve_upstream(&request, "docker.io", "org/app"),
            ("registry.local:5000".to_string(), "org/app")
        );

        let request = parts("/v2/org/app/manifests/v1?ns=quay.io", &[]);
        assert_eq!(
            resolve_upstream(&request, "docker.io", "org/app"),
            ("quay.io".to_string(), "org/app")
        );

        let request = parts("/v2/ghcr.io/org/app/manifests/v1", &[]);
        assert_eq!(
            resolve_upstream(&request, "docker.io", "ghcr.io/org/app"),
            ("ghcr.io".to_string(), "org/app")
        );

        let request = parts("/v2/library/hello-world/manifests/latest", &[]);
        assert_eq!(
            resolve_upstream(&request, "docker.io", "library/hello-world"),
            ("docker.io".to_string(), "library/hello-world")
        );

        let request = parts("/v2/hello-world/manifests/latest", &[]);
        assert_eq!(
            resolve_upstream(&request, "docker.io", "hello-world"),
            ("docker.io".to_string(), "hello-world")
        );
    }

    #[test]
    fn test_handle_healthz() {
        let response = handle_healthz().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_handle_auth() {
        let response = handle_auth().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_handle_metrics() {
        let response = handle_metrics().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));
    }
}
