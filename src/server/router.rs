use std::str::FromStr;

use hyper::{Method, Uri};

use crate::oci::Digest;

/// Requests understood by the pull-through server.
#[derive(Debug, PartialEq)]
pub enum Route<'a> {
    Unknown,
    Unsupported,
    ApiVersion,
    Auth,
    GetManifest {
        namespace: &'a str,
        reference: &'a str,
    },
    HeadManifest {
        namespace: &'a str,
        reference: &'a str,
    },
    GetBlob {
        namespace: &'a str,
        digest: Digest,
    },
    HeadBlob {
        namespace: &'a str,
        digest: Digest,
    },
    Healthz,
    Metrics,
}

impl Route<'_> {
    pub fn action_name(&self) -> &'static str {
        match self {
            Route::Unknown => "unknown",
            Route::Unsupported => "unsupported",
            Route::ApiVersion => "get-api-version",
            Route::Auth => "get-auth-token",
            Route::GetManifest { .. } => "get-manifest",
            Route::HeadManifest { .. } => "head-manifest",
            Route::GetBlob { .. } => "get-blob",
            Route::HeadBlob { .. } => "head-blob",
            Route::Healthz => "healthz",
            Route::Metrics => "metrics",
        }
    }
}

fn is_read(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

pub fn parse<'a>(method: &Method, uri: &'a Uri) -> Route<'a> {
    let path = uri.path();

    match path {
        "/healthz" if method == Method::GET => return Route::Healthz,
        "/metrics" if method == Method::GET => return Route::Metrics,
        "/v2" | "/v2/" if is_read(method) => return Route::ApiVersion,
        "/v2/auth" if method == Method::GET => return Route::Auth,
        _ => {}
    }

    let Some(path) = path.strip_prefix("/v2/") else {
        return Route::Unknown;
    };

    // Push, upload, tag listing and referrers are not served
    if !is_read(method)
        || path.contains("/blobs/uploads")
        || path.ends_with("/tags/list")
        || path.contains("/referrers/")
        || path == "_catalog"
    {
        return Route::Unsupported;
    }

    if let Some(route) = try_find_blobs(method, path) {
        return route;
    }

    if let Some(route) = try_find_manifests(method, path) {
        return route;
    }

    Route::Unknown
}

fn try_find_blobs<'a>(method: &Method, path: &'a str) -> Option<Route<'a>> {
    let blob_position = path.rfind("/blobs/")?;
    let namespace = &path[..blob_position];

    let digest = &path[blob_position + "/blobs/".len()..];
    let digest = Digest::from_str(digest).ok()?;

    match *method {
        Method::GET => Some(Route::GetBlob { namespace, digest }),
        Method::HEAD => Some(Route::HeadBlob { namespace, digest }),
        _ => None,
    }
}

fn try_find_manifests<'a>(method: &Method, path: &'a str) -> Option<Route<'a>> {
    let manifest_position = path.rfind("/manifests/")?;
    let namespace = &path[..manifest_position];
    let reference = &path[manifest_position + "/manifests/".len()..];

    if namespace.is_empty() || reference.is_empty() {
        return None;
    }

    match *method {
        Method::GET => Some(Route::GetManifest {
            namespace,
            reference,
        }),
        Method::HEAD => Some(Route::HeadManifest {
            namespace,
            reference,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:d2c94e258dcb3c5ac2798d32e1249e42ef01cba4841c2234249495f87264ac5a";

    fn route(method: Method, path: &str) -> String {
        let uri: Uri = path.parse().unwrap();
        format!("{:?}", parse(&method, &uri))
    }

    #[test]
    fn test_fixed_routes() {
        let uri: Uri = "/v2/".parse().unwrap();
        assert_eq!(parse(&Method::GET, &uri), Route::ApiVersion);
        assert_eq!(parse(&Method::HEAD, &uri), Route::ApiVersion);

        let uri: Uri = "/v2".parse().unwrap();
        assert_eq!(parse(&Method::GET, &uri), Route::ApiVersion);

        let uri: Uri = "/v2/auth?scope=repository:a:pull".parse().unwrap();
        assert_eq!(parse(&Method::GET, &uri), Route::Auth);

        let uri: Uri = "/healthz".parse().unwrap();
        assert_eq!(parse(&Method::GET, &uri), Route::Healthz);

        let uri: Uri = "/metrics".parse().unwrap();
        assert_eq!(parse(&Method::GET, &uri), Route::Metrics);

        let uri: Uri = "/favicon.ico".parse().unwrap();
        assert_eq!(parse(&Method::GET, &uri), Route::Unknown);
    }

    #[test]
    fn test_manifest_routes() {
        for (path, namespace) in [
            ("/v2/hello-world/manifests/latest", "hello-world"),
            ("/v2/library/hello-world/manifests/latest", "library/hello-world"),
            ("/v2/ghcr.io/org/image/manifests/latest", "ghcr.io/org/image"),
        ] {
            let uri: Uri = path.parse().unwrap();
            assert_eq!(
                parse(&Method::GET, &uri),
                Route::GetManifest {
                    namespace,
                    reference: "latest"
                }
            );
            assert_eq!(
                parse(&Method::HEAD, &uri),
                Route::HeadManifest {
                    namespace,
                    reference: "latest"
                }
            );
        }

        let path = format!("/v2/library/hello-world/manifests/{DIGEST}");
        let uri: Uri = path.parse().unwrap();
        assert_eq!(
            parse(&Method::GET, &uri),
            Route::GetManifest {
                namespace: "library/hello-world",
                reference: DIGEST
            }
        );
    }

    #[test]
    fn test_blob_routes() {
        let path = format!("/v2/ghcr.io/org/image/blobs/{DIGEST}");
        let uri: Uri = path.parse().unwrap();
        assert_eq!(
            parse(&Method::GET, &uri),
            Route::GetBlob {
                namespace: "ghcr.io/org/image",
                digest: Digest::from_str(DIGEST).unwrap()
            }
        );
        assert_eq!(
            parse(&Method::HEAD, &uri),
            Route::HeadBlob {
                namespace: "ghcr.io/org/image",
                digest: Digest::from_str(DIGEST).unwrap()
            }
        );

        assert_eq!(route(Method::GET, "/v2/image/blobs/not-a-digest"), "Unknown");
    }

    #[test]
    fn test_unsupported_routes() {
        for (method, path) in [
            (Method::PUT, "/v2/library/app/manifests/latest"),
            (Method::DELETE, "/v2/library/app/manifests/latest"),
            (Method::POST, "/v2/library/app/blobs/uploads/"),
            (Method::PATCH, "/v2/library/app/blobs/uploads/1234"),
            (Method::GET, "/v2/library/app/blobs/uploads/1234"),
            (Method::GET, "/v2/library/app/tags/list"),
            (Method::GET, &format!("/v2/library/app/referrers/{DIGEST}")),
            (Method::GET, "/v2/_catalog"),
        ] {
            assert_eq!(route(method, path), "Unsupported", "{path}");
        }
    }

    #[test]
    fn test_action_names() {
        assert_eq!(Route::ApiVersion.action_name(), "get-api-version");
        assert_eq!(Route::Unsupported.action_name(), "unsupported");
        assert_eq!(
            Route::GetManifest {
                namespace: "a",
                reference: "b"
            }
            .action_name(),
            "get-manifest"
        );
    }
}
