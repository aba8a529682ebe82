use std::convert::Infallible;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use opentelemetry::trace::TraceContextExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::pin;
use tracing::{debug, error, info, instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

mod error;
mod handlers;
pub mod listeners;
mod request_ext;
mod response_body;
mod router;
mod server_context;

pub use error::Error;
pub use listeners::ServiceListener;
pub use response_body::ResponseBody;
pub use router::Route;
pub use server_context::ServerContext;

use crate::metrics_provider::METRICS_PROVIDER;

pub async fn serve_request<S>(
    stream: TokioIo<S>,
    context: Arc<ServerContext>,
    timeouts: Arc<[Duration; 2]>,
    remote_address: SocketAddr,
) where
    S: Unpin + AsyncWrite + AsyncRead + Send + Debug + 'static,
{
    let conn = http1::Builder::new().serve_connection(
        stream,
        service_fn(move |request| handle_request(Arc::clone(&context), request)),
    );
    pin!(conn);

    METRICS_PROVIDER.metric_http_request_in_flight.inc();

    for (iter, sleep_duration) in timeouts.iter().enumerate() {
        debug!("iter = {iter} sleep_duration = {sleep_duration:?}");
        tokio::select! {
            res = conn.as_mut() => {
                match res {
                    Ok(()) => debug!("Connection from {remote_address} closed"),
                    Err(error) => debug!("Error serving connection from {remote_address}: {error}"),
                }
                break;
            }
            () = tokio::time::sleep(*sleep_duration) => {
                debug!("iter = {iter} got timeout_interval, calling conn.graceful_shutdown");
                conn.as_mut().graceful_shutdown();
            }
        }
    }

    METRICS_PROVIDER.metric_http_request_in_flight.dec();
}

#[instrument(skip(context, request))]
async fn handle_request(
    context: Arc<ServerContext>,
    request: Request<Incoming>,
) -> Result<Response<ResponseBody>, Infallible> {
    let start_time = Instant::now();
    let method = request.method().to_owned();
    let path = request.uri().path().to_owned();

    let trace_id = {
        let context = Span::current().context();
        let span = context.span();
        let span_context = span.span_context();
        if span_context.is_valid() {
            Some(span_context.trace_id().to_string())
        } else {
            None
        }
    };

    let (parts, _incoming) = request.into_parts();
    let response = match dispatch_route(&context, &parts).await {
        Ok(response) => response,
        Err(error) => error_to_response(&error, trace_id.as_ref()),
    };

    #[allow(clippy::cast_precision_loss)]
    let elapsed = start_time.elapsed().as_millis() as f64;
    let status = response.status();

    METRICS_PROVIDER.metric_http_request_total.inc();
    METRICS_PROVIDER
        .metric_http_request_duration
        .observe(elapsed);

    let log = if let Some(trace_id) = trace_id {
        format!("{trace_id} {elapsed:?} - {status} {method} {path}")
    } else {
        format!("{elapsed:?} - {status} {method} {path}")
    };

    if status.is_server_error() {
        error!("{log}");
    } else {
        info!("{log}");
    }

    Ok(response)
}

#[instrument(skip(context, parts))]
async fn dispatch_route(
    context: &ServerContext,
    parts: &Parts,
) -> Result<Response<ResponseBody>, Error> {
    let route = router::parse(&parts.method, &parts.uri);
    debug!("Dispatching {}", route.action_name());
    let with_body = parts.method != Method::HEAD;

    match route {
        Route::Unknown => {
            let msg = format!("unknown route: {} {}", parts.method, parts.uri);
            Err(Error::NotFound(msg))
        }
        Route::Unsupported => {
            let msg = format!("{} {}", parts.method, parts.uri.path());
            Err(Error::Unsupported(msg))
        }
        Route::ApiVersion => handlers::handle_api_version(context, parts, with_body),
        Route::Auth => handlers::handle_auth(),
        Route::GetManifest {
            namespace,
            reference,
        }
        | Route::HeadManifest {
            namespace,
            reference,
        } => handlers::handle_get_manifest(context, parts, namespace, reference, with_body).await,
        Route::GetBlob { namespace, digest } | Route::HeadBlob { namespace, digest } => {
            handlers::handle_get_blob(context, parts, namespace, &digest, with_body).await
        }
        Route::Healthz => handlers::handle_healthz(),
        Route::Metrics => handlers::handle_metrics(),
    }
}

pub fn error_to_response(error: &Error, request_id: Option<&String>) -> Response<ResponseBody> {
    let body = error.as_json(request_id).to_string();

    let mut response = Response::new(ResponseBody::fixed(body));
    *response.status_mut() = error.status_code();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
