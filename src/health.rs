//! Liveness endpoint
//!
//! One HTTP route, `GET /_ping`, answering `Running`. Used only for
//! health checking; it carries no container semantics.

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::Result;

async fn ping(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let mut response = if req.uri().path() == "/_ping" {
        Response::new(Full::new(Bytes::from_static(b"Running")))
    } else {
        let mut not_found = Response::new(Full::new(Bytes::new()));
        *not_found.status_mut() = StatusCode::NOT_FOUND;
        not_found
    };
    response
        .headers_mut()
        .insert("content-type", hyper::header::HeaderValue::from_static("text/plain"));
    Ok(response)
}

/// Start the health webserver in the background
///
/// Binds before returning so startup failures surface to the caller;
/// serving then runs on its own task.
pub async fn start_webserver(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoint listening on http://{}/_ping", addr);

    tokio::spawn(async move {
        let http = ConnBuilder::new(TokioExecutor::new());
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let http = http.clone();
                    tokio::spawn(async move {
                        let conn = http.serve_connection(TokioIo::new(socket), service_fn(ping));
                        if let Err(e) = conn.await {
                            debug!("Health connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Health endpoint failed to accept connection: {}", e);
                }
            }
        }
    });

    Ok(())
}
