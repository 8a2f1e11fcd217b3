//! Caller IPC: HTTP/1.1 over the daemon's Unix socket.
//!
//! The thin compiler wrapper POSTs a serialized compile request to `/exec`
//! and blocks on the response. Peer identity is checked against the
//! daemon's own uid before any bytes are parsed. `/healthz` answers
//! liveness probes from wrappers that time out on long compiles; `/status`
//! serves owner-thread task snapshots as JSON.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use eyre::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lx_io::net::Listener;
use lx_proto::CompileRequest;
use lx_runtime::Priority;
use tracing::{debug, info, warn};

use crate::service::Service;
use crate::task::{CancelFlag, CompileTask};

/// Accept loop. Runs until the listener errors out.
pub async fn serve(service: Arc<Service>, listener: Listener) -> Result<()> {
    #[cfg(unix)]
    let my_uid = unsafe { libc::getuid() };

    info!(endpoint = %listener.local_addr()?, "ipc listening");

    loop {
        let (stream, peer) = listener.accept().await?;

        #[cfg(unix)]
        if let Some(peer_uid) = stream.peer_uid() {
            if peer_uid != my_uid {
                warn!(peer_uid, "rejecting ipc connection from foreign uid");
                continue;
            }
        }

        let service = service.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let handler = service_fn(move |req| handle(service.clone(), req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, handler)
                .await
            {
                debug!(peer = %peer, error = %e, "ipc connection closed");
            }
        });
    }
}

/// Marks the task canceled if the response future is dropped before the
/// reply went out — which is exactly what happens when the caller's socket
/// closes mid-compile.
struct CancelOnDrop {
    flag: CancelFlag,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: CancelFlag) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}

async fn handle(
    service: Arc<Service>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),
        (Method::GET, "/status") => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(service.status_json())))
            .expect("static response"),
        (Method::POST, "/exec") => handle_exec(service, req).await,
        (Method::POST, "/quitquitquit") => {
            info!("shutdown requested over ipc");
            service.request_quit();
            text_response(StatusCode::OK, "quitting")
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn handle_exec(service: Arc<Service>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return text_response(StatusCode::BAD_REQUEST, &format!("bad request body: {e}"));
        }
    };

    let Some(request) = CompileRequest::from_bytes(&body) else {
        return text_response(StatusCode::BAD_REQUEST, "malformed compile request");
    };

    let cancel = CancelFlag::new();
    let guard = CancelOnDrop::new(cancel.clone());
    let task = CompileTask::new(service.clone(), request, cancel);
    debug!(trace = %task.trace_id(), "compile task accepted");

    // the task lives on a pool worker, not on this connection: if the
    // caller goes away the guard flags cancellation but the task still
    // finishes and populates caches
    let (tx, rx) = tokio::sync::oneshot::channel();
    service.pool.run(Priority::Low, move || {
        tokio::task::spawn_local(async move {
            let response = task.run().await;
            let _ = tx.send(response);
        });
    });

    match rx.await {
        Ok(response) => {
            guard.disarm();
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "binary/x-protocol-buffer")
                .body(Full::new(Bytes::from(response.to_bytes())))
                .expect("static response")
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "compile task lost"),
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response")
}
