//! The caller IPC surface, driven the way the thin wrapper drives it: a
//! raw HTTP/1.1 POST over the Unix socket.

#![cfg(unix)]

mod harness;

use harness::{object_responder, MockRemote, TestEnv};
use lx_daemon::ipc;
use lx_io::net::{connect, Endpoint, Listener};
use lx_proto::ExecResponse;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Send one HTTP/1.1 request over the socket and return the raw response.
async fn roundtrip(endpoint: &Endpoint, request: &[u8]) -> Vec<u8> {
    let mut stream = connect(endpoint).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

fn body_of(response: &[u8]) -> &[u8] {
    let pos = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    &response[pos + 4..]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exec_over_unix_socket() {
    let env = TestEnv::new();
    env.write("a.c", "int main() { return 0; }\n");

    let remote = MockRemote::start(object_responder(b"remote-object")).await;
    let service = env.service(&remote.endpoint).await;

    let sock = Endpoint::Unix(env.cwd.join("ipc.sock"));
    let listener = Listener::bind(&sock).await.unwrap();
    tokio::spawn(ipc::serve(service, listener));

    let body = env.compile_request("a.c", "a.o").to_bytes();
    let request = format!(
        "POST /exec HTTP/1.1\r\n\
         Host: 0.0.0.0\r\n\
         User-Agent: lxcc\r\n\
         Content-Type: binary/x-protocol-buffer\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    let mut raw = request.into_bytes();
    raw.extend_from_slice(&body);

    let response = roundtrip(&sock, &raw).await;
    let head = String::from_utf8_lossy(&response[..32]).to_string();
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

    let exec = ExecResponse::from_bytes(body_of(&response)).expect("decode exec response");
    assert_eq!(exec.exit_code, 0);
    assert_eq!(env.read("a.o").as_deref(), Some("remote-object"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthz_and_status_answer() {
    let env = TestEnv::new();
    let remote = MockRemote::start(object_responder(b"x")).await;
    let service = env.service(&remote.endpoint).await;

    let sock = Endpoint::Unix(env.cwd.join("ipc.sock"));
    let listener = Listener::bind(&sock).await.unwrap();
    tokio::spawn(ipc::serve(service, listener));

    let response = roundtrip(
        &sock,
        b"GET /healthz?pid=4242 HTTP/1.1\r\nHost: 0.0.0.0\r\nConnection: close\r\n\r\n",
    )
    .await;
    let text = String::from_utf8_lossy(&response).to_string();
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.ends_with("ok"));

    let response = roundtrip(
        &sock,
        b"GET /status HTTP/1.1\r\nHost: 0.0.0.0\r\nConnection: close\r\n\r\n",
    )
    .await;
    let text = String::from_utf8_lossy(&response).to_string();
    assert!(text.starts_with("HTTP/1.1 200"));
    // no tasks yet: an empty JSON list
    assert!(text.trim_end().ends_with("[]"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_request_is_rejected() {
    let env = TestEnv::new();
    let remote = MockRemote::start(object_responder(b"x")).await;
    let service = env.service(&remote.endpoint).await;

    let sock = Endpoint::Unix(env.cwd.join("ipc.sock"));
    let listener = Listener::bind(&sock).await.unwrap();
    tokio::spawn(ipc::serve(service, listener));

    let response = roundtrip(
        &sock,
        b"POST /exec HTTP/1.1\r\nHost: 0.0.0.0\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot-a-req",
    )
    .await;
    let text = String::from_utf8_lossy(&response).to_string();
    assert!(text.starts_with("HTTP/1.1 400"));
}
