//! Test harness: an isolated daemon service wired to a mock remote
//! execution endpoint and a fake local compiler.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use camino::Utf8PathBuf;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use lx_daemon::config::Config;
use lx_daemon::service::Service;
use lx_proto::{CompileRequest, CompilerIdentity, ContentHash, ExecRequest, ExecResponse, RequesterInfo};

/// A mock remote exec endpoint.
pub struct MockRemote {
    pub endpoint: String,
    hits: Arc<AtomicU32>,
}

type Responder = dyn Fn(ExecRequest) -> ExecResponse + Send + Sync + 'static;

impl MockRemote {
    /// Start a server that feeds every `/exec` request to `responder`.
    pub async fn start(responder: impl Fn(ExecRequest) -> ExecResponse + Send + Sync + 'static) -> Self {
        Self::start_inner(Arc::new(responder), None, Duration::ZERO).await
    }

    /// Like [`MockRemote::start`], but each response is held back by
    /// `delay` first (for race tests).
    pub async fn start_with_delay(
        delay: Duration,
        responder: impl Fn(ExecRequest) -> ExecResponse + Send + Sync + 'static,
    ) -> Self {
        Self::start_inner(Arc::new(responder), None, delay).await
    }

    /// Start a server that answers every request with the given HTTP status.
    pub async fn start_failing(status: u16) -> Self {
        Self::start_inner(
            Arc::new(|_| unreachable!("failing server")),
            Some(status),
            Duration::ZERO,
        )
        .await
    }

    async fn start_inner(
        responder: Arc<Responder>,
        fail_status: Option<u16>,
        delay: Duration,
    ) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_accept = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let responder = responder.clone();
                let hits = hits_accept.clone();

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let handler = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let responder = responder.clone();
                        let hits = hits.clone();
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            if let Some(status) = fail_status {
                                return Ok::<_, std::convert::Infallible>(
                                    hyper::Response::builder()
                                        .status(status)
                                        .body(Full::new(Bytes::new()))
                                        .unwrap(),
                                );
                            }
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            let exec_request =
                                ExecRequest::from_bytes(&body).expect("decode exec request");
                            let response = responder(exec_request);
                            Ok(hyper::Response::builder()
                                .status(200)
                                .body(Full::new(Bytes::from(response.to_bytes())))
                                .unwrap())
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, handler)
                        .await;
                });
            }
        });

        Self {
            endpoint: format!("http://{addr}"),
            hits,
        }
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

/// An isolated compile environment: project dir, fake compiler, service.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub cwd: Utf8PathBuf,
    pub compiler: CompilerIdentity,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        // fake compiler: writes a known object to the -o target
        let script = "#!/bin/sh\n\
                      out=\"\"\n\
                      while [ $# -gt 0 ]; do\n\
                        case \"$1\" in\n\
                          -o) out=\"$2\"; shift 2 ;;\n\
                          *) shift ;;\n\
                        esac\n\
                      done\n\
                      echo \"local compile\"\n\
                      [ -n \"$out\" ] && printf 'local-object' > \"$out\"\n\
                      exit 0\n";
        let compiler_path = cwd.join("fakecc");
        std::fs::write(&compiler_path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&compiler_path, std::fs::Permissions::from_mode(0o755))
                .unwrap();
        }

        let compiler = CompilerIdentity {
            path: compiler_path.to_string(),
            content_hash: ContentHash::of_bytes(script.as_bytes()),
            version: "fakecc 1.0".to_string(),
        };

        Self { dir, cwd, compiler }
    }

    /// Replace the fake compiler with a custom script, updating the
    /// request identity hash to match.
    pub fn set_compiler_script(&mut self, script: &str) {
        let path = self.cwd.join("fakecc");
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        self.compiler.content_hash = ContentHash::of_bytes(script.as_bytes());
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.cwd.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.cwd.join(rel)).ok()
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.cwd.join(rel).exists()
    }

    /// A compile request for `fakecc -c <source> -o <output>`.
    pub fn compile_request(&self, source: &str, output: &str) -> CompileRequest {
        CompileRequest {
            compiler: self.compiler.clone(),
            cwd: self.cwd.to_string(),
            args: vec![
                "fakecc".to_string(),
                "-c".to_string(),
                source.to_string(),
                "-o".to_string(),
                output.to_string(),
            ],
            env: vec![],
            declared_inputs: vec![],
            expected_outputs: vec![output.to_string()],
            requester: RequesterInfo { uid: 1000, pid: 4242 },
        }
    }

    /// Build a service wired to `endpoint` with test-friendly timeouts.
    pub async fn service(&self, endpoint: &str) -> Arc<Service> {
        self.service_with(endpoint, |_| {}).await
    }

    pub async fn service_with(
        &self,
        endpoint: &str,
        tweak: impl FnOnce(&mut Config),
    ) -> Arc<Service> {
        let mut config = Config {
            home: self.cwd.join(".lynx"),
            server_endpoint: endpoint.to_string(),
            server_path: "/exec".to_string(),
            fallback: true,
            race_local: false,
            verify_output: false,
            max_retries: 1,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            rpc_deadline: Duration::from_secs(30),
            worker_threads: 2,
            max_subprocs: 4,
            max_heavy_subprocs: 1,
            deps_cache_max_entries: 64,
            output_cache_dir: self.cwd.join(".lynx/output-cache"),
            output_cache_max_bytes: 1 << 20,
            oauth2_scope: String::new(),
            credentials: None,
        };
        tweak(&mut config);
        Service::new(config).await.unwrap()
    }
}

/// A remote responder that "compiles" by returning fixed object bytes for
/// every expected output.
pub fn object_responder(bytes: &'static [u8]) -> impl Fn(ExecRequest) -> ExecResponse {
    move |request: ExecRequest| ExecResponse {
        exit_code: 0,
        stdout: String::new(),
        stderr: String::new(),
        cache_hit: lx_proto::CacheHit::Miss,
        outputs: request
            .expected_outputs
            .iter()
            .map(|o| lx_proto::OutputBlob {
                path: o.path.clone(),
                content_hash: ContentHash::of_bytes(bytes),
                executable: false,
                content: bytes.to_vec(),
            })
            .collect(),
        error: None,
    }
}
