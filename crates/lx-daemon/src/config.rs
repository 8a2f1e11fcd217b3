//! Daemon configuration from the `LYNX_*` environment namespace.
//!
//! Read once at startup into a plain struct; nothing else in the daemon
//! touches the environment.

use std::time::Duration;

use camino::Utf8PathBuf;
use eyre::Result;
use lx_auth::TokenSource;
use lx_http::HttpRpcOptions;

#[derive(Debug, Clone)]
pub struct Config {
    /// Daemon home: IPC socket, output cache, logs
    pub home: Utf8PathBuf,
    /// Remote endpoint, e.g. `https://exec.example.com`
    pub server_endpoint: String,
    /// Request path prefix on the endpoint
    pub server_path: String,
    /// Run the local compiler when the remote path fails
    pub fallback: bool,
    /// Start the local compiler in parallel and race it against the remote
    pub race_local: bool,
    /// Download remote outputs and byte-compare against a local compile
    pub verify_output: bool,
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub rpc_deadline: Duration,
    pub worker_threads: usize,
    pub max_subprocs: usize,
    pub max_heavy_subprocs: usize,
    pub deps_cache_max_entries: usize,
    pub output_cache_dir: Utf8PathBuf,
    pub output_cache_max_bytes: u64,
    pub oauth2_scope: String,
    pub credentials: Option<TokenSource>,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_string(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_string(name).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";

impl Config {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self> {
        let home = match env_string("LYNX_HOME") {
            Some(home) => Utf8PathBuf::from(home),
            None => {
                let home = std::env::var("HOME").map_err(|_| eyre::eyre!("HOME not set"))?;
                Utf8PathBuf::from(home).join(".lynx")
            }
        };

        let host = env_string("LYNX_SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = env_parse("LYNX_SERVER_PORT", 443);
        let use_ssl = env_bool("LYNX_USE_SSL", true);
        let scheme = if use_ssl { "https" } else { "http" };

        let scope = env_string("LYNX_OAUTH2_SCOPE").unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        let credentials = Self::select_credentials(&scope);

        Ok(Self {
            output_cache_dir: env_string("LYNX_OUTPUT_CACHE_DIR")
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| home.join("output-cache")),
            home,
            server_endpoint: format!("{scheme}://{host}:{port}"),
            server_path: env_string("LYNX_SERVER_PATH").unwrap_or_else(|| "/exec".to_string()),
            fallback: env_bool("LYNX_FALLBACK", true),
            race_local: env_bool("LYNX_RACE_LOCAL", false),
            verify_output: env_bool("LYNX_VERIFY_OUTPUT", false),
            max_retries: env_parse("LYNX_MAX_RETRIES", 5),
            min_backoff: Duration::from_millis(env_parse("LYNX_MIN_BACKOFF_MS", 500)),
            max_backoff: Duration::from_millis(env_parse("LYNX_MAX_BACKOFF_MS", 60_000)),
            rpc_deadline: Duration::from_secs(env_parse("LYNX_RPC_DEADLINE_SECS", 300)),
            worker_threads: env_parse("LYNX_WORKER_THREADS", default_workers()),
            max_subprocs: env_parse("LYNX_MAX_SUBPROCS", default_workers()),
            max_heavy_subprocs: env_parse("LYNX_MAX_SUBPROCS_HEAVY", 1),
            deps_cache_max_entries: env_parse("LYNX_DEPS_CACHE_MAX_ENTRIES", 4096),
            output_cache_max_bytes: env_parse(
                "LYNX_OUTPUT_CACHE_MAX_BYTES",
                4u64 * 1024 * 1024 * 1024,
            ),
            oauth2_scope: scope,
            credentials,
        })
    }

    /// Pick the credential source; precedence mirrors the list order of the
    /// supported configurations.
    fn select_credentials(scope: &str) -> Option<TokenSource> {
        if let Some(account) = env_string("LYNX_GCE_SERVICE_ACCOUNT") {
            return Some(TokenSource::GceMetadata { account });
        }
        if let Some(key_file) = env_string("LYNX_SERVICE_ACCOUNT_JSON_FILE") {
            return Some(TokenSource::ServiceAccountJwt {
                key_file: Utf8PathBuf::from(key_file),
                scope: scope.to_string(),
            });
        }
        if let Some(context_file) = env_string("LUCI_CONTEXT") {
            return Some(TokenSource::LuciLocalAuth {
                context_file: Utf8PathBuf::from(context_file),
                scope: scope.to_string(),
            });
        }
        if let Some(config_file) = env_string("LYNX_OAUTH2_CONFIG_FILE") {
            return Some(TokenSource::RefreshToken {
                config_file: Utf8PathBuf::from(config_file),
            });
        }
        None
    }

    pub fn http_options(&self) -> HttpRpcOptions {
        HttpRpcOptions {
            endpoint: self.server_endpoint.clone(),
            max_retries: self.max_retries,
            min_backoff: self.min_backoff,
            max_backoff: self.max_backoff,
            deadline: self.rpc_deadline,
            ..Default::default()
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
