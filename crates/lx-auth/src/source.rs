//! Token acquisition strategies.
//!
//! Each variant knows how to build its token request and parse its token
//! response; the refresh driver in `lib.rs` is one implementation
//! parameterized by the variant.

use camino::Utf8PathBuf;
use facet::Facet;

use crate::AuthError;

/// The four supported credential configurations. Exactly one is chosen at
/// daemon startup; precedence is GCE service account, service-account key
/// file, LUCI local auth, then a refresh-token config file.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Fetch from the GCE metadata server for the given account.
    GceMetadata { account: String },
    /// Sign a JWT with a service-account private key and exchange it.
    ServiceAccountJwt {
        key_file: Utf8PathBuf,
        scope: String,
    },
    /// Exchange a long-lived OAuth2 refresh token.
    RefreshToken { config_file: Utf8PathBuf },
    /// Ask the LUCI local auth server on localhost.
    LuciLocalAuth {
        context_file: Utf8PathBuf,
        scope: String,
    },
}

/// A prepared token request. Built fresh for every attempt: the JWT carries
/// its own timestamps.
#[derive(Debug)]
pub struct TokenRequest {
    pub method: hyper::Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

/// A successfully parsed token.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Facet)]
struct OAuthTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Facet)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: Option<String>,
}

#[derive(Debug, Facet)]
struct RefreshTokenConfig {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_uri: Option<String>,
}

#[derive(Debug, Facet)]
struct LuciContext {
    local_auth: LuciLocalAuthBlock,
}

#[derive(Debug, Facet)]
struct LuciLocalAuthBlock {
    rpc_port: u16,
    secret: String,
    default_account_id: Option<String>,
}

#[derive(Debug, Facet)]
struct LuciTokenRequest {
    scopes: Vec<String>,
    secret: String,
    account_id: String,
}

#[derive(Debug, Facet)]
struct LuciTokenResponse {
    error_code: Option<i32>,
    error_message: Option<String>,
    access_token: Option<String>,
    /// Absolute expiry, seconds since the epoch
    expiry: Option<u64>,
}

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

impl TokenSource {
    pub fn describe(&self) -> &'static str {
        match self {
            TokenSource::GceMetadata { .. } => "gce-metadata",
            TokenSource::ServiceAccountJwt { .. } => "service-account-jwt",
            TokenSource::RefreshToken { .. } => "refresh-token",
            TokenSource::LuciLocalAuth { .. } => "luci-local-auth",
        }
    }

    /// Build the token request for one refresh attempt.
    pub fn request(&self) -> Result<TokenRequest, AuthError> {
        match self {
            TokenSource::GceMetadata { account } => Ok(TokenRequest {
                method: hyper::Method::GET,
                url: format!(
                    "http://metadata/computeMetadata/v1/instance/service-accounts/{account}/token"
                ),
                headers: vec![("Metadata-Flavor", "Google".to_string())],
                content_type: None,
                body: Vec::new(),
            }),

            TokenSource::ServiceAccountJwt { key_file, scope } => {
                let raw = std::fs::read_to_string(key_file).map_err(|e| {
                    AuthError::Config(format!("cannot read service account key {key_file}: {e}"))
                })?;
                let key: ServiceAccountKey = facet_json::from_str(&raw).map_err(|e| {
                    AuthError::Config(format!("malformed service account key {key_file}: {e}"))
                })?;
                let token_uri = key
                    .token_uri
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());

                let assertion =
                    crate::jwt::build_signed_jwt(&key.client_email, &key.private_key, scope, &token_uri)?;

                let body = format!(
                    "grant_type={}&assertion={}",
                    form_encode("urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    form_encode(&assertion),
                );

                Ok(TokenRequest {
                    method: hyper::Method::POST,
                    url: token_uri,
                    headers: vec![],
                    content_type: Some("application/x-www-form-urlencoded"),
                    body: body.into_bytes(),
                })
            }

            TokenSource::RefreshToken { config_file } => {
                let raw = std::fs::read_to_string(config_file).map_err(|e| {
                    AuthError::Config(format!("cannot read oauth2 config {config_file}: {e}"))
                })?;
                let config: RefreshTokenConfig = facet_json::from_str(&raw).map_err(|e| {
                    AuthError::Config(format!("malformed oauth2 config {config_file}: {e}"))
                })?;

                let body = format!(
                    "client_id={}&client_secret={}&refresh_token={}&grant_type=refresh_token",
                    form_encode(&config.client_id),
                    form_encode(&config.client_secret),
                    form_encode(&config.refresh_token),
                );

                Ok(TokenRequest {
                    method: hyper::Method::POST,
                    url: config
                        .token_uri
                        .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
                    headers: vec![],
                    content_type: Some("application/x-www-form-urlencoded"),
                    body: body.into_bytes(),
                })
            }

            TokenSource::LuciLocalAuth {
                context_file,
                scope,
            } => {
                let raw = std::fs::read_to_string(context_file).map_err(|e| {
                    AuthError::Config(format!("cannot read LUCI_CONTEXT {context_file}: {e}"))
                })?;
                let context: LuciContext = facet_json::from_str(&raw).map_err(|e| {
                    AuthError::Config(format!("malformed LUCI_CONTEXT {context_file}: {e}"))
                })?;

                let request = LuciTokenRequest {
                    scopes: vec![scope.clone()],
                    secret: context.local_auth.secret,
                    account_id: context.local_auth.default_account_id.unwrap_or_default(),
                };

                Ok(TokenRequest {
                    method: hyper::Method::POST,
                    url: format!(
                        "http://127.0.0.1:{}/rpc/LuciLocalAuthService.GetOAuthToken",
                        context.local_auth.rpc_port
                    ),
                    headers: vec![],
                    content_type: Some("application/json"),
                    body: facet_json::to_string(&request).into_bytes(),
                })
            }
        }
    }

    /// Parse a token endpoint response body.
    pub fn parse_response(&self, body: &[u8]) -> Result<ParsedToken, AuthError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| AuthError::Parse("token response is not UTF-8".to_string()))?;

        match self {
            TokenSource::LuciLocalAuth { .. } => {
                let response: LuciTokenResponse = facet_json::from_str(text)
                    .map_err(|e| AuthError::Parse(format!("LUCI token response: {e}")))?;
                if let Some(code) = response.error_code {
                    if code != 0 {
                        return Err(AuthError::Rejected(format!(
                            "LUCI auth error {code}: {}",
                            response.error_message.unwrap_or_default()
                        )));
                    }
                }
                let access_token = response
                    .access_token
                    .ok_or_else(|| AuthError::Parse("LUCI response without token".to_string()))?;
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let expires_in_secs = response.expiry.unwrap_or(now).saturating_sub(now);
                Ok(ParsedToken {
                    access_token,
                    token_type: "Bearer".to_string(),
                    expires_in_secs,
                })
            }
            _ => {
                let response: OAuthTokenResponse = facet_json::from_str(text)
                    .map_err(|e| AuthError::Parse(format!("token response: {e}")))?;
                Ok(ParsedToken {
                    access_token: response.access_token,
                    token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
                    expires_in_secs: response.expires_in.unwrap_or(0),
                })
            }
        }
    }
}

/// Percent-encode a form value (RFC 3986 unreserved set passes through).
fn form_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
