//! RS256 JWT assembly for the service-account strategy.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha256;

use crate::AuthError;

/// Build `base64url(header).base64url(claims).base64url(signature)` with
/// `exp = now + 3600`, signed with the service account's private key.
pub fn build_signed_jwt(
    client_email: &str,
    private_key_pem: &str,
    scope: &str,
    audience: &str,
) -> Result<String, AuthError> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let header = r#"{"alg":"RS256","typ":"JWT"}"#;
    let claims = format!(
        r#"{{"iss":"{client_email}","scope":"{scope}","aud":"{audience}","exp":{},"iat":{now}}}"#,
        now + 3600
    );

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.as_bytes()),
        URL_SAFE_NO_PAD.encode(claims.as_bytes())
    );

    let key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AuthError::Signing(format!("cannot parse private key: {e}")))?;
    let signer = SigningKey::<Sha256>::new(key);
    let signature = signer.sign(signing_input.as_bytes());

    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}
