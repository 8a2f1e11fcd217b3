//! Compile proxy protocol definitions
//!
//! Types exchanged between the thin compiler wrapper, the proxy daemon, and
//! the remote execution endpoint:
//! - intake: what the wrapper intercepted (compiler, argv, env, cwd)
//! - exec: the populated remote-execution request/response with embedded blobs
//!
//! The wire encoding is JSON for now; both edges frame the body with
//! Content-Length, so the encoding can change without touching the framing.

use facet::Facet;

/// A blake3 hash of some content. Raw bytes internally; hex is display-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Facet)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut arr = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk).ok()?;
            arr[i] = u8::from_str_radix(hex_str, 16).ok()?;
        }
        Some(Self(arr))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash identifying a whole compile (compiler + argv + inputs).
pub type Fingerprint = ContentHash;

/// Identity of a concrete local compiler binary.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct CompilerIdentity {
    /// Absolute path of the local compiler
    pub path: String,
    /// Blake3 of the compiler binary
    pub content_hash: ContentHash,
    /// Version string as reported by the compiler (`--version` first line)
    pub version: String,
}

/// Who asked for this compile (checked against the daemon's own identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
pub struct RequesterInfo {
    pub uid: u32,
    pub pid: u32,
}

/// An intercepted compile invocation, immutable after intake.
#[derive(Debug, Clone, Facet)]
pub struct CompileRequest {
    pub compiler: CompilerIdentity,
    /// Absolute working directory of the caller
    pub cwd: String,
    /// Full argument list, argv[0] included
    pub args: Vec<String>,
    /// Environment subset that affects compilation (explicit, minimal)
    pub env: Vec<(String, String)>,
    /// Input files the caller already knows about (may be empty)
    pub declared_inputs: Vec<String>,
    /// Output files the caller expects
    pub expected_outputs: Vec<String>,
    pub requester: RequesterInfo,
}

/// Blob compression applied to embedded file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum Compression {
    None = 0,
}

/// An input file embedded in an exec request.
#[derive(Debug, Clone, Facet)]
pub struct FileBlob {
    /// Path relative to cwd, or absolute for system files
    pub path: String,
    pub content_hash: ContentHash,
    pub size: u64,
    pub executable: bool,
    pub compression: Compression,
    pub content: Vec<u8>,
}

/// An expected output file
#[derive(Debug, Clone, Facet)]
pub struct ExpectedOutput {
    /// Logical name ("obj", "dep", "pch", ...)
    pub logical: String,
    /// Relative path where the output will be written
    pub path: String,
    pub executable: bool,
}

/// A produced output file with embedded content
#[derive(Debug, Clone, Facet)]
pub struct OutputBlob {
    pub path: String,
    pub content_hash: ContentHash,
    pub executable: bool,
    pub content: Vec<u8>,
}

/// Where the remote endpoint found the result, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum CacheHit {
    Miss = 0,
    /// Served from the remote execution cache
    Remote = 1,
    /// Served from the endpoint's local output store
    Storage = 2,
}

/// Remote execution request: the compile plus everything it reads.
#[derive(Debug, Clone, Facet)]
pub struct ExecRequest {
    pub trace_id: String,
    pub compiler: CompilerIdentity,
    pub cwd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub inputs: Vec<FileBlob>,
    pub expected_outputs: Vec<ExpectedOutput>,
}

/// Remote execution response.
#[derive(Debug, Clone, Facet)]
pub struct ExecResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cache_hit: CacheHit,
    pub outputs: Vec<OutputBlob>,
    /// Error message from the endpoint itself (infrastructure, not compiler)
    pub error: Option<String>,
}

impl ExecRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        facet_json::to_string(self).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        facet_json::from_str(std::str::from_utf8(bytes).ok()?).ok()
    }
}

impl ExecResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        facet_json::to_string(self).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        facet_json::from_str(std::str::from_utf8(bytes).ok()?).ok()
    }
}

impl CompileRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        facet_json::to_string(self).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        facet_json::from_str(std::str::from_utf8(bytes).ok()?).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_hex_roundtrip() {
        let hash = ContentHash::of_bytes(b"int main() { return 0; }");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentHash::from_hex(&hex), Some(hash));
    }

    #[test]
    fn content_hash_rejects_bad_hex() {
        assert_eq!(ContentHash::from_hex("abc"), None);
        assert_eq!(ContentHash::from_hex(&"zz".repeat(32)), None);
    }

    #[test]
    fn exec_request_bytes_roundtrip() {
        let req = ExecRequest {
            trace_id: "42-deadbeef".to_string(),
            compiler: CompilerIdentity {
                path: "/usr/bin/clang++".to_string(),
                content_hash: ContentHash::of_bytes(b"compiler"),
                version: "clang version 17.0.1".to_string(),
            },
            cwd: "/src/out".to_string(),
            args: vec!["clang++".to_string(), "-c".to_string(), "a.cc".to_string()],
            env: vec![("SDKROOT".to_string(), "/sdk".to_string())],
            inputs: vec![FileBlob {
                path: "a.cc".to_string(),
                content_hash: ContentHash::of_bytes(b"source"),
                size: 6,
                executable: false,
                compression: Compression::None,
                content: b"source".to_vec(),
            }],
            expected_outputs: vec![ExpectedOutput {
                logical: "obj".to_string(),
                path: "a.o".to_string(),
                executable: false,
            }],
        };

        let bytes = req.to_bytes();
        let back = ExecRequest::from_bytes(&bytes).expect("decode");
        assert_eq!(back.trace_id, req.trace_id);
        assert_eq!(back.inputs.len(), 1);
        assert_eq!(back.inputs[0].content, b"source");
    }
}
