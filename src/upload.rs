//! Signed streaming upload pipeline: compress the trace, tee the stream to
//! a temp file while hashing it, sign the hash, derive the upload key, and
//! hand the payload to object storage.
//!
//! The compressor runs as a child process with its stdout piped; the tee
//! and the digest consume that pipe chunk by chunk while the child is
//! live, so memory stays bounded by the buffer, not the payload. Every
//! stage failure is fatal; nothing is uploaded unless all stages succeed.

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use p256::ecdsa::signature::DigestSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::util::run_tool;

/// Query-index data is rebuilt server-side and never uploaded.
const QUERY_INDEX_EXCLUDE: &str = "./db*";

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Signing identity held in memory only; the private key never touches
/// persistent storage.
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Signer> {
        let key = SigningKey::from_pkcs8_der(der).context("parse signing key")?;
        Ok(Signer { key })
    }

    /// Public key as PEM with header, footer, and whitespace stripped, the
    /// form the credential check and upload metadata carry.
    pub fn public_key_stripped_pem(&self) -> Result<String> {
        let pem = VerifyingKey::from(&self.key)
            .to_public_key_pem(LineEnding::LF)
            .context("encode public key")?;
        Ok(pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect::<String>())
    }

    fn sign_digest(&self, digest: Sha256) -> Vec<u8> {
        let signature: Signature = self.key.sign_digest(digest);
        signature.to_der().as_bytes().to_vec()
    }
}

/// Compressed, signed payload ready for upload. The temp file is deleted
/// on drop on every exit path.
#[derive(Debug)]
pub struct SignedPayload {
    pub file: NamedTempFile,
    pub signature: Vec<u8>,
    pub nonce: String,
}

/// Run the compress→tee→sign pipeline over `trace_root`.
pub fn compress_and_sign(trace_root: &Path, signer: &Signer) -> Result<SignedPayload> {
    let mut child = Command::new("tar")
        .args(["--zstd", "-cf", "-", "--exclude", QUERY_INDEX_EXCLUDE, "-C"])
        .arg(trace_root)
        .arg(".")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn tar")?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("tar stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("tar stderr not captured"))?;
    // Drain stderr on its own thread: a chatty tar can emit more than a
    // pipe buffer of warnings while still producing output, and would
    // otherwise block against the tee loop.
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let mut file = NamedTempFile::new().context("create payload temp file")?;
    let mut digest = Sha256::new();
    let payload_bytes = match tee_stream(&mut stdout, &mut file, &mut digest) {
        Ok(n) => n,
        Err(err) => {
            // Don't leave tar writing into a dead pipe or unreaped.
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }
    };
    drop(stdout);

    let status = child.wait().context("wait for tar")?;
    let stderr_buf = stderr_thread.join().unwrap_or_default();
    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr_buf);
        let detail = stderr.trim().lines().next().unwrap_or("no error output");
        bail!("tar failed: {detail}");
    }
    file.flush().context("flush payload file")?;

    let signature = signer.sign_digest(digest);
    let nonce = derive_nonce(&signature);
    tracing::info!(payload_bytes, nonce = nonce.as_str(), "payload compressed and signed");
    Ok(SignedPayload {
        file,
        signature,
        nonce,
    })
}

/// Copy the compressed stream to the payload file while feeding the same
/// bytes into the running digest.
fn tee_stream(
    reader: &mut impl Read,
    file: &mut NamedTempFile,
    digest: &mut Sha256,
) -> Result<u64> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buf).context("read compressed stream")?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).context("tee to payload file")?;
        digest.update(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

/// The upload key is derived from the signature, not the payload, so it is
/// a function of the signing operation itself. With a deterministic scheme
/// identical payload + key yields an identical nonce.
pub fn derive_nonce(signature: &[u8]) -> String {
    let hash = Sha256::digest(signature);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&hash[..8])
}

/// Ask the remote endpoint whether this key pair + identity may upload.
/// Any error indicator in the response aborts before any payload transfer.
pub fn check_credentials(config: &Config, public_key: &str) -> Result<()> {
    let body = serde_json::json!({
        "publicKey": public_key,
        "user": config.user,
        "group": config.group,
    });
    let mut response = ureq::post(&config.check_url)
        .send_json(body)
        .context("credential check request")?;
    let value: serde_json::Value = response
        .body_mut()
        .read_json()
        .context("credential check response")?;
    if value.get("unhandled").is_some() || value.get("error").is_some() {
        bail!("credential check rejected: {value}");
    }
    tracing::info!(user = config.user.as_str(), "credentials accepted");
    Ok(())
}

/// Upload the payload under its nonce-derived key, attaching authenticity
/// metadata. Returns the object key.
pub fn upload_payload(
    config: &Config,
    signer: &Signer,
    payload: &SignedPayload,
    extra_metadata: Option<&str>,
) -> Result<String> {
    let aws = which::which("aws").context("`aws` CLI not found on PATH")?;
    let key = format!("{}.tar.zst", payload.nonce);
    let destination = format!("s3://{}/{}", config.bucket, key);
    let metadata = build_metadata(
        &signer.public_key_stripped_pem()?,
        &payload.signature,
        &config.user,
        &config.group,
        extra_metadata,
    );

    run_tool(
        "aws s3 cp",
        Command::new(aws)
            .arg("s3")
            .arg("cp")
            .arg(payload.file.path())
            .arg(&destination)
            .arg("--metadata")
            .arg(&metadata)
            .env("AWS_ACCESS_KEY_ID", &config.key_id)
            .env("AWS_SECRET_ACCESS_KEY", &config.secret_key),
    )?;
    tracing::info!(key = key.as_str(), "payload uploaded");
    Ok(key)
}

fn build_metadata(
    public_key: &str,
    signature: &[u8],
    user: &str,
    group: &str,
    extra: Option<&str>,
) -> String {
    let signature = base64::engine::general_purpose::STANDARD.encode(signature);
    let mut metadata =
        format!("publickey={public_key},signature={signature},user={user},group={group}");
    if let Some(extra) = extra {
        metadata.push_str(extra);
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signer() -> Signer {
        // Fixed scalar so tests are reproducible.
        let key = SigningKey::from_slice(&[7u8; 32]).unwrap();
        Signer { key }
    }

    #[test]
    fn nonce_is_stable_and_url_safe() {
        let a = derive_nonce(b"signature bytes");
        let b = derive_nonce(b"signature bytes");
        assert_eq!(a, b);
        // 8 hash bytes encode to 11 unpadded base64 characters.
        assert_eq!(a.len(), 11);
        assert!(!a.contains('='));
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
        assert_ne!(a, derive_nonce(b"other bytes"));
    }

    #[test]
    fn deterministic_signature_means_idempotent_key() {
        let signer = test_signer();
        let digest = || {
            let mut d = Sha256::new();
            d.update(b"identical payload bytes");
            d
        };
        let first = signer.sign_digest(digest());
        let second = signer.sign_digest(digest());
        assert_eq!(first, second);
        assert_eq!(derive_nonce(&first), derive_nonce(&second));
    }

    #[test]
    fn public_key_pem_is_stripped_to_one_line() {
        let pem = test_signer().public_key_stripped_pem().unwrap();
        assert!(!pem.contains("BEGIN"));
        assert!(!pem.contains('\n'));
        assert!(!pem.is_empty());
    }

    #[test]
    fn metadata_appends_extra_verbatim() {
        let metadata = build_metadata("PK", b"\x01\x02", "user", "group", Some(",title=demo"));
        assert!(metadata.starts_with("publickey=PK,signature="));
        assert!(metadata.ends_with(",user=user,group=group,title=demo"));
    }

    #[test]
    fn tee_stream_propagates_read_errors() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("stream torn"))
            }
        }
        let mut file = NamedTempFile::new().unwrap();
        let mut digest = Sha256::new();
        let err = tee_stream(&mut Broken, &mut file, &mut digest).unwrap_err();
        assert!(format!("{err:#}").contains("stream torn"));
    }

    #[test]
    fn compression_failure_aborts() {
        let signer = test_signer();
        let err = compress_and_sign(Path::new("/nonexistent/trace/dir"), &signer).unwrap_err();
        assert!(format!("{err}").contains("tar"));
    }

    #[test]
    fn pipeline_produces_signed_payload() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("version"), "1\n").unwrap();
        std::fs::create_dir(dir.path().join("db.0")).unwrap();
        std::fs::write(dir.path().join("db.0/index"), "excluded").unwrap();

        let signer = test_signer();
        let payload = match compress_and_sign(dir.path(), &signer) {
            Ok(payload) => payload,
            // tar or zstd may be missing in minimal environments.
            Err(_) => return,
        };
        assert!(!payload.signature.is_empty());
        assert_eq!(payload.nonce, derive_nonce(&payload.signature));
        let meta = payload.file.as_file().metadata().unwrap();
        assert!(meta.len() > 0);
    }
}
