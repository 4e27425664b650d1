use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::TrackingError;

const CHUNK: usize = 64 * 1024;

/// `sha256/ab/cd/<hex>`, shared by the local store and the mirror.
pub fn object_key(hex: &str) -> Result<String, TrackingError> {
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TrackingError::Corrupt(format!("malformed digest '{}'", hex)));
    }
    Ok(format!("sha256/{}/{}/{}", &hex[0..2], &hex[2..4], hex))
}

pub fn blob_path(root: &Path, hex: &str) -> Result<PathBuf, TrackingError> {
    Ok(root.join(object_key(hex)?))
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streaming sha256 of a file; returns (hex digest, size in bytes).
pub fn digest_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Digest of a multi-file artifact: sha256 over `name:digest` lines sorted by name.
pub fn manifest_digest<'a, I>(files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut entries: Vec<(&str, &str)> = files.into_iter().collect();
    entries.sort();
    let mut s = String::new();
    for (name, digest) in entries {
        s.push_str(name);
        s.push(':');
        s.push_str(digest);
        s.push('\n');
    }
    digest_bytes(s.as_bytes())
}

pub fn write_cas(root: &Path, bytes: &[u8]) -> Result<String, TrackingError> {
    let hex = digest_bytes(bytes);
    let path = blob_path(root, &hex)?;
    if !path.exists() {
        write_atomic(&path, |f| f.write_all(bytes))?;
    }
    Ok(hex)
}

/// Copy `source` into the store, verifying it still hashes to `expected`.
/// The blob is fsynced and renamed into place, so a returned `Ok` means durable.
pub fn write_cas_from_file(root: &Path, source: &Path, expected: &str) -> Result<PathBuf, TrackingError> {
    let path = blob_path(root, expected)?;
    if path.exists() {
        debug!(digest = expected, "Blob already present");
        return Ok(path);
    }

    let mut src = File::open(source)?;
    let written = write_atomic(&path, move |dst| {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            dst.write_all(&buf[..n])?;
        }
        if hex::encode(hasher.finalize()) == expected {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::InvalidData, "digest mismatch"))
        }
    });
    match written {
        Ok(()) => Ok(path),
        Err(TrackingError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
            Err(TrackingError::Corrupt(source.display().to_string()))
        }
        Err(e) => Err(e),
    }
}

fn write_atomic<F>(path: &Path, fill: F) -> Result<(), TrackingError>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let dir = path
        .parent()
        .ok_or_else(|| TrackingError::Io(io::Error::new(io::ErrorKind::InvalidInput, "blob path has no parent")))?;
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
    let result = (|| {
        let mut file = File::create(&tmp)?;
        fill(&mut file)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

/// HTTP object-store mirror for blobs. Objects live at `{url}/sha256/ab/cd/<hex>`.
#[derive(Debug, Clone)]
pub struct RemoteCas {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteCas {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, hex: &str) -> Result<String, TrackingError> {
        Ok(format!("{}/{}", self.base_url, object_key(hex)?))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    pub async fn put(&self, hex: &str, bytes: Vec<u8>) -> Result<(), TrackingError> {
        let req = self
            .client
            .put(self.url(hex)?)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TrackingError::Remote(format!("upload failed: {} - {}", status, body)));
        }
        Ok(())
    }

    /// `Ok(None)` when the mirror does not have the object.
    pub async fn get(&self, hex: &str) -> Result<Option<Vec<u8>>, TrackingError> {
        let resp = self.authorize(self.client.get(self.url(hex)?)).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(TrackingError::Remote(format!("download failed: {}", status)));
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_cas_layout() {
        let dir = tempdir().unwrap();
        let hex = write_cas(dir.path(), b"price,last_review\n").unwrap();

        let path = dir.path().join("sha256").join(&hex[0..2]).join(&hex[2..4]).join(&hex);
        assert_eq!(fs::read(path).unwrap(), b"price,last_review\n");
        // Idempotent for the same content
        assert_eq!(write_cas(dir.path(), b"price,last_review\n").unwrap(), hex);
    }

    #[test]
    fn test_write_from_file_verifies_digest() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("data.csv");
        fs::write(&source, "price\n10\n").unwrap();
        let (hex, size) = digest_file(&source).unwrap();
        assert_eq!(size, 9);

        let stored = write_cas_from_file(&dir.path().join("cas"), &source, &hex).unwrap();
        assert_eq!(fs::read_to_string(stored).unwrap(), "price\n10\n");

        let wrong = "0".repeat(64);
        let err = write_cas_from_file(&dir.path().join("cas"), &source, &wrong).unwrap_err();
        assert!(matches!(err, TrackingError::Corrupt(_)));
        assert!(!blob_path(&dir.path().join("cas"), &wrong).unwrap().exists());
    }

    #[test]
    fn test_manifest_digest_is_order_independent() {
        let a = manifest_digest([("a.csv", "11"), ("b.csv", "22")]);
        let b = manifest_digest([("b.csv", "22"), ("a.csv", "11")]);
        assert_eq!(a, b);
        assert_ne!(a, manifest_digest([("a.csv", "22"), ("b.csv", "11")]));
    }

    #[test]
    fn test_remote_urls() {
        let remote = RemoteCas::new("https://blobs.example.com/", None);
        let hex = digest_bytes(b"x");
        assert_eq!(
            remote.url(&hex).unwrap(),
            format!("https://blobs.example.com/sha256/{}/{}/{}", &hex[0..2], &hex[2..4], hex)
        );
    }

    #[test]
    fn test_malformed_digest_is_corrupt() {
        let dir = tempdir().unwrap();
        let non_hex = "zz".repeat(32);
        let short = "a".repeat(63);
        for bad in ["", "ab", "abc", non_hex.as_str(), short.as_str()] {
            assert!(
                matches!(blob_path(dir.path(), bad), Err(TrackingError::Corrupt(_))),
                "{bad:?} should be rejected"
            );
        }
        let remote = RemoteCas::new("https://blobs.example.com", None);
        assert!(matches!(remote.url("ab"), Err(TrackingError::Corrupt(_))));
    }
}
