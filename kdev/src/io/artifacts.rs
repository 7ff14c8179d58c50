//! Installer ISO acquisition with SHA-256 verification.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::error::{ProvisionError, Result};

const USER_AGENT: &str = concat!("kdev/", env!("CARGO_PKG_VERSION"));

/// Bytes between download progress log lines.
const PROGRESS_STEP: u64 = 64 * 1024 * 1024;

/// Something that can place a verified installer ISO at a path.
pub trait ArtifactSource {
    fn ensure_iso(&self, dest: &Path) -> Result<()>;
}

/// Downloads the ISO over HTTP and checks it against the published sums.
#[derive(Debug, Clone)]
pub struct HttpArtifactSource {
    iso_url: String,
    sha256_url: String,
    client: reqwest::blocking::Client,
}

impl HttpArtifactSource {
    pub fn new(iso_url: &str, sha256_url: &str) -> Result<Self> {
        // ISO downloads take minutes; the default 30s total timeout would cut them off.
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(None)
            .build()
            .map_err(|e| artifact_error("http client", e))?;
        Ok(Self {
            iso_url: iso_url.to_string(),
            sha256_url: sha256_url.to_string(),
            client,
        })
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        self.client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| artifact_error(url, e))
    }

    fn download(&self, dest: &Path) -> Result<()> {
        let part = dest.with_extension("iso.part");
        info!(url = %self.iso_url, dest = %dest.display(), "downloading installer ISO");
        let mut response = self
            .client
            .get(&self.iso_url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| artifact_error(&self.iso_url, e))?;
        let mut file = ProgressWriter::new(File::create(&part)?, response.content_length());
        let bytes = response
            .copy_to(&mut file)
            .map_err(|e| artifact_error(&self.iso_url, e))?;
        file.flush()?;
        drop(file);
        fs::rename(&part, dest)?;
        info!(bytes, "download complete");
        Ok(())
    }
}

impl ArtifactSource for HttpArtifactSource {
    #[instrument(skip_all, fields(dest = %dest.display()))]
    fn ensure_iso(&self, dest: &Path) -> Result<()> {
        let name = file_name_from_url(&self.iso_url);
        let sums = parse_checksums(&self.fetch_text(&self.sha256_url)?);
        let expected = sums.get(&name).ok_or_else(|| ProvisionError::Artifact {
            name: name.clone(),
            reason: format!("no checksum listed in {}", self.sha256_url),
        })?;

        if dest.exists() {
            debug!("verifying existing ISO");
            if file_sha256(dest)? == *expected {
                info!("existing ISO matches published checksum");
                return Ok(());
            }
            warn!("existing ISO checksum mismatch, downloading again");
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        self.download(dest)?;

        let actual = file_sha256(dest)?;
        if actual != *expected {
            if let Err(e) = fs::remove_file(dest) {
                warn!(err = %e, "failed to remove corrupt download");
            }
            return Err(ProvisionError::Artifact {
                name,
                reason: format!("checksum mismatch: expected {expected}, got {actual}"),
            });
        }
        info!("ISO verified");
        Ok(())
    }
}

/// Writer that logs how much of a download has arrived every
/// [`PROGRESS_STEP`] bytes.
pub struct ProgressWriter<W> {
    inner: W,
    total: Option<u64>,
    written: u64,
    next_report: u64,
}

impl<W: Write> ProgressWriter<W> {
    pub fn new(inner: W, total: Option<u64>) -> Self {
        Self {
            inner,
            total,
            written: 0,
            next_report: PROGRESS_STEP,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        if self.written >= self.next_report {
            match self.total {
                Some(total) if total > 0 => info!(
                    mib = self.written >> 20,
                    total_mib = total >> 20,
                    percent = self.written * 100 / total,
                    "downloading"
                ),
                _ => info!(mib = self.written >> 20, "downloading"),
            }
            while self.next_report <= self.written {
                self.next_report += PROGRESS_STEP;
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Parse a `sha256sums.txt` body (`<hex>  <file>` per line) into a map keyed
/// by file name. Binary-mode markers (`*file`) are stripped.
pub fn parse_checksums(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let sum = fields.next()?;
            let name = fields.next()?;
            Some((
                name.trim_start_matches('*').to_string(),
                sum.to_ascii_lowercase(),
            ))
        })
        .collect()
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Copy the ISO aside so the installer can boot from a stable file.
pub fn backup_iso(iso: &Path, backup: &Path) -> Result<()> {
    fs::copy(iso, backup)?;
    info!(backup = %backup.display(), "ISO backed up");
    Ok(())
}

fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn artifact_error(name: &str, err: reqwest::Error) -> ProvisionError {
    ProvisionError::Artifact {
        name: name.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sums_file() {
        let sums = parse_checksums(
            "ABCDEF0123  archlinux-x86_64.iso\n\
             1111  *archlinux-bootstrap-x86_64.tar.zst\n\
             \n\
             malformed\n",
        );
        assert_eq!(
            sums.get("archlinux-x86_64.iso").map(String::as_str),
            Some("abcdef0123")
        );
        assert_eq!(
            sums.get("archlinux-bootstrap-x86_64.tar.zst").map(String::as_str),
            Some("1111")
        );
        assert_eq!(sums.len(), 2);
    }

    #[test]
    fn hashes_file_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("blob");
        fs::write(&path, b"abc").expect("write");
        assert_eq!(
            file_sha256(&path).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn progress_writer_counts_and_forwards() {
        let mut out = ProgressWriter::new(Vec::new(), Some(6));
        out.write_all(b"abc").expect("write");
        out.write_all(b"def").expect("write");
        assert_eq!(out.written(), 6);
        assert_eq!(out.inner, b"abcdef");
    }

    #[test]
    fn progress_reports_advance_past_large_writes() {
        let chunk = vec![0u8; 1024 * 1024];
        let mut out = ProgressWriter::new(io::sink(), None);
        for _ in 0..130 {
            out.write_all(&chunk).expect("write");
        }
        assert_eq!(out.written(), 130 * 1024 * 1024);
        assert_eq!(out.next_report, 3 * PROGRESS_STEP);
    }

    #[test]
    fn file_name_ignores_query() {
        assert_eq!(
            file_name_from_url("https://m.example/iso/latest/archlinux-x86_64.iso?x=1"),
            "archlinux-x86_64.iso"
        );
    }
}
