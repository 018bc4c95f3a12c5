//! Rendezvous through the shared filesystem
//!
//! A listening group publishes a [`RendezvousFile`] so an independently
//! launched peer group can find every listening rank. The file is written
//! to a temporary name and renamed into place, so readers never observe a
//! half-written address list.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use super::{CommError, CommResult, Rank};

/// First line of every rendezvous file
const RENDEZVOUS_HEADER: &str = "# dsmbuf rendezvous v1";

fn write_atomically(path: &Path, contents: &[u8]) -> CommResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).map_err(|e| {
        CommError::Rendezvous(format!("Failed to write {:?}: {}", tmp, e))
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        CommError::Rendezvous(format!("Failed to publish {:?}: {}", path, e))
    })?;
    Ok(())
}

/// The published address list of a listening group
#[derive(Debug, Clone)]
pub struct RendezvousFile {
    path: PathBuf,
}

impl RendezvousFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the listening address of every local rank, in rank order
    pub fn publish(&self, addresses: &[SocketAddr]) -> CommResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    CommError::Rendezvous(format!("Failed to create {:?}: {}", parent, e))
                })?;
            }
        }

        let mut text = String::from(RENDEZVOUS_HEADER);
        text.push('\n');
        for (rank, addr) in addresses.iter().enumerate() {
            text.push_str(&format!("{} {}\n", rank, addr));
        }
        write_atomically(&self.path, text.as_bytes())?;

        tracing::info!(
            "Published rendezvous for {} ranks at {:?}",
            addresses.len(),
            self.path
        );
        Ok(())
    }

    /// Read the published addresses; `Ok(None)` when nothing is published
    pub fn read(&self) -> CommResult<Option<Vec<SocketAddr>>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CommError::Rendezvous(format!(
                    "Failed to read {:?}: {}",
                    self.path, e
                )))
            }
        };
        Self::parse(&text).map(Some)
    }

    fn parse(text: &str) -> CommResult<Vec<SocketAddr>> {
        let mut lines = text.lines();
        if lines.next().map(str::trim) != Some(RENDEZVOUS_HEADER) {
            return Err(CommError::Rendezvous(
                "missing rendezvous header".to_string(),
            ));
        }

        let mut addresses = Vec::new();
        for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
            let (rank, addr) = line.split_once(' ').ok_or_else(|| {
                CommError::Rendezvous(format!("malformed rendezvous line '{}'", line))
            })?;
            let rank: Rank = rank.parse().map_err(|_| {
                CommError::Rendezvous(format!("bad rank in rendezvous line '{}'", line))
            })?;
            if rank != addresses.len() {
                return Err(CommError::Rendezvous(format!(
                    "rendezvous ranks out of order at '{}'",
                    line
                )));
            }
            let addr: SocketAddr = addr.trim().parse().map_err(|_| {
                CommError::Rendezvous(format!("bad address in rendezvous line '{}'", line))
            })?;
            addresses.push(addr);
        }

        if addresses.is_empty() {
            return Err(CommError::Rendezvous("empty rendezvous".to_string()));
        }
        Ok(addresses)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn remove(&self) -> CommResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!("Removed rendezvous {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CommError::Rendezvous(format!(
                "Failed to remove {:?}: {}",
                self.path, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rendezvous_publish_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let file = RendezvousFile::new(temp_dir.path().join("dsm_rendezvous.txt"));
        assert!(file.read().unwrap().is_none());

        let addrs: Vec<SocketAddr> = vec![
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:5001".parse().unwrap(),
        ];
        file.publish(&addrs).unwrap();
        assert!(file.exists());
        assert_eq!(file.read().unwrap().unwrap(), addrs);

        file.remove().unwrap();
        assert!(!file.exists());
        // removing twice is fine
        file.remove().unwrap();
    }

    #[test]
    fn test_rendezvous_rejects_garbage() {
        assert!(RendezvousFile::parse("hello").is_err());
        assert!(RendezvousFile::parse(&format!("{}\n", RENDEZVOUS_HEADER)).is_err());
        assert!(RendezvousFile::parse(&format!("{}\n1 127.0.0.1:1\n", RENDEZVOUS_HEADER)).is_err());
        assert!(RendezvousFile::parse(&format!("{}\n0 nowhere\n", RENDEZVOUS_HEADER)).is_err());
    }
}
