//! FTP/FTPS transport built on `suppaftp`
//!
//! `suppaftp`'s stream is synchronous, so every operation runs on the
//! blocking pool. The session lives in a shared slot: an operation takes
//! the stream out, works on it, and puts it back only on success. A failed
//! or timed-out operation therefore leaves the slot empty and the next
//! call logs in again with the settings remembered from `connect`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use suppaftp::types::FileType;
use suppaftp::{Mode, NativeTlsConnector, NativeTlsFtpStream};
use tracing::{debug, warn};

use super::listing::parse_list_line;
use super::{FileTransport, RemoteFile};
use crate::config::FtpSettings;

#[derive(Default)]
struct SessionSlot {
    stream: Option<NativeTlsFtpStream>,
    settings: Option<FtpSettings>,
}

/// [`FileTransport`] over a real FTP or explicit-FTPS server
#[derive(Clone, Default)]
pub struct FtpTransport {
    slot: Arc<Mutex<SessionSlot>>,
}

impl FtpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_session<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut NativeTlsFtpStream) -> Result<R> + Send + 'static,
    {
        let slot = Arc::clone(&self.slot);
        tokio::task::spawn_blocking(move || run_in_session(&slot, op))
            .await
            .map_err(|e| anyhow!("FTP task panicked: {}", e))?
    }
}

fn lock_slot(slot: &Mutex<SessionSlot>) -> Result<std::sync::MutexGuard<'_, SessionSlot>> {
    slot.lock().map_err(|_| anyhow!("FTP session state poisoned"))
}

fn run_in_session<R>(
    slot: &Mutex<SessionSlot>,
    op: impl FnOnce(&mut NativeTlsFtpStream) -> Result<R>,
) -> Result<R> {
    let (stream, settings) = {
        let mut guard = lock_slot(slot)?;
        (guard.stream.take(), guard.settings.clone())
    };

    let mut stream = match stream {
        Some(stream) => stream,
        None => {
            let settings = settings.ok_or_else(|| anyhow!("FTP session not established"))?;
            debug!(host = %settings.host, "Re-establishing FTP session");
            open_session(&settings)?
        },
    };

    match op(&mut stream) {
        Ok(value) => {
            let mut guard = lock_slot(slot)?;
            if guard.settings.is_some() && guard.stream.is_none() {
                guard.stream = Some(stream);
            } else {
                // Disconnected meanwhile, or another session was opened.
                let _ = stream.quit();
            }
            Ok(value)
        },
        Err(e) => {
            // The control channel may be out of sync; drop it.
            let _ = stream.quit();
            Err(e)
        },
    }
}

fn open_session(settings: &FtpSettings) -> Result<NativeTlsFtpStream> {
    debug!("Connecting to FTP server: {}", settings.address());
    let mut stream = NativeTlsFtpStream::connect(settings.address())
        .with_context(|| format!("Failed to connect to {}", settings.address()))?;

    if settings.secure {
        let connector = suppaftp::native_tls::TlsConnector::new()
            .context("Failed to initialise TLS connector")?;
        stream = stream
            .into_secure(NativeTlsConnector::from(connector), &settings.host)
            .context("Failed to negotiate explicit FTPS")?;
    }

    stream.set_mode(if settings.passive {
        Mode::Passive
    } else {
        Mode::Active
    });

    debug!("Logging in as: {}", settings.username);
    stream
        .login(&settings.username, &settings.password)
        .context("FTP login failed")?;

    stream
        .transfer_type(FileType::Binary)
        .context("Failed to set binary mode")?;

    Ok(stream)
}

#[async_trait]
impl FileTransport for FtpTransport {
    async fn connect(&self, settings: &FtpSettings) -> Result<()> {
        let settings = settings.clone();
        let stream = tokio::task::spawn_blocking({
            let settings = settings.clone();
            move || open_session(&settings)
        })
        .await
        .map_err(|e| anyhow!("FTP connect task panicked: {}", e))??;

        let previous = {
            let mut guard = lock_slot(&self.slot)?;
            guard.settings = Some(settings);
            guard.stream.replace(stream)
        };
        if let Some(mut old) = previous {
            tokio::task::spawn_blocking(move || {
                let _ = old.quit();
            });
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<RemoteFile>> {
        let path = path.to_string();
        self.with_session(move |stream| {
            let lines = stream
                .list(Some(path.as_str()))
                .with_context(|| format!("Failed to list directory: {}", path))?;

            let now = Utc::now();
            let mut entries = Vec::with_capacity(lines.len());
            for line in &lines {
                match parse_list_line(line, &path, now) {
                    Some(entry) => entries.push(entry),
                    None => debug!(line = %line, "Ignoring unparseable LIST line"),
                }
            }
            Ok(entries)
        })
        .await
    }

    async fn retrieve(&self, path: &str) -> Result<Vec<u8>> {
        let path = path.to_string();
        self.with_session(move |stream| {
            debug!("Downloading file: {}", path);
            let buffer = stream
                .retr_as_buffer(&path)
                .with_context(|| format!("Failed to download file: {}", path))?;
            Ok(buffer.into_inner())
        })
        .await
    }

    async fn disconnect(&self) {
        let stream = match lock_slot(&self.slot) {
            Ok(mut guard) => {
                guard.settings = None;
                guard.stream.take()
            },
            Err(e) => {
                warn!(error = %e, "Cannot disconnect cleanly");
                return;
            },
        };

        if let Some(mut stream) = stream {
            let quit = tokio::task::spawn_blocking(move || stream.quit()).await;
            match quit {
                Ok(Ok(())) => debug!("FTP session closed"),
                Ok(Err(e)) => warn!("Failed to quit FTP session gracefully: {}", e),
                Err(e) => warn!("FTP quit task panicked: {}", e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_without_session_fail() {
        let transport = FtpTransport::new();
        let err = transport.list("/").await.unwrap_err();
        assert!(err.to_string().contains("not established"));
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_to_connect() {
        let transport = FtpTransport::new();
        let settings = FtpSettings {
            host: "127.0.0.1".into(),
            port: 1,
            username: "county".into(),
            password: "secret".into(),
            ..FtpSettings::default()
        };
        assert!(transport.connect(&settings).await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires county FTP credentials in the environment
    async fn test_live_listing() {
        let config = crate::config::SyncConfig::from_env().unwrap();
        let transport = FtpTransport::new();
        transport.connect(&config.ftp).await.unwrap();
        let entries = transport.list(&config.remote_path).await.unwrap();
        assert!(!entries.is_empty());
        transport.disconnect().await;
    }
}
