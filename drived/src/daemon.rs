use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drive_core::{AboutSnapshot, DriveClient};
use tracing::{debug, info, warn};

use crate::file_system::{FileSystem, FileSystemError};
use crate::sync::backoff::Backoff;
use crate::sync::change_list_loader::{ChangeListLoaderObserver, LoadScope};
use crate::sync::metadata::EntrySummary;
use crate::sync::metadata_store::{SqliteMetadataStore, default_db_path};

const DEFAULT_API_URL: &str = "https://drive.example.com";
const DEFAULT_POLL_SECS: u64 = 60;
const DEFAULT_PAGE_SIZE: u64 = 500;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct DaemonConfig {
    pub token: String,
    pub api_url: String,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub page_size: u32,
    pub request_timeout: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let token = var("DRIVE_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .context("DRIVE_TOKEN is not set")?;
        let api_url = var("DRIVE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let db_path = match var("DRIVE_DB_PATH") {
            Some(value) if value.starts_with('~') => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            Some(value) => PathBuf::from(value),
            None => default_db_path().context("no default location for the metadata database")?,
        };
        let poll_interval =
            Duration::from_secs(read_u64_var(&var, "DRIVE_POLL_SECS", DEFAULT_POLL_SECS));
        let page_size = u32::try_from(read_u64_var(&var, "DRIVE_PAGE_SIZE", DEFAULT_PAGE_SIZE))
            .context("DRIVE_PAGE_SIZE is too large")?;
        let request_timeout = Duration::from_secs(read_u64_var(
            &var,
            "DRIVE_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        ));

        Ok(Self {
            token,
            api_url,
            db_path,
            poll_interval,
            page_size,
            request_timeout,
        })
    }
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("token", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("db_path", &self.db_path)
            .field("poll_interval", &self.poll_interval)
            .field("page_size", &self.page_size)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    fs: Arc<FileSystem>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = SqliteMetadataStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open metadata store at {:?}", config.db_path))?;
        let client = DriveClient::with_base_url(&config.api_url, config.token.clone())
            .context("invalid API url")?
            .with_request_timeout(config.request_timeout)
            .context("failed to build HTTP client")?
            .with_page_size(config.page_size);
        let fs = Arc::new(FileSystem::new(Arc::new(client), Arc::new(store)));
        fs.add_observer(Arc::new(LoggingObserver));

        Ok(Self { config, fs })
    }

    pub fn file_system(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    /// Loads the root directory, starting the initial load if needed.
    pub async fn load_root(&self) -> Result<Vec<EntrySummary>, FileSystemError> {
        self.fs.read_directory("/").await
    }

    pub async fn about(&self) -> Result<AboutSnapshot, FileSystemError> {
        self.fs.get_about_resource().await
    }

    /// One background poll. Returns the failure count for the next delay.
    pub async fn poll_once(&self, failures: u32) -> u32 {
        match self.fs.check_for_updates().await {
            None => {
                debug!("load in flight, poll skipped");
                failures
            }
            Some(Ok(())) => 0,
            Some(Err(err)) if poll_failure_is_retryable(&err) => {
                warn!(error = %err, failures = failures + 1, "poll failed, backing off");
                failures.saturating_add(1)
            }
            Some(Err(err)) => {
                warn!(error = %err, "poll failed");
                0
            }
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c()
                .await
                .context("failed waiting for shutdown signal")
        })
        .await
    }

    /// Loads the root and polls until `shutdown` resolves. Shutdown also
    /// interrupts a pending initial load.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        info!(
            api_url = %self.config.api_url,
            db_path = %self.config.db_path.display(),
            poll_secs = self.config.poll_interval.as_secs(),
            "started"
        );

        let backoff = Backoff::for_poll_interval(self.config.poll_interval);
        let poll = async {
            match self.load_root().await {
                Ok(children) => info!(entries = children.len(), "root directory loaded"),
                Err(err) => warn!(error = %err, "initial load failed, will retry on next poll"),
            }
            let mut failures = 0u32;
            loop {
                tokio::time::sleep(backoff.delay(failures)).await;
                failures = self.poll_once(failures).await;
            }
        };

        tokio::select! {
            res = shutdown => {
                res?;
                info!("shutting down");
            }
            _ = poll => {}
        }
        Ok(())
    }

    /// Loads the root once and prints it together with the quota.
    pub async fn run_once(self) -> anyhow::Result<()> {
        let children = self.load_root().await.context("failed to load root directory")?;
        let about = self.about().await.context("failed to fetch account info")?;
        for line in render_listing(&children) {
            println!("{line}");
        }
        println!(
            "{} of {} bytes used",
            about.quota_bytes_used, about.quota_bytes_total
        );
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
