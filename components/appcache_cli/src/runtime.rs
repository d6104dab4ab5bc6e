//! Runtime orchestration for the command-line tool
//!
//! The Runtime wires the engine's collaborators together:
//! - a disk or in-memory response store
//! - the HTTP fetcher
//! - the update service, reporting through a [`PrintingFrontend`]

use appcache::{AppCacheEvent, AppCacheService, ServiceContext, UpdateConfig};
use core_types::AppCacheInfoCollection;
use resource_fetcher::{FetcherOptions, HttpFetcher, ResourceFetcher};
use response_storage::{DiskStorage, MainResponse, MemoryStorage, ResponseStorage};
use std::sync::Arc;
use url::Url;

use crate::cli::{Cli, Command};
use crate::error::{CliError, CliResult};
use crate::frontend::PrintingFrontend;

/// Reads the config file named on the command line and applies flag
/// overrides on top.
pub fn load_config(cli: &Cli) -> CliResult<UpdateConfig> {
    let mut config = match &cli.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => UpdateConfig::default(),
    };
    if let Some(max_retries) = cli.max_retries {
        config = config.with_max_retries(max_retries);
    }
    if let Some(concurrency) = cli.concurrency {
        config = config.with_max_concurrent_fetches(concurrency);
    }
    Ok(config)
}

/// Owns the service and executes commands against it.
pub struct Runtime {
    service: AppCacheService,
    frontend: Arc<PrintingFrontend>,
}

impl Runtime {
    /// Builds a runtime from parsed arguments, printing to stdout.
    ///
    /// # Errors
    /// Returns `CliError` if the config file, the store or the HTTP client
    /// cannot be set up.
    pub async fn open(cli: &Cli) -> CliResult<Self> {
        let config = load_config(cli)?;
        let storage: Arc<dyn ResponseStorage> = match &cli.store {
            Some(dir) => Arc::new(DiskStorage::open(dir.clone()).await?),
            None => Arc::new(MemoryStorage::new()),
        };
        let fetcher = Arc::new(HttpFetcher::new(FetcherOptions::default())?);
        tracing::debug!(store = ?cli.store, config = ?config, "runtime ready");
        Self::with_parts(storage, fetcher, config, PrintingFrontend::stdout())
    }

    /// Builds a runtime around explicit collaborators.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_parts(
        storage: Arc<dyn ResponseStorage>,
        fetcher: Arc<dyn ResourceFetcher>,
        config: UpdateConfig,
        frontend: Arc<PrintingFrontend>,
    ) -> CliResult<Self> {
        let context = ServiceContext::builder(storage, fetcher).config(config).build()?;
        Ok(Self {
            service: AppCacheService::new(context),
            frontend,
        })
    }

    /// The underlying service.
    pub fn service(&self) -> &AppCacheService {
        &self.service
    }

    /// The frontend output goes through.
    pub fn frontend(&self) -> &Arc<PrintingFrontend> {
        &self.frontend
    }

    /// Executes one subcommand.
    pub async fn execute(&self, command: &Command) -> CliResult<()> {
        match command {
            Command::Update { manifest, master } => {
                self.update(manifest, master.clone()).await?;
            }
            Command::List => {
                self.list().await?;
            }
            Command::Delete { manifest } => self.delete(manifest).await?,
            Command::Lookup { url } => {
                self.lookup(url).await?;
            }
        }
        Ok(())
    }

    /// Runs an update of `manifest` to completion and returns its final
    /// event.
    ///
    /// # Errors
    /// Returns `CliError::UpdateFailed` when the update ends with an error
    /// event.
    pub async fn update(&self, manifest: &Url, master: Option<Url>) -> CliResult<AppCacheEvent> {
        self.frontend.reset();
        let host = self.service.create_host(self.frontend.clone());
        let group = self
            .service
            .start_update(Some(&host), manifest, master)
            .await?;
        group.wait_for_idle().await;

        match self.frontend.outcome() {
            Some(AppCacheEvent::Error { message }) => Err(CliError::UpdateFailed(message)),
            Some(event) => Ok(event),
            None => Err(CliError::UpdateFailed(format!(
                "no result reported for {}",
                manifest
            ))),
        }
    }

    /// Prints every stored group.
    pub async fn list(&self) -> CliResult<AppCacheInfoCollection> {
        let infos = self.service.get_all_info().await?;
        if infos.is_empty() {
            self.frontend.print("no stored groups");
        }
        for (origin, group_infos) in &infos.infos_by_origin {
            self.frontend.print(origin.clone());
            for info in group_infos {
                self.frontend.print(format!(
                    "  {} {} {} bytes, updated {}",
                    info.manifest_url,
                    info.cache_id,
                    info.size,
                    info.last_update_time.to_rfc3339()
                ));
            }
        }
        Ok(infos)
    }

    /// Deletes the group of `manifest`.
    pub async fn delete(&self, manifest: &Url) -> CliResult<()> {
        self.service.delete_group(manifest).await?;
        self.frontend.print(format!("deleted {}", manifest));
        Ok(())
    }

    /// Prints the cached response that would serve a navigation to `url`.
    pub async fn lookup(&self, url: &Url) -> CliResult<Option<MainResponse>> {
        let found = self.service.find_main_response(url, None).await?;
        match &found {
            Some(response) => {
                let via = match &response.namespace_url {
                    Some(namespace) => format!(" via fallback {}", namespace),
                    None => String::new(),
                };
                self.frontend.print(format!(
                    "{} -> {} ({}, {}){}",
                    url, response.entry_url, response.manifest_url, response.cache_id, via
                ));
            }
            None => self.frontend.print(format!("{} is not cached", url)),
        }
        Ok(found)
    }
}
