//! hiera-audit
//!
//! Reconciles Hiera hierarchy data against logged key lookups, either as a
//! long-running HTTP API or through one-shot commands.

use anyhow::Result;
use clap::Parser;
use hiera_audit::api;
use hiera_audit::cli::{Cli, Command};
use hiera_audit::config::{Config, ConfigLoader};
use hiera_audit::format::{self, OutputFormat};
use hiera_audit::logging::{self, LogTarget};
use hiera_audit::service::{self, Auditor};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LogTarget::parse(&cli.log), cli.verbose)?;

    let mut loader = match cli.config {
        Some(ref path) => ConfigLoader::load_explicit(&PathBuf::from(path))?,
        None => ConfigLoader::load()?,
    };
    for (tier, source) in loader.sources() {
        info!(tier = %tier, source = %source, "config loaded");
    }

    let config = loader.config_mut();
    if let Some(ref data_dir) = cli.data_dir {
        config.data_dir = data_dir.into();
    }
    if let Some(ref database) = cli.database {
        config.storage.db_path = database.into();
    }
    if let Some(Command::Serve {
        ref host,
        ref port,
    }) = cli.command
    {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }
    let config = loader.into_config();

    let auditor = Arc::new(build_auditor(&config)?);
    let output = cli.format;

    match cli.command {
        Some(Command::Serve { .. }) | None => {
            api::serve(auditor, &config.server).await?;
        }
        Some(Command::Hierarchy { certname }) => match certname {
            Some(certname) => {
                let resolution = auditor.resolve_hierarchy(&certname)?;
                emit(output, &resolution, || format::format_hierarchy(&certname, &resolution))?;
            }
            None => {
                let overview = auditor.hierarchy_overview();
                emit(output, &overview, || format::format_hierarchy("templates", &overview))?;
            }
        },
        Some(Command::Clean { certname }) => {
            let result = auditor.reconcile_one(&certname).await?;
            emit(output, &result, || format::format_reconciliation(&certname, &result))?;
        }
        Some(Command::CleanAll) => {
            let report = auditor.reconcile_all().await?;
            emit(output, &report, || format::format_estate(&report))?;
        }
        Some(Command::Record { certname, key }) => {
            let entries = auditor.record_lookup(&certname, &key)?;
            emit(output, &entries, || format::format_usage(&certname, &entries))?;
        }
        Some(Command::Log { certname }) => match certname {
            Some(certname) => {
                let entries = auditor.logged_keys(&certname)?;
                emit(output, &entries, || format::format_usage(&certname, &entries))?;
            }
            None => {
                let logs = auditor.all_logs()?;
                emit(output, &logs, || format::format_all_usage(&logs))?;
            }
        },
        Some(Command::Lookup { certname, key }) => {
            let found = auditor.lookup_key(&certname, &key).await?;
            emit(output, &found, || format::format_lookup(&certname, &key, found.as_ref()))?;
        }
    }

    Ok(())
}

fn build_auditor(config: &Config) -> Result<Auditor> {
    let (usage, results) = service::stores_for(config)?;
    Ok(Auditor::from_config(config, usage, results)?)
}

/// Print a result in the requested format.
fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", format::to_json(value)?),
        OutputFormat::Text => print!("{}", text()),
    }
    Ok(())
}
