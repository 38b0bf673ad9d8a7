//! Collection runner for API workspaces.

mod auth;
mod cli;
mod collections;
mod datafile;
mod environment;
mod error;
mod executor;
mod history;
mod http;
mod logger;
mod report;
mod runner;
mod script;
mod storage;

use std::fs;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, warn};

use crate::cli::{Cli, Command, ReportFormat, RunArgs};
use crate::collections::ROOT_COLLECTION_ID;
use crate::error::{AppError, StoreError, ValidationError};
use crate::executor::ExecutionSettings;
use crate::history::SqliteHistory;
use crate::http::client::ReqwestTransport;
use crate::report::{CollectionRunResult, RunStatus};
use crate::runner::{CollectionRunner, RunOptions};
use crate::storage::FileStore;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init_logging(cli.verbose);

    match cli.command {
        Command::Run(args) => match run(args).await {
            Ok(result) => {
                let clean = result.status == RunStatus::Completed && result.total_failed == 0;
                if clean { ExitCode::SUCCESS } else { ExitCode::from(1) }
            }
            Err(err) => {
                error!(error = %err, "run aborted");
                eprintln!("error: {err}");
                ExitCode::from(2)
            }
        },
    }
}

async fn run(args: RunArgs) -> Result<CollectionRunResult, AppError> {
    let store = Arc::new(FileStore::load(Path::new(&args.workspace))?);
    if let Some(path) = &args.data {
        store.attach_data_file(Path::new(path))?;
    }
    let folder_id = match &args.folder {
        Some(name) => Some(
            store
                .find_folder_id(name)
                .ok_or_else(|| ValidationError::FolderNotFound(name.clone()))?,
        ),
        None => None,
    };

    let mut runner = CollectionRunner::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(ReqwestTransport::new()),
    )
    .with_variable_writer(store)
    .with_settings(ExecutionSettings {
        request_timeout_ms: args.request_timeout,
        script_timeout_ms: args.script_timeout,
    });
    if !args.no_history {
        let history = SqliteHistory::open(Path::new(&args.history_db))?;
        runner = runner.with_history(Arc::new(history));
    }

    // Ctrl-C flips the cancel flag; the runner stops at its next checkpoint.
    let cancel = runner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let options = RunOptions {
        environment: args.environment.clone(),
        iterations: args.iterations,
        delay_ms: args.delay,
        stop_on_error: args.stop_on_error,
        folder_id,
        data_file: args.data.clone(),
    };
    let result = runner.run(ROOT_COLLECTION_ID, options).await?;

    let rendered = match args.format {
        ReportFormat::Text => result.render(std::io::stdout().is_terminal()),
        ReportFormat::Json => result.to_json().map_err(StoreError::Serialize)?,
    };
    println!("{rendered}");

    if let Some(path) = &args.report {
        // Report files never carry color codes.
        let plain = match args.format {
            ReportFormat::Text => result.render(false),
            ReportFormat::Json => result.to_json().map_err(StoreError::Serialize)?,
        };
        fs::write(path, plain).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
    }

    Ok(result)
}
