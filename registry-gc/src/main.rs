// Copyright 2018 Alex Crawford
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

mod config;
mod errors;
mod history;
mod object_store;
mod registry;
mod scanner;
mod sigv4;
mod sweep;
mod xml;

use config::{Command, FileConfig, Options};
use errors::GcError;
use failure::Fail;
use layergraph::LayerGraph;
use log::LevelFilter;
use object_store::{ObjectStoreClient, ObjectStoreConfig};
use registry::RegistryDriver;
use scanner::ScanStats;
use std::process::ExitCode;
use std::sync::Arc;
use structopt::StructOpt;

fn main() -> ExitCode {
    let opts = Options::from_args();

    env_logger::Builder::from_default_env()
        .filter(
            Some(module_path!()),
            match opts.verbosity {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            },
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!("failed to start async runtime: {}", err);
            return ExitCode::from(3);
        }
    };

    let verbosity = opts.verbosity;
    match runtime.block_on(run(opts)) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            error!("{}", err);
            if verbosity > 0 {
                for cause in (&err as &dyn Fail).iter_chain().skip(1) {
                    error!("caused by: {}", cause);
                }
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run(opts: Options) -> Result<(), GcError> {
    let config_text = std::fs::read_to_string(&opts.config)
        .map_err(|err| GcError::Config(format!("reading {:?}: {}", opts.config, err)))?;
    let config = FileConfig::from_yaml_str(&config_text)?;
    config.validate()?;

    let store = Arc::new(ObjectStoreClient::new(ObjectStoreConfig {
        bucket: config.registry.bucket.clone(),
        region: config.registry.region.clone(),
        access_key: config.registry.access_key.clone(),
        secret_key: config.registry.secret_key.clone(),
        use_https: true,
        request_timeout: config.request_timeout(),
        max_retries: config.retry.max_attempts,
        backoff_step: config.backoff_step(),
        endpoint_override: config.registry.endpoint.clone(),
    })?);
    let driver = RegistryDriver::new(store, &config.registry.path);

    let cancel = tokio_util::sync::CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("received interrupt, finishing in-flight work before exiting");
                cancel.cancel();
            }
        });
    }

    let graph = match &opts.graph {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|err| GcError::State(format!("reading {:?}: {}", path, err)))?;
            LayerGraph::from_json(&text)?
        }
        None => {
            let stats = ScanStats::default();
            let mut graph = LayerGraph::new();
            scanner::import_ancestry(&driver, &mut graph, config.concurrency, &stats, &cancel).await?;
            if let Some(path) = &opts.save_intermediate {
                save_graph(&graph, path)?;
            }
            scanner::import_repositories(&driver, &mut graph, config.concurrency, &stats, &cancel).await?;
            info!(
                "scan complete: {} images, {} repositories",
                stats.images_seen.load(std::sync::atomic::Ordering::Relaxed),
                stats.repositories_seen.load(std::sync::atomic::Ordering::Relaxed),
            );
            graph
        }
    };

    if let Some(path) = &opts.save {
        save_graph(&graph, path)?;
    }

    match opts.command {
        Command::Sweep { age, state } => {
            let previous = sweep::load_sweep_state(&state)?;
            let result = sweep::sweep(&graph, &previous, age, chrono::Utc::now())?;
            // The candidate set is printed before the state write so an
            // operator still gets it even if the write then fails.
            println!(
                "{}",
                serde_json::to_string_pretty(&result.candidates)
                    .map_err(|err| GcError::Parse(err.to_string()))?
            );
            sweep::save_sweep_state(&state, &result.new_state)?;
        }
        Command::History { image } => {
            let records = history::history(&driver, &graph, &image).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&records).map_err(|err| GcError::Parse(err.to_string()))?
            );
        }
    }

    Ok(())
}

fn save_graph(graph: &LayerGraph, path: &std::path::Path) -> Result<(), GcError> {
    let json = graph.to_json()?;
    std::fs::write(path, json).map_err(GcError::from)
}
