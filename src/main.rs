// Copyright Istio Authors
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

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use authn_sim::*;

fn main() -> anyhow::Result<()> {
    telemetry::setup_logging()?;
    let config = Arc::new(config::parse_config()?);

    // For now we don't need a complex CLI, so just use basic argv[1]
    let files: Vec<PathBuf> = match std::env::args().nth(1).as_deref() {
        Some("run") => std::env::args().skip(2).map(PathBuf::from).collect(),
        Some("version") => return version(),
        Some("help") | None => return help(),
        Some(file) if file.ends_with(".yaml") || file.ends_with(".yml") => {
            std::env::args().skip(1).map(PathBuf::from).collect()
        }
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            std::process::exit(1)
        }
    };

    let failed = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_worker_threads)
        .enable_all()
        .build()?
        .block_on(async move { run(config, files).await })?;
    if failed {
        std::process::exit(1)
    }
    Ok(())
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
Istio Peer Authentication Simulator ({version})

Commands:
run <file>...   - Replay the calls of each scenario file and print a JSON report (default)
version         - Print the version of authn-sim
help            - Print commands and version of authn-sim"
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}

async fn run(cfg: Arc<config::Config>, files: Vec<PathBuf>) -> anyhow::Result<bool> {
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&*cfg)?);
    if files.is_empty() {
        anyhow::bail!("no scenario files given");
    }
    let scenarios = files
        .iter()
        .map(|f| scenario::Scenario::from_file(f))
        .collect::<Result<Vec<_>, _>>()?;
    let reports = scenario::run_all(cfg, scenarios).await?;
    let failed = reports.iter().any(|r| r.failures().next().is_some());
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(failed)
}
