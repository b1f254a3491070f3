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

use std::fs;
use std::str::FromStr;

use anyhow::anyhow;
use tracing::debug;

use crate::strng::{self, Strng};

const MESH_CONFIG_PATH: &str = "MESH_CONFIG_PATH";
const MESH_CONFIG: &str = "MESH_CONFIG";
const ROOT_NAMESPACE: &str = "ROOT_NAMESPACE";
const DEFAULT_NAMESPACE: &str = "DEFAULT_NAMESPACE";
const SIMULATION_WORKER_THREADS: &str = "SIMULATION_WORKER_THREADS";

const DEFAULT_MESH_CONFIG_PATH: &str = "./etc/istio/config/mesh";
const DEFAULT_ROOT_NAMESPACE: &str = "istio-system";
const DEFAULT_NAMESPACE_NAME: &str = "default";
const DEFAULT_WORKER_THREADS: u16 = 2;

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Policies without a selector in this namespace apply to the whole mesh.
    pub root_namespace: Strng,
    /// Namespace assigned to configuration documents that do not declare one.
    pub default_namespace: Strng,

    /// Specify the number of worker threads the Tokio Runtime will use.
    pub num_worker_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root_namespace: strng::new(DEFAULT_ROOT_NAMESPACE),
            default_namespace: strng::new(DEFAULT_NAMESPACE_NAME),
            num_worker_threads: DEFAULT_WORKER_THREADS as usize,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("error parsing mesh config: {0}")]
    MeshConfig(anyhow::Error),
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

pub fn parse_config() -> Result<Config, Error> {
    let mc = parse_mesh_config()?;
    construct_config(mc)
}

fn parse_mesh_config() -> Result<MeshConfig, Error> {
    let mesh_config_path = parse_default(MESH_CONFIG_PATH, DEFAULT_MESH_CONFIG_PATH.to_string())?;
    let mc_env = parse::<String>(MESH_CONFIG)?;
    construct_mesh_config(&mesh_config_path, mc_env.as_deref()).map_err(Error::MeshConfig)
}

pub fn construct_config(mc: MeshConfig) -> Result<Config, Error> {
    let concurrency = mc
        .default_config
        .and_then(|pc| pc.concurrency)
        .unwrap_or(DEFAULT_WORKER_THREADS);
    let root_namespace = parse(ROOT_NAMESPACE)?
        .or(mc.root_namespace)
        .filter(|ns: &String| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_ROOT_NAMESPACE.to_string());
    let num_worker_threads: usize = parse_default(SIMULATION_WORKER_THREADS, concurrency as usize)?;
    if num_worker_threads == 0 {
        return Err(Error::EnvVar(
            SIMULATION_WORKER_THREADS.to_string(),
            num_worker_threads.to_string(),
        ));
    }

    Ok(Config {
        root_namespace: strng::new(root_namespace),
        default_namespace: strng::new(parse_default(
            DEFAULT_NAMESPACE,
            DEFAULT_NAMESPACE_NAME.to_string(),
        )?),
        num_worker_threads,
    })
}

#[derive(serde::Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    pub root_namespace: Option<String>,
    pub default_config: Option<ProxyConfig>,
}

#[derive(serde::Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub concurrency: Option<u16>,
}

impl MeshConfig {
    fn merge(mut self, other: Self) -> Self {
        self.root_namespace = other.root_namespace.or(self.root_namespace);
        self.default_config = match (self.default_config, other.default_config) {
            (Some(mine), Some(theirs)) => Some(ProxyConfig {
                concurrency: theirs.concurrency.or(mine.concurrency),
            }),
            (mine, theirs) => theirs.or(mine),
        };
        self
    }
}

fn construct_mesh_config(mc_path: &str, mc_env: Option<&str>) -> anyhow::Result<MeshConfig> {
    let mesh_config: Option<MeshConfig> = match fs::File::open(mc_path) {
        Ok(f) => serde_yaml::from_reader(f)
            .map(Some)
            .map_err(anyhow::Error::new),
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                debug!(path = mc_path, "no mesh config file");
                Ok(None)
            } else {
                Err(anyhow!(e))
            }
        }
    }
    .map_err(|e| anyhow!("failed parsing mesh config file {}: {}", mc_path, e))?;

    let mesh_config_env: Option<MeshConfig> = mc_env
        .map(|mc_env| {
            if mc_env.is_empty() {
                Ok(None)
            } else {
                serde_yaml::from_str(mc_env)
            }
        })
        .unwrap_or(Ok(None))
        .map_err(|e| anyhow!("failed parsing mesh config env: {}", e))?;

    Ok([mesh_config, mesh_config_env]
        .into_iter()
        .flatten()
        .fold(MeshConfig::default(), |mc, v| mc.merge(v)))
}
