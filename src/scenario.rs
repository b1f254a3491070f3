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

//! Loads Kubernetes style configuration documents into a [Snapshot] and runs call expectations
//! against it.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::authn::{MtlsMode, PeerAuthentication, PolicyScope};
use crate::config::Config;
use crate::simulation::{self, Expect, Outcome};
use crate::state::Snapshot;
use crate::state::service::{Endpoint, Service, ServicePort};
use crate::state::sidecar::{IngressListener, Sidecar};
use crate::state::workload::{Labels, Workload, WorkloadSelector};
use crate::strng::{self, Strng};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse document {index}: {source}")]
    Yaml {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unsupported kind {kind} for {name}")]
    UnknownKind { kind: String, name: String },
    #[error("{kind} {name}: {reason}")]
    Invalid {
        kind: &'static str,
        name: String,
        reason: String,
    },
    #[error("workload {0} not found")]
    UnknownWorkload(String),
    #[error("failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("failed to parse scenario {path}: {source}")]
    Scenario {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("scenario task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Resource {
    kind: String,
    metadata: ObjectMeta,
    #[serde(default)]
    spec: serde_yaml::Value,
}

#[derive(Deserialize, Debug)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct PeerAuthenticationSpec {
    #[serde(default)]
    selector: Option<WorkloadSelector>,
    #[serde(default)]
    mtls: Option<MtlsSpec>,
    #[serde(default)]
    port_level_mtls: BTreeMap<u16, MtlsSpec>,
}

#[derive(Deserialize, Debug)]
struct MtlsSpec {
    #[serde(default)]
    mode: ModeSpec,
}

/// The mode as written in a policy. UNSET defers to whatever would apply without the setting.
#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ModeSpec {
    #[default]
    Unset,
    Strict,
    Permissive,
    Disable,
}

impl ModeSpec {
    fn resolve(self) -> Option<MtlsMode> {
        match self {
            ModeSpec::Unset => None,
            ModeSpec::Strict => Some(MtlsMode::Strict),
            ModeSpec::Permissive => Some(MtlsMode::Permissive),
            ModeSpec::Disable => Some(MtlsMode::Disable),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ServiceEntrySpec {
    #[serde(default)]
    hosts: Vec<Strng>,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct SidecarSpec {
    #[serde(default)]
    ingress: Vec<IngressListener>,
    #[serde(default)]
    workload_selector: Option<WorkloadSelector>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WorkloadEntrySpec {
    address: IpAddr,
    #[serde(default)]
    labels: Labels,
}

fn spec<T: serde::de::DeserializeOwned + Default>(
    index: usize,
    value: serde_yaml::Value,
) -> Result<T, Error> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(value).map_err(|source| Error::Yaml { index, source })
}

/// Parses a multi-document YAML string into a snapshot.
#[instrument(level = "debug", skip_all)]
pub fn load_config(cfg: &Config, yaml: &str) -> Result<Snapshot, Error> {
    let mut snapshot = Snapshot::default();
    for (index, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value =
            serde_yaml::Value::deserialize(doc).map_err(|source| Error::Yaml { index, source })?;
        // Separators with nothing between them produce empty documents
        if value.is_null() {
            continue;
        }
        let res: Resource =
            serde_yaml::from_value(value).map_err(|source| Error::Yaml { index, source })?;
        let namespace = res
            .metadata
            .namespace
            .as_deref()
            .map(strng::new)
            .unwrap_or_else(|| cfg.default_namespace.clone());
        let name = strng::new(&res.metadata.name);
        debug!(kind = %res.kind, %namespace, %name, "loading resource");
        match res.kind.as_str() {
            "PeerAuthentication" => {
                let s: PeerAuthenticationSpec = spec(index, res.spec)?;
                let selector = s.selector.unwrap_or_default();
                let scope = if !selector.is_empty() {
                    PolicyScope::WorkloadSelector
                } else if namespace == cfg.root_namespace {
                    PolicyScope::Mesh
                } else {
                    PolicyScope::Namespace
                };
                snapshot.policies.insert(PeerAuthentication {
                    name,
                    namespace,
                    scope,
                    selector,
                    mode: s.mtls.and_then(|m| m.mode.resolve()).unwrap_or_default(),
                    // An UNSET port falls back to the policy default
                    port_level_mtls: s
                        .port_level_mtls
                        .into_iter()
                        .filter_map(|(port, m)| Some((port, m.mode.resolve()?)))
                        .collect(),
                });
            }
            "ServiceEntry" => {
                let s: ServiceEntrySpec = spec(index, res.spec)?;
                if s.hosts.is_empty() {
                    return Err(Error::Invalid {
                        kind: "ServiceEntry",
                        name: res.metadata.name,
                        reason: "at least one host is required".to_string(),
                    });
                }
                for hostname in s.hosts {
                    snapshot.services.insert(Service {
                        name: name.clone(),
                        namespace: namespace.clone(),
                        hostname,
                        ports: s.ports.clone(),
                        endpoints: s.endpoints.clone(),
                    });
                }
            }
            "Sidecar" => {
                let s: SidecarSpec = spec(index, res.spec)?;
                snapshot.sidecars.insert(Sidecar {
                    name,
                    namespace,
                    workload_selector: s.workload_selector.filter(|w| !w.is_empty()),
                    ingress: s.ingress,
                });
            }
            "WorkloadEntry" => {
                let s: WorkloadEntrySpec = serde_yaml::from_value(res.spec)
                    .map_err(|source| Error::Yaml { index, source })?;
                snapshot.workloads.insert(Workload {
                    name,
                    namespace,
                    labels: s.labels,
                    addresses: vec![s.address],
                });
            }
            _ => {
                return Err(Error::UnknownKind {
                    kind: res.kind.clone(),
                    name: res.metadata.name,
                });
            }
        }
    }
    info!(
        policies = snapshot.policies.len(),
        services = snapshot.services.len(),
        workloads = snapshot.workloads.len(),
        "configuration loaded"
    );
    Ok(snapshot)
}

/// A configuration plus the calls to replay against one workload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Scenario {
    pub name: Strng,
    /// The workload receiving the calls. Either given inline, or the key of a WorkloadEntry in
    /// the configuration.
    pub workload: WorkloadRef,
    pub config: String,
    #[serde(default)]
    pub calls: Vec<Expect>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum WorkloadRef {
    Key(Strng),
    Inline(Workload),
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub name: Strng,
    pub outcomes: Vec<Outcome>,
}

impl Report {
    /// Failures of expectations that are not marked pending.
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes
            .iter()
            .filter(|o| !o.passed() && o.pending.is_none())
    }
}

impl Scenario {
    pub fn from_file(path: &Path) -> Result<Scenario, Error> {
        let display = path.display().to_string();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => return Err(Error::Io(display, e)),
        };
        serde_yaml::from_str(&data).map_err(|source| Error::Scenario {
            path: display,
            source,
        })
    }

    pub fn snapshot(&self, cfg: &Config) -> Result<Arc<Snapshot>, Error> {
        load_config(cfg, &self.config).map(Snapshot::into_shared)
    }

    pub fn resolve_workload(&self, snapshot: &Snapshot) -> Result<Arc<Workload>, Error> {
        match &self.workload {
            WorkloadRef::Inline(wl) => Ok(Arc::new(wl.clone())),
            WorkloadRef::Key(key) => snapshot
                .workloads
                .get(key)
                .ok_or_else(|| Error::UnknownWorkload(key.to_string())),
        }
    }

    #[instrument(level = "debug", skip_all, fields(scenario = %self.name))]
    pub fn run(&self, cfg: &Config) -> Result<Report, Error> {
        let snapshot = self.snapshot(cfg)?;
        self.run_with(&snapshot)
    }

    pub fn run_with(&self, snapshot: &Snapshot) -> Result<Report, Error> {
        let workload = self.resolve_workload(snapshot)?;
        if let Err(e) = snapshot.policies.check_ambiguity(&workload) {
            warn!("{e}");
        }
        let model = snapshot.listener_model(&workload);
        let outcomes = simulation::check(&model, &self.calls);
        for o in outcomes.iter().filter(|o| !o.passed()) {
            match &o.pending {
                Some(reason) => info!(
                    call = %o.name,
                    expected = %o.expected,
                    actual = %o.actual,
                    %reason,
                    "pending expectation differs"
                ),
                None => warn!(
                    call = %o.name,
                    expected = %o.expected,
                    actual = %o.actual,
                    "expectation failed"
                ),
            }
        }
        Ok(Report {
            name: self.name.clone(),
            outcomes,
        })
    }
}

/// Runs every scenario on the blocking pool. Reports are returned in input order.
pub async fn run_all(cfg: Arc<Config>, scenarios: Vec<Scenario>) -> Result<Vec<Report>, Error> {
    let handles: Vec<_> = scenarios
        .into_iter()
        .map(|scenario| {
            let cfg = cfg.clone();
            tokio::task::spawn_blocking(move || scenario.run(&cfg))
        })
        .collect();
    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        reports.push(handle.await??);
    }
    Ok(reports)
}
