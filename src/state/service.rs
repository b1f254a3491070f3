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

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use itertools::Itertools;
use tracing::trace;

use crate::state::workload::{Labels, Workload};
use crate::strng::Strng;

/// The application protocol declared on a port. Names are matched case-insensitively.
#[derive(Default, Debug, Hash, Eq, PartialEq, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    HTTP,
    HTTP2,
    GRPC,
    #[default]
    TCP,
    TLS,
    /// Any protocol we do not model is forwarded as opaque bytes.
    Unsupported,
}

impl Protocol {
    pub fn from_name(name: &str) -> Protocol {
        match name.to_ascii_uppercase().as_str() {
            "HTTP" => Protocol::HTTP,
            "HTTP2" => Protocol::HTTP2,
            "GRPC" | "GRPC-WEB" => Protocol::GRPC,
            "TCP" => Protocol::TCP,
            "TLS" => Protocol::TLS,
            _ => Protocol::Unsupported,
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::HTTP | Protocol::HTTP2 | Protocol::GRPC)
    }
}

impl<'de> serde::Deserialize<'de> for Protocol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = <String as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Protocol::from_name(&name))
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Hash, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub name: Strng,
    pub number: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Hash, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub address: IpAddr,
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Service {
    pub name: Strng,
    pub namespace: Strng,
    pub hostname: Strng,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Service {
    pub fn to_key(&self) -> Strng {
        crate::strng_format!("{}/{}", self.namespace, self.hostname)
    }

    /// A service applies to a workload when one of its endpoints is addressed at the workload.
    pub fn selects(&self, workload: &Workload) -> bool {
        self.endpoints
            .iter()
            .any(|ep| workload.has_address(&ep.address))
    }
}

/// A port declared by a service applying to a workload.
#[derive(Debug, Hash, Eq, PartialEq, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortDeclaration {
    pub hostname: Strng,
    pub port: ServicePort,
}

/// Data store for service information.
#[derive(serde::Serialize, Default, Debug, Clone)]
pub struct ServiceStore {
    /// by_key maps namespace/hostname to the service. ServiceEntry allows the same hostname to be
    /// declared in several namespaces, so the hostname alone is not unique.
    by_key: HashMap<Strng, Arc<Service>>,
}

impl ServiceStore {
    pub fn insert(&mut self, svc: Service) {
        self.by_key.insert(svc.to_key(), Arc::new(svc));
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<Service>> {
        self.by_key.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Service>> {
        self.by_key.get(key).cloned()
    }

    /// Returns the services with an endpoint on the workload, ordered by key.
    pub fn get_by_workload(&self, workload: &Workload) -> Vec<Arc<Service>> {
        self.by_key
            .values()
            .filter(|svc| svc.selects(workload))
            .sorted_by(|a, b| a.to_key().cmp(&b.to_key()))
            .cloned()
            .collect()
    }

    /// Returns every port declared for the workload. When several services declare the same port
    /// number, the first service in key order wins.
    pub fn ports_for_workload(&self, workload: &Workload) -> Vec<ServicePortDeclaration> {
        let ports: Vec<_> = self
            .get_by_workload(workload)
            .iter()
            .flat_map(|svc| {
                svc.ports.iter().map(|p| ServicePortDeclaration {
                    hostname: svc.hostname.clone(),
                    port: p.clone(),
                })
            })
            .unique_by(|d| d.port.number)
            .collect();
        trace!(workload = %workload, ports = ports.len(), "found service ports");
        ports
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
