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
use std::sync::Arc;

use crate::state::service::ServicePort;
use crate::state::workload::{Workload, WorkloadSelector};
use crate::strng::Strng;

#[derive(Debug, Hash, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressListener {
    pub port: ServicePort,
    #[serde(default)]
    pub default_endpoint: Strng,
}

/// Sidecar scopes the inbound ports of the workloads it selects.
#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Sidecar {
    pub name: Strng,
    pub namespace: Strng,
    #[serde(default)]
    pub workload_selector: Option<WorkloadSelector>,
    #[serde(default)]
    pub ingress: Vec<IngressListener>,
}

impl Sidecar {
    pub fn to_key(&self) -> Strng {
        crate::strng_format!("{}/{}", self.namespace, self.name)
    }

    /// The synthetic host used for clusters of ingress ports no service declares.
    pub fn hostname(&self) -> Strng {
        crate::strng_format!("{}.{}", self.name, self.namespace)
    }

    pub fn has_ingress(&self) -> bool {
        !self.ingress.is_empty()
    }

    fn selects(&self, workload: &Workload) -> bool {
        self.namespace == workload.namespace
            && self
                .workload_selector
                .as_ref()
                .is_none_or(|s| s.matches(&workload.labels))
    }
}

/// Data store for sidecar resources.
#[derive(serde::Serialize, Default, Debug, Clone)]
pub struct SidecarStore {
    by_namespace: HashMap<Strng, Vec<Arc<Sidecar>>>,
}

impl SidecarStore {
    pub fn insert(&mut self, sc: Sidecar) {
        let key = sc.to_key();
        let list = self.by_namespace.entry(sc.namespace.clone()).or_default();
        list.retain(|s| s.to_key() != key);
        list.push(Arc::new(sc));
        list.sort_by_key(|s| s.to_key());
    }

    pub fn remove(&mut self, namespace: &str, name: &str) {
        if let Some(list) = self.by_namespace.get_mut(namespace) {
            list.retain(|s| s.name != name);
            if list.is_empty() {
                self.by_namespace.remove(namespace);
            }
        }
    }

    /// Returns the sidecar governing a workload. A sidecar with a matching workload selector is
    /// preferred over the namespace-wide one; ties are broken by name.
    pub fn for_workload(&self, workload: &Workload) -> Option<Arc<Sidecar>> {
        let candidates = self.by_namespace.get(&workload.namespace)?;
        candidates
            .iter()
            .filter(|s| s.workload_selector.is_some() && s.selects(workload))
            .chain(
                candidates
                    .iter()
                    .filter(|s| s.workload_selector.is_none()),
            )
            .next()
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::service::Protocol;
    use crate::state::workload::Labels;
    use crate::strng;

    fn sidecar(name: &str, selector: Option<&str>, ports: &[u16]) -> Sidecar {
        Sidecar {
            name: name.into(),
            namespace: "default".into(),
            workload_selector: selector.map(|app| WorkloadSelector {
                match_labels: Labels::from([(strng::new("app"), strng::new(app))]),
            }),
            ingress: ports
                .iter()
                .map(|p| IngressListener {
                    port: ServicePort {
                        name: strng::EMPTY,
                        number: *p,
                        protocol: Protocol::TCP,
                    },
                    default_endpoint: crate::strng_format!("127.0.0.1:{p}"),
                })
                .collect(),
        }
    }

    fn workload(app: &str) -> Workload {
        Workload {
            name: "wl".into(),
            namespace: "default".into(),
            labels: Labels::from([(strng::new("app"), strng::new(app))]),
            addresses: vec![],
        }
    }

    #[test]
    fn selector_preferred_over_namespace_default() {
        let mut store = SidecarStore::default();
        store.insert(sidecar("a-default", None, &[80]));
        store.insert(sidecar("z-foo", Some("foo"), &[8080]));
        assert_eq!(store.for_workload(&workload("foo")).unwrap().name, "z-foo");
        assert_eq!(store.for_workload(&workload("bar")).unwrap().name, "a-default");
    }

    #[test]
    fn other_namespace_ignored() {
        let mut store = SidecarStore::default();
        store.insert(sidecar("sidecar", Some("foo"), &[8080]));
        let mut wl = workload("foo");
        wl.namespace = "other".into();
        assert!(store.for_workload(&wl).is_none());
        store.remove("default", "sidecar");
        assert!(store.for_workload(&workload("foo")).is_none());
    }

    #[test]
    fn synthetic_hostname() {
        let sc = sidecar("sidecar", Some("foo"), &[8080]);
        assert_eq!(sc.hostname(), "sidecar.default");
        assert!(sc.has_ingress());
        assert!(!sidecar("empty", None, &[]).has_ingress());
    }
}
