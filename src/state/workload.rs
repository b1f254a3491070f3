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

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::trace;

use crate::strng::Strng;

pub type Labels = BTreeMap<Strng, Strng>;

/// A label selector. Every listed label must be present with the same value.
#[derive(Default, Debug, Hash, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSelector {
    // Sidecar resources name this field "labels"; policies name it "matchLabels".
    #[serde(default, alias = "labels")]
    pub match_labels: Labels,
}

impl WorkloadSelector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

#[derive(Debug, Hash, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Workload {
    pub name: Strng,
    pub namespace: Strng,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

impl Workload {
    pub fn to_key(&self) -> Strng {
        crate::strng_format!("{}/{}", self.namespace, self.name)
    }

    pub fn has_address(&self, ip: &IpAddr) -> bool {
        self.addresses.contains(ip)
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A WorkloadStore holds the workloads known to a snapshot.
#[derive(serde::Serialize, Default, Debug, Clone)]
pub struct WorkloadStore {
    /// by_key maps namespace/name to the workload.
    by_key: HashMap<Strng, Arc<Workload>>,
}

impl WorkloadStore {
    pub fn insert(&mut self, w: Workload) {
        self.by_key.insert(w.to_key(), Arc::new(w));
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<Workload>> {
        let prev = self.by_key.remove(key);
        if prev.is_none() {
            trace!("tried to remove workload {key} but it was not found");
        }
        prev
    }

    pub fn get(&self, key: &str) -> Option<Arc<Workload>> {
        self.by_key.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strng;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (strng::new(k), strng::new(v)))
            .collect()
    }

    #[test]
    fn selector_matching() {
        let sel = WorkloadSelector {
            match_labels: labels(&[("app", "foo")]),
        };
        assert!(sel.matches(&labels(&[("app", "foo")])));
        assert!(sel.matches(&labels(&[("app", "foo"), ("version", "v1")])));
        assert!(!sel.matches(&labels(&[("app", "bar")])));
        assert!(!sel.matches(&Labels::new()));
        assert!(WorkloadSelector::default().matches(&Labels::new()));
    }

    #[test]
    fn selector_field_aliases() {
        let a: WorkloadSelector = serde_yaml::from_str("matchLabels: {app: foo}").unwrap();
        let b: WorkloadSelector = serde_yaml::from_str("labels: {app: foo}").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn store_replaces_by_key() {
        let mut store = WorkloadStore::default();
        let ip1: IpAddr = "1.1.1.1".parse().unwrap();
        let ip2: IpAddr = "2.2.2.2".parse().unwrap();
        store.insert(Workload {
            name: "a".into(),
            namespace: "default".into(),
            labels: Labels::new(),
            addresses: vec![ip1],
        });
        store.insert(Workload {
            name: "a".into(),
            namespace: "default".into(),
            labels: Labels::new(),
            addresses: vec![ip2],
        });
        assert_eq!(store.len(), 1);
        let wl = store.get("default/a").unwrap();
        assert!(!wl.has_address(&ip1));
        assert!(wl.has_address(&ip2));
        assert!(store.remove("default/a").is_some());
        assert!(store.remove("default/a").is_none());
        assert!(store.is_empty());
    }
}
