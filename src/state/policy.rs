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

use std::collections::{BTreeSet, HashMap};

use itertools::Itertools;

use crate::authn::{PeerAuthentication, PolicyScope};
use crate::state::Error;
use crate::state::workload::Workload;
use crate::strng::{self, Strng};

/// A PolicyStore encapsulates all peer authentication policies in the mesh
#[derive(serde::Serialize, Default, Debug, Clone)]
pub struct PolicyStore {
    /// by_key maintains a mapping of ns/name to policy.
    by_key: HashMap<Strng, PeerAuthentication>,

    /// by_namespace maintains a mapping of namespace (or "" for mesh-wide) to policy keys.
    /// Keys are kept sorted, which is the tie-break order handed to the resolver.
    by_namespace: HashMap<Strng, BTreeSet<Strng>>,
}

impl PolicyStore {
    pub fn get<T: AsRef<str>>(&self, key: T) -> Option<&PeerAuthentication> {
        self.by_key.get(key.as_ref())
    }

    pub fn get_by_namespace<T: AsRef<str>>(&self, namespace: T) -> Vec<Strng> {
        self.by_namespace
            .get(namespace.as_ref())
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn index_key(pa: &PeerAuthentication) -> Strng {
        match pa.scope {
            PolicyScope::Mesh => strng::EMPTY,
            PolicyScope::Namespace | PolicyScope::WorkloadSelector => pa.namespace.clone(),
        }
    }

    pub fn insert(&mut self, pa: PeerAuthentication) {
        let key = pa.to_key();
        // The scope may have changed; drop any stale index entry.
        self.remove(&key);
        self.by_namespace
            .entry(Self::index_key(&pa))
            .or_default()
            .insert(key.clone());
        self.by_key.insert(key, pa);
    }

    pub fn remove(&mut self, key: &str) {
        let Some(pa) = self.by_key.remove(key) else {
            return;
        };
        let idx = Self::index_key(&pa);
        if let Some(pl) = self.by_namespace.get_mut(&idx) {
            pl.remove(key);
            if pl.is_empty() {
                self.by_namespace.remove(&idx);
            }
        }
    }

    /// Returns every policy that could govern the workload: mesh-wide policies followed by the
    /// policies of its namespace, each group in key order. The resolver picks among them.
    pub fn candidates_for(&self, workload: &Workload) -> Vec<&PeerAuthentication> {
        // A workload without a namespace would otherwise visit the mesh index twice.
        [strng::EMPTY, workload.namespace.clone()]
            .iter()
            .unique()
            .filter_map(|ns| self.by_namespace.get(ns))
            .flatten()
            .filter_map(|key| self.by_key.get(key))
            .collect()
    }

    /// Reports when more than one policy at the same scope applies to the workload. The resolver
    /// silently takes the first in key order; callers that want to surface the conflict use this.
    pub fn check_ambiguity(&self, workload: &Workload) -> Result<(), Error> {
        let conflicts = self
            .candidates_for(workload)
            .into_iter()
            .filter(|pa| pa.applies_to(&workload.namespace, &workload.labels))
            .into_group_map_by(|pa| pa.scope)
            .into_iter()
            .filter(|(_, pols)| pols.len() > 1)
            .sorted_by_key(|(scope, _)| *scope)
            .next_back();
        match conflicts {
            Some((scope, pols)) => Err(Error::AmbiguousPolicy {
                workload: workload.to_key(),
                scope,
                policies: pols.iter().map(|pa| pa.to_key()).collect(),
            }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
