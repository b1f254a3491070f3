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

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::authn::{self, EffectivePolicy, MtlsMode, PolicyScope};
use crate::listener::{BuildInputs, ListenerModel};
use crate::simulation::{self, Call};
use crate::state::policy::PolicyStore;
use crate::state::service::ServiceStore;
use crate::state::sidecar::SidecarStore;
use crate::state::workload::{Workload, WorkloadStore};
use crate::strng::Strng;

pub mod policy;
pub mod service;
pub mod sidecar;
pub mod workload;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("workload {workload} matches multiple {scope:?} policies: {policies:?}")]
    AmbiguousPolicy {
        workload: Strng,
        scope: PolicyScope,
        policies: Vec<Strng>,
    },
}

/// An immutable view of the mesh configuration. Every resolution reads one snapshot; a
/// configuration change produces a new snapshot rather than mutating a shared one.
#[derive(serde::Serialize, Default, Debug, Clone)]
pub struct Snapshot {
    pub workloads: WorkloadStore,
    pub services: ServiceStore,
    pub sidecars: SidecarStore,
    pub policies: PolicyStore,
}

impl Snapshot {
    pub fn into_shared(self) -> Arc<Snapshot> {
        Arc::new(self)
    }

    pub fn effective_policy(&self, workload: &Workload) -> EffectivePolicy {
        authn::resolve_policy(
            &workload.namespace,
            &workload.labels,
            self.policies.candidates_for(workload),
        )
    }

    pub fn resolve_mode(&self, workload: &Workload, port: u16) -> MtlsMode {
        self.effective_policy(workload).mode_for_port(port)
    }

    #[instrument(level = "debug", skip_all, fields(workload = %workload))]
    pub fn listener_model(&self, workload: &Workload) -> ListenerModel {
        let policy = self.effective_policy(workload);
        let service_ports = self.services.ports_for_workload(workload);
        let sidecar = self.sidecars.for_workload(workload);
        debug!(
            policy = ?policy.source,
            ports = service_ports.len(),
            sidecar = ?sidecar.as_ref().map(|s| s.to_key()),
            "building listeners"
        );
        ListenerModel::build(&BuildInputs {
            workload,
            service_ports: &service_ports,
            sidecar: sidecar.as_deref(),
            policy: &policy,
        })
    }

    /// Runs the full pipeline for a single call against a workload.
    pub fn evaluate(&self, workload: &Workload, call: &Call) -> Result<Strng, simulation::Error> {
        simulation::evaluate(&self.listener_model(workload), call)
    }
}
