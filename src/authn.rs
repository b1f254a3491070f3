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

//! Peer authentication policy resolution.
//!
//! A workload's effective mTLS mode is taken from exactly one policy: the most specific scope
//! that has any applicable policy. Port level settings in that policy shadow its default, but
//! are never merged with policies at other scopes.

use std::collections::BTreeMap;
use std::fmt;

use tracing::instrument;

use crate::authn_log;
use crate::state::workload::{Labels, WorkloadSelector};
use crate::strng::Strng;

/// The TLS enforcement mode applied to inbound traffic.
#[derive(
    Default, Debug, Hash, Eq, PartialEq, Clone, Copy, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MtlsMode {
    /// Only mTLS traffic is accepted.
    Strict,
    /// Both mTLS and plaintext traffic are accepted.
    #[default]
    Permissive,
    /// Only plaintext traffic is expected; mTLS bytes are not terminated.
    Disable,
}

impl fmt::Display for MtlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MtlsMode::Strict => "STRICT",
            MtlsMode::Permissive => "PERMISSIVE",
            MtlsMode::Disable => "DISABLE",
        };
        f.write_str(s)
    }
}

/// PolicyScope orders policies by specificity; later variants take precedence.
#[derive(
    Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Clone, Copy, serde::Serialize, serde::Deserialize,
)]
pub enum PolicyScope {
    Mesh,
    Namespace,
    WorkloadSelector,
}

#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PeerAuthentication {
    pub name: Strng,
    pub namespace: Strng,
    pub scope: PolicyScope,
    #[serde(default)]
    pub selector: WorkloadSelector,
    #[serde(default)]
    pub mode: MtlsMode,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub port_level_mtls: BTreeMap<u16, MtlsMode>,
}

impl PeerAuthentication {
    pub fn to_key(&self) -> Strng {
        crate::strng_format!("{}/{}", self.namespace, self.name)
    }

    /// Returns true if this policy is a candidate for a workload in `namespace` with `labels`.
    /// Whether it is actually used depends on the other candidates.
    pub fn applies_to(&self, namespace: &str, labels: &Labels) -> bool {
        match self.scope {
            PolicyScope::Mesh => true,
            PolicyScope::Namespace => self.namespace == namespace,
            PolicyScope::WorkloadSelector => {
                self.namespace == namespace && self.selector.matches(labels)
            }
        }
    }
}

/// The outcome of policy resolution for a single workload.
#[derive(Default, Debug, Eq, PartialEq, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePolicy {
    /// Key of the selected policy, if any applied.
    pub source: Option<Strng>,
    pub scope: Option<PolicyScope>,
    pub mode: MtlsMode,
    pub port_level_mtls: BTreeMap<u16, MtlsMode>,
}

impl EffectivePolicy {
    pub fn mode_for_port(&self, port: u16) -> MtlsMode {
        self.port_level_mtls.get(&port).copied().unwrap_or(self.mode)
    }

    pub fn default_mode(&self) -> MtlsMode {
        self.mode
    }

    pub fn port_overrides(&self) -> impl Iterator<Item = (u16, MtlsMode)> + '_ {
        self.port_level_mtls.iter().map(|(p, m)| (*p, *m))
    }
}

impl From<&PeerAuthentication> for EffectivePolicy {
    fn from(pa: &PeerAuthentication) -> Self {
        EffectivePolicy {
            source: Some(pa.to_key()),
            scope: Some(pa.scope),
            mode: pa.mode,
            port_level_mtls: pa.port_level_mtls.clone(),
        }
    }
}

/// Selects the single policy governing a workload.
///
/// `policies` must already be in the caller's tie-break order: among several candidates at the
/// same scope, the first one wins. No policy at all yields the implicit PERMISSIVE default.
#[instrument(level = "trace", skip_all, fields(%namespace))]
pub fn resolve_policy<'a>(
    namespace: &str,
    labels: &Labels,
    policies: impl IntoIterator<Item = &'a PeerAuthentication>,
) -> EffectivePolicy {
    let selected = policies
        .into_iter()
        .filter(|p| p.applies_to(namespace, labels))
        .fold(None::<&PeerAuthentication>, |best, p| match best {
            Some(b) if b.scope >= p.scope => Some(b),
            _ => Some(p),
        });
    match selected {
        Some(pa) => {
            authn_log!(
                policy = %pa.to_key(),
                scope = ?pa.scope,
                mode = %pa.mode,
                "selected peer authentication"
            );
            EffectivePolicy::from(pa)
        }
        None => {
            authn_log!(mode = %MtlsMode::default(), "no peer authentication applies");
            EffectivePolicy::default()
        }
    }
}

/// Resolves the mode for traffic arriving on `port` of a workload.
pub fn resolve_mode<'a>(
    namespace: &str,
    labels: &Labels,
    policies: impl IntoIterator<Item = &'a PeerAuthentication>,
    port: u16,
) -> MtlsMode {
    resolve_policy(namespace, labels, policies).mode_for_port(port)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::strng;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (strng::new(k), strng::new(v)))
            .collect()
    }

    fn policy(
        name: &str,
        namespace: &str,
        scope: PolicyScope,
        mode: MtlsMode,
        ports: &[(u16, MtlsMode)],
    ) -> PeerAuthentication {
        let selector = match scope {
            PolicyScope::WorkloadSelector => WorkloadSelector {
                match_labels: labels(&[("app", "foo")]),
            },
            _ => WorkloadSelector::default(),
        };
        PeerAuthentication {
            name: name.into(),
            namespace: namespace.into(),
            scope,
            selector,
            mode,
            port_level_mtls: ports.iter().copied().collect(),
        }
    }

    fn foo() -> Labels {
        labels(&[("app", "foo"), ("version", "v1")])
    }

    #[test]
    fn no_policy_is_permissive() {
        let got = resolve_policy("default", &foo(), Vec::<&PeerAuthentication>::new());
        assert_eq!(got, EffectivePolicy::default());
        assert_eq!(got.mode_for_port(8080), MtlsMode::Permissive);
        assert_eq!(got.source, None);
    }

    #[test]
    fn workload_beats_namespace_and_mesh() {
        let pols = vec![
            policy("mesh", "istio-system", PolicyScope::Mesh, MtlsMode::Disable, &[]),
            policy(
                "ns",
                "default",
                PolicyScope::Namespace,
                MtlsMode::Permissive,
                &[(9000, MtlsMode::Disable)],
            ),
            policy("wl", "default", PolicyScope::WorkloadSelector, MtlsMode::Strict, &[]),
        ];
        for port in [80, 9000, 15006] {
            assert_eq!(resolve_mode("default", &foo(), &pols, port), MtlsMode::Strict);
        }
        assert_eq!(
            resolve_policy("default", &foo(), &pols).source.as_deref(),
            Some("default/wl")
        );
    }

    #[test]
    fn namespace_beats_mesh() {
        let pols = vec![
            policy("ns", "default", PolicyScope::Namespace, MtlsMode::Disable, &[]),
            policy(
                "mesh",
                "istio-system",
                PolicyScope::Mesh,
                MtlsMode::Strict,
                &[(80, MtlsMode::Permissive)],
            ),
        ];
        assert_eq!(resolve_mode("default", &foo(), &pols, 80), MtlsMode::Disable);
        // A different namespace only sees the mesh policy
        assert_eq!(resolve_mode("other", &foo(), &pols, 80), MtlsMode::Permissive);
        assert_eq!(resolve_mode("other", &foo(), &pols, 81), MtlsMode::Strict);
    }

    #[test]
    fn selector_must_match() {
        let pols = vec![policy(
            "wl",
            "default",
            PolicyScope::WorkloadSelector,
            MtlsMode::Strict,
            &[],
        )];
        assert_eq!(
            resolve_mode("default", &labels(&[("app", "bar")]), &pols, 80),
            MtlsMode::Permissive
        );
        assert_eq!(resolve_mode("default", &Labels::new(), &pols, 80), MtlsMode::Permissive);
        // Selectors never reach across namespaces
        assert_eq!(resolve_mode("other", &foo(), &pols, 80), MtlsMode::Permissive);
    }

    #[test]
    fn first_candidate_wins_within_scope() {
        let pols = vec![
            policy("a", "default", PolicyScope::WorkloadSelector, MtlsMode::Disable, &[]),
            policy("b", "default", PolicyScope::WorkloadSelector, MtlsMode::Strict, &[]),
        ];
        assert_eq!(resolve_mode("default", &foo(), &pols, 80), MtlsMode::Disable);
        let reversed: Vec<_> = pols.iter().rev().collect();
        assert_eq!(resolve_mode("default", &foo(), reversed, 80), MtlsMode::Strict);
    }

    #[test]
    fn overrides_do_not_cross_scopes() {
        let pols = vec![
            policy(
                "ns",
                "default",
                PolicyScope::Namespace,
                MtlsMode::Permissive,
                &[(9000, MtlsMode::Disable)],
            ),
            policy(
                "wl",
                "default",
                PolicyScope::WorkloadSelector,
                MtlsMode::Strict,
                &[(8000, MtlsMode::Permissive)],
            ),
        ];
        assert_eq!(resolve_mode("default", &foo(), &pols, 9000), MtlsMode::Strict);
        assert_eq!(resolve_mode("default", &foo(), &pols, 8000), MtlsMode::Permissive);
    }

    #[test_case(MtlsMode::Strict, MtlsMode::Disable; "strict with disabled port")]
    #[test_case(MtlsMode::Disable, MtlsMode::Strict; "disable with strict port")]
    #[test_case(MtlsMode::Disable, MtlsMode::Permissive; "disable with permissive port")]
    fn port_override_shadows_default(default: MtlsMode, port_mode: MtlsMode) {
        let pols = vec![policy(
            "wl",
            "default",
            PolicyScope::WorkloadSelector,
            default,
            &[(9000, port_mode)],
        )];
        assert_eq!(resolve_mode("default", &foo(), &pols, 9000), port_mode);
        assert_eq!(resolve_mode("default", &foo(), &pols, 8000), default);
        assert_eq!(resolve_mode("default", &foo(), &pols, 9001), default);
    }

    #[test]
    fn mode_serialization() {
        assert_eq!(serde_yaml::from_str::<MtlsMode>("STRICT").unwrap(), MtlsMode::Strict);
        assert_eq!(serde_yaml::from_str::<MtlsMode>("DISABLE").unwrap(), MtlsMode::Disable);
        assert_eq!(MtlsMode::Permissive.to_string(), "PERMISSIVE");
    }
}
