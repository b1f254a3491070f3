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

//! Inbound listener generation.
//!
//! A workload gets one listener per inbound port it exposes, plus a catch-all passthrough listener
//! for everything else. Each listener carries an ordered list of filter chains; evaluation takes
//! the first chain whose predicates accept a connection, so the order built here is part of the
//! contract: port specific chains come before catch-all chains, and chains with transport or ALPN
//! predicates come before chains without them.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use itertools::Itertools;
use tracing::{debug, trace};

use crate::authn::{EffectivePolicy, MtlsMode};
use crate::simulation::TlsMode;
use crate::state::service::{Protocol, ServicePort, ServicePortDeclaration};
use crate::state::sidecar::Sidecar;
use crate::state::workload::Workload;
use crate::strng::{self, Strng};

pub const PASSTHROUGH_CLUSTER_IPV4: Strng = strng::literal!("InboundPassthroughClusterIpv4");
pub const PASSTHROUGH_CLUSTER_IPV6: Strng = strng::literal!("InboundPassthroughClusterIpv6");
pub const PASSTHROUGH_LISTENER: Strng = strng::literal!("virtualInbound");

/// ALPN tokens offered by mesh clients when tunnelling over mTLS.
pub const ISTIO_ALPNS: [&str; 5] = [
    "istio",
    "istio-peer-exchange",
    "istio-http/1.0",
    "istio-http/1.1",
    "istio-h2",
];

pub fn is_istio_alpn(alpn: &str) -> bool {
    ISTIO_ALPNS.contains(&alpn)
}

pub fn inbound_cluster_name(port: u16, host: &str) -> Strng {
    crate::strng_format!("inbound|{port}||{host}")
}

#[derive(Debug, Hash, Eq, PartialEq, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainKind {
    TlsRequired,
    PlaintextRequired,
    Either,
    /// Forwards whatever arrives without looking at the transport.
    Passthrough,
}

impl From<MtlsMode> for ChainKind {
    fn from(mode: MtlsMode) -> Self {
        match mode {
            MtlsMode::Strict => ChainKind::TlsRequired,
            MtlsMode::Disable => ChainKind::PlaintextRequired,
            MtlsMode::Permissive => ChainKind::Either,
        }
    }
}

#[derive(Default, Debug, Hash, Eq, PartialEq, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMatch {
    #[default]
    Any,
    Tls,
    RawBuffer,
}

#[derive(Default, Debug, Hash, Eq, PartialEq, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlpnMatch {
    #[default]
    Any,
    Istio,
    NotIstio,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MatchResult {
    FailedMatch,
    NoRule,
    Matched,
}

#[derive(Default, Debug, Hash, Eq, PartialEq, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterChainMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub destination_prefix_ranges: Vec<IpNet>,
    pub transport_protocol: TransportMatch,
    pub application_protocols: AlpnMatch,
}

impl FilterChainMatch {
    pub fn matches_destination_port(&self, port: u16) -> MatchResult {
        match self.destination_port {
            Some(p) if p == port => MatchResult::Matched,
            Some(_) => MatchResult::FailedMatch,
            None => MatchResult::NoRule,
        }
    }

    pub fn matches_destination_ip(&self, ip: IpAddr) -> bool {
        self.destination_prefix_ranges.is_empty()
            || self.destination_prefix_ranges.iter().any(|r| r.contains(&ip))
    }

    pub fn matches_transport(&self, tls: TlsMode, alpn: Option<&str>) -> bool {
        let transport = match self.transport_protocol {
            TransportMatch::Any => true,
            TransportMatch::Tls => tls == TlsMode::Mtls,
            TransportMatch::RawBuffer => tls == TlsMode::Plaintext,
        };
        let istio = tls == TlsMode::Mtls && alpn.is_some_and(is_istio_alpn);
        let alpn = match self.application_protocols {
            AlpnMatch::Any => true,
            AlpnMatch::Istio => istio,
            AlpnMatch::NotIstio => !istio,
        };
        transport && alpn
    }

    /// Orders chains for evaluation; higher is tried first.
    fn specificity(&self) -> (bool, usize) {
        let predicates = [
            self.transport_protocol != TransportMatch::Any,
            self.application_protocols != AlpnMatch::Any,
        ];
        (
            self.destination_port.is_some(),
            predicates.into_iter().filter(|p| *p).count(),
        )
    }
}

#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterChain {
    pub name: Strng,
    pub filter_chain_match: FilterChainMatch,
    pub kind: ChainKind,
    /// The protocol the chain parses once any TLS is handled.
    pub protocol: Protocol,
    pub terminates_tls: bool,
    pub destination: Strng,
}

#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: Strng,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Whether connections are inspected for TLS before chain selection.
    pub tls_inspector: bool,
    pub chains: Vec<FilterChain>,
}

impl Listener {
    fn new(name: Strng, port: Option<u16>, mut chains: Vec<FilterChain>) -> Self {
        chains.sort_by_key(|c| Reverse(c.filter_chain_match.specificity()));
        let tls_inspector = chains
            .iter()
            .any(|c| c.filter_chain_match.transport_protocol != TransportMatch::Any);
        Listener {
            name,
            port,
            tls_inspector,
            chains,
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]",
            self.name,
            self.chains.iter().map(|c| &c.name).join(",")
        )
    }
}

/// Everything the builder needs about one workload, taken from a single snapshot.
#[derive(Debug, Clone, Copy)]
pub struct BuildInputs<'a> {
    pub workload: &'a Workload,
    pub service_ports: &'a [ServicePortDeclaration],
    pub sidecar: Option<&'a Sidecar>,
    pub policy: &'a EffectivePolicy,
}

#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerModel {
    pub workload: Strng,
    pub listeners: BTreeMap<u16, Listener>,
    pub passthrough: Listener,
}

impl fmt::Display for ListenerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for l in self.listeners.values() {
            writeln!(f, "{l}")?;
        }
        write!(f, "{}", self.passthrough)
    }
}

/// How a DISABLE chain treats the transport.
#[derive(Debug, Clone, Copy)]
enum PlaintextChain {
    /// A dedicated port listener never inspects TLS. Anything reaching it is parsed as plaintext.
    Unsniffed,
    /// The listener inspects TLS for other chains; only raw connections are accepted here.
    RawOnly,
    /// Nothing on the listener inspects TLS; bytes are forwarded untouched.
    Forward,
}

struct ChainTemplate {
    name: Strng,
    destination_port: Option<u16>,
    destination_prefix_ranges: Vec<IpNet>,
    protocol: Protocol,
    destination: Strng,
}

impl ChainTemplate {
    fn chain(
        &self,
        suffix: &str,
        kind: ChainKind,
        transport_protocol: TransportMatch,
        application_protocols: AlpnMatch,
    ) -> FilterChain {
        FilterChain {
            name: crate::strng_format!("{}-{suffix}", self.name),
            filter_chain_match: FilterChainMatch {
                destination_port: self.destination_port,
                destination_prefix_ranges: self.destination_prefix_ranges.clone(),
                transport_protocol,
                application_protocols,
            },
            kind,
            protocol: self.protocol,
            terminates_tls: transport_protocol == TransportMatch::Tls,
            destination: self.destination.clone(),
        }
    }

    fn for_mode(&self, mode: MtlsMode, plaintext: PlaintextChain) -> Vec<FilterChain> {
        let kind = ChainKind::from(mode);
        match mode {
            MtlsMode::Strict => vec![self.chain("mtls", kind, TransportMatch::Tls, AlpnMatch::Any)],
            MtlsMode::Permissive => vec![
                self.chain("mtls", kind, TransportMatch::Tls, AlpnMatch::Istio),
                self.chain("plaintext", kind, TransportMatch::Any, AlpnMatch::NotIstio),
            ],
            MtlsMode::Disable => match plaintext {
                PlaintextChain::Unsniffed => {
                    vec![self.chain("plaintext", kind, TransportMatch::Any, AlpnMatch::Any)]
                }
                PlaintextChain::RawOnly => {
                    vec![self.chain("plaintext", kind, TransportMatch::RawBuffer, AlpnMatch::Any)]
                }
                PlaintextChain::Forward => vec![self.chain(
                    "passthrough",
                    ChainKind::Passthrough,
                    TransportMatch::Any,
                    AlpnMatch::Any,
                )],
            },
        }
    }
}

impl ListenerModel {
    pub fn build(inputs: &BuildInputs<'_>) -> ListenerModel {
        let policy = inputs.policy;
        let listeners: BTreeMap<u16, Listener> = Self::inbound_ports(inputs)
            .into_iter()
            .map(|(port, host)| {
                let mode = policy.mode_for_port(port.number);
                let name = crate::strng_format!("inbound_{}", port.number);
                let template = ChainTemplate {
                    name: name.clone(),
                    destination_port: Some(port.number),
                    destination_prefix_ranges: Vec::new(),
                    protocol: port.protocol,
                    destination: inbound_cluster_name(port.number, &host),
                };
                let l = Listener::new(
                    name,
                    Some(port.number),
                    template.for_mode(mode, PlaintextChain::Unsniffed),
                );
                debug!(listener = %l, %mode, protocol = %port.protocol, "built port listener");
                (port.number, l)
            })
            .collect();

        let passthrough = Self::passthrough(policy, &listeners);
        debug!(
            listener = %passthrough,
            mode = %policy.default_mode(),
            "built passthrough listener"
        );
        ListenerModel {
            workload: inputs.workload.to_key(),
            listeners,
            passthrough,
        }
    }

    /// Returns the ports that get a dedicated listener, with the host their cluster is named after.
    fn inbound_ports(inputs: &BuildInputs<'_>) -> Vec<(ServicePort, Strng)> {
        match inputs.sidecar.filter(|sc| sc.has_ingress()) {
            // The sidecar is the only source of inbound ports. A port a service also declares keeps
            // the service's cluster; anything else is named after the sidecar.
            Some(sc) => sc
                .ingress
                .iter()
                .unique_by(|il| il.port.number)
                .map(|il| {
                    let host = inputs
                        .service_ports
                        .iter()
                        .find(|d| d.port.number == il.port.number)
                        .map(|d| d.hostname.clone())
                        .unwrap_or_else(|| sc.hostname());
                    trace!(port = il.port.number, %host, "sidecar ingress port");
                    (il.port.clone(), host)
                })
                .collect(),
            None => inputs
                .service_ports
                .iter()
                .unique_by(|d| d.port.number)
                .map(|d| (d.port.clone(), d.hostname.clone()))
                .collect(),
        }
    }

    fn passthrough(policy: &EffectivePolicy, listeners: &BTreeMap<u16, Listener>) -> Listener {
        // Port level settings still apply to ports without a dedicated listener, matched by
        // destination port ahead of the catch-all chains for the default mode.
        let groups: Vec<(Option<u16>, MtlsMode)> = policy
            .port_overrides()
            .filter(|(port, _)| !listeners.contains_key(port))
            .map(|(port, mode)| (Some(port), mode))
            .chain(std::iter::once((None, policy.default_mode())))
            .collect();
        let plaintext = if groups.iter().all(|(_, mode)| *mode == MtlsMode::Disable) {
            PlaintextChain::Forward
        } else {
            PlaintextChain::RawOnly
        };
        let families = [
            (
                "ipv4",
                IpNet::V4(Ipv4Net::default()),
                PASSTHROUGH_CLUSTER_IPV4,
            ),
            (
                "ipv6",
                IpNet::V6(Ipv6Net::default()),
                PASSTHROUGH_CLUSTER_IPV6,
            ),
        ];
        let chains = families
            .iter()
            .cartesian_product(groups.iter())
            .flat_map(|((family, net, cluster), (port, mode))| {
                let scope = match port {
                    Some(p) => p.to_string(),
                    None => "catchall".to_string(),
                };
                ChainTemplate {
                    name: crate::strng_format!("{PASSTHROUGH_LISTENER}-{family}-{scope}"),
                    destination_port: *port,
                    destination_prefix_ranges: vec![*net],
                    protocol: Protocol::TCP,
                    destination: cluster.clone(),
                }
                .for_mode(*mode, plaintext)
            })
            .collect();
        Listener::new(PASSTHROUGH_LISTENER, None, chains)
    }

    /// Returns the listener a connection to `port` lands on.
    pub fn listener_for_port(&self, port: u16) -> &Listener {
        self.listeners.get(&port).unwrap_or(&self.passthrough)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.listeners.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authn::PolicyScope;
    use crate::state::sidecar::IngressListener;
    use crate::state::workload::Labels;

    fn workload() -> Workload {
        Workload {
            name: "foo".into(),
            namespace: "default".into(),
            labels: Labels::new(),
            addresses: vec!["1.1.1.1".parse().unwrap()],
        }
    }

    fn policy(mode: MtlsMode, ports: &[(u16, MtlsMode)]) -> EffectivePolicy {
        EffectivePolicy {
            source: Some("default/default".into()),
            scope: Some(PolicyScope::WorkloadSelector),
            mode,
            port_level_mtls: ports.iter().copied().collect(),
        }
    }

    fn port(number: u16, protocol: Protocol) -> ServicePort {
        ServicePort {
            name: crate::strng_format!("port-{number}"),
            number,
            protocol,
        }
    }

    fn declared(ports: &[(u16, Protocol)]) -> Vec<ServicePortDeclaration> {
        ports
            .iter()
            .map(|(n, p)| ServicePortDeclaration {
                hostname: "foo.bar".into(),
                port: port(*n, *p),
            })
            .collect()
    }

    fn sidecar(ports: &[u16]) -> Sidecar {
        Sidecar {
            name: "sidecar".into(),
            namespace: "default".into(),
            workload_selector: None,
            ingress: ports
                .iter()
                .map(|p| IngressListener {
                    port: port(*p, Protocol::TCP),
                    default_endpoint: crate::strng_format!("127.0.0.1:{p}"),
                })
                .collect(),
        }
    }

    fn build(
        policy: &EffectivePolicy,
        ports: &[ServicePortDeclaration],
        sidecar: Option<&Sidecar>,
    ) -> ListenerModel {
        ListenerModel::build(&BuildInputs {
            workload: &workload(),
            service_ports: ports,
            sidecar,
            policy,
        })
    }

    fn kinds(l: &Listener) -> Vec<ChainKind> {
        l.chains.iter().map(|c| c.kind).collect()
    }

    #[test]
    fn chain_kind_follows_mode() {
        let ports = declared(&[
            (8080, Protocol::HTTP),
            (9090, Protocol::TCP),
            (7070, Protocol::TCP),
        ]);
        let pol = policy(
            MtlsMode::Strict,
            &[(9090, MtlsMode::Disable), (7070, MtlsMode::Permissive)],
        );
        let m = build(&pol, &ports, None);
        assert_eq!(m.ports().collect::<Vec<_>>(), vec![7070, 8080, 9090]);
        assert_eq!(kinds(&m.listeners[&8080]), vec![ChainKind::TlsRequired]);
        assert_eq!(kinds(&m.listeners[&9090]), vec![ChainKind::PlaintextRequired]);
        assert_eq!(kinds(&m.listeners[&7070]), vec![ChainKind::Either, ChainKind::Either]);
        assert!(!m.listeners[&9090].tls_inspector);
        assert!(m.listeners[&8080].tls_inspector);
    }

    #[test]
    fn permissive_siblings_share_destination() {
        let m = build(
            &policy(MtlsMode::Permissive, &[]),
            &declared(&[(8000, Protocol::HTTP)]),
            None,
        );
        let l = &m.listeners[&8000];
        assert_eq!(l.chains.len(), 2);
        assert_eq!(l.chains[0].filter_chain_match.application_protocols, AlpnMatch::Istio);
        assert!(l.chains[0].terminates_tls);
        assert_eq!(l.chains[1].filter_chain_match.application_protocols, AlpnMatch::NotIstio);
        assert!(!l.chains[1].terminates_tls);
        assert!(l.chains.iter().all(|c| c.destination == "inbound|8000||foo.bar"));
    }

    #[test]
    fn no_ports_only_passthrough() {
        let m = build(&policy(MtlsMode::Strict, &[(9000, MtlsMode::Disable)]), &[], None);
        assert!(m.listeners.is_empty());
        assert_eq!(m.listener_for_port(8000).name, PASSTHROUGH_LISTENER);
        assert_eq!(m.listener_for_port(9000).name, PASSTHROUGH_LISTENER);
        // Per family: one port 9000 chain and one catch-all chain
        assert_eq!(m.passthrough.chains.len(), 4);
        assert!(
            m.passthrough.chains[..2]
                .iter()
                .all(|c| c.filter_chain_match.destination_port == Some(9000))
        );
        assert!(
            m.passthrough.chains[2..]
                .iter()
                .all(|c| c.filter_chain_match.destination_port.is_none())
        );
    }

    #[test]
    fn sidecar_is_exclusive() {
        let ports = declared(&[(8080, Protocol::TCP), (9090, Protocol::TCP)]);
        let sc = sidecar(&[8080]);
        let m = build(&policy(MtlsMode::Strict, &[(9090, MtlsMode::Disable)]), &ports, Some(&sc));
        assert_eq!(m.ports().collect::<Vec<_>>(), vec![8080]);
        assert_eq!(m.listeners[&8080].chains[0].destination, "inbound|8080||foo.bar");
        assert_eq!(m.listener_for_port(9090).name, PASSTHROUGH_LISTENER);
        // The 9090 override moved onto the passthrough listener
        assert!(
            m.passthrough
                .chains
                .iter()
                .any(|c| c.filter_chain_match.destination_port == Some(9090))
        );
    }

    #[test]
    fn sidecar_without_service_uses_sidecar_host() {
        let ports = declared(&[(5050, Protocol::TCP)]);
        let sc = sidecar(&[8080, 9090]);
        let m = build(&policy(MtlsMode::Strict, &[]), &ports, Some(&sc));
        assert_eq!(m.ports().collect::<Vec<_>>(), vec![8080, 9090]);
        assert_eq!(m.listeners[&9090].chains[0].destination, "inbound|9090||sidecar.default");
    }

    #[test]
    fn sidecar_without_ingress_is_ignored() {
        let ports = declared(&[(8080, Protocol::TCP)]);
        let sc = sidecar(&[]);
        let m = build(&policy(MtlsMode::Strict, &[]), &ports, Some(&sc));
        assert_eq!(m.ports().collect::<Vec<_>>(), vec![8080]);
    }

    #[test]
    fn passthrough_inspection() {
        // Nothing needs TLS: the DISABLE chain forwards anything
        let m = build(&policy(MtlsMode::Disable, &[]), &[], None);
        assert!(!m.passthrough.tls_inspector);
        assert!(kinds(&m.passthrough).iter().all(|k| *k == ChainKind::Passthrough));

        // A STRICT port forces inspection, so the DISABLE default only takes raw connections
        let m = build(&policy(MtlsMode::Disable, &[(9000, MtlsMode::Strict)]), &[], None);
        assert!(m.passthrough.tls_inspector);
        let catchall: Vec<_> = m
            .passthrough
            .chains
            .iter()
            .filter(|c| c.filter_chain_match.destination_port.is_none())
            .collect();
        assert!(catchall.iter().all(|c| {
            c.kind == ChainKind::PlaintextRequired
                && c.filter_chain_match.transport_protocol == TransportMatch::RawBuffer
        }));
    }

    #[test]
    fn override_on_dedicated_port_not_duplicated() {
        let ports = declared(&[(9000, Protocol::HTTP)]);
        let m = build(&policy(MtlsMode::Strict, &[(9000, MtlsMode::Disable)]), &ports, None);
        assert_eq!(kinds(&m.listeners[&9000]), vec![ChainKind::PlaintextRequired]);
        assert!(
            m.passthrough
                .chains
                .iter()
                .all(|c| c.filter_chain_match.destination_port.is_none())
        );
    }

    #[test]
    fn passthrough_clusters_per_family() {
        let m = build(&policy(MtlsMode::Permissive, &[]), &[], None);
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        let v6: IpAddr = "fd00::1".parse().unwrap();
        for c in &m.passthrough.chains {
            let is_v4 = c.filter_chain_match.matches_destination_ip(v4);
            assert_ne!(is_v4, c.filter_chain_match.matches_destination_ip(v6));
            let want = if is_v4 { PASSTHROUGH_CLUSTER_IPV4 } else { PASSTHROUGH_CLUSTER_IPV6 };
            assert_eq!(c.destination, want);
        }
    }

    #[test]
    fn transport_predicates() {
        let tls = FilterChainMatch {
            transport_protocol: TransportMatch::Tls,
            application_protocols: AlpnMatch::Istio,
            ..Default::default()
        };
        assert!(tls.matches_transport(TlsMode::Mtls, Some("istio")));
        assert!(tls.matches_transport(TlsMode::Mtls, Some("istio-http/1.1")));
        assert!(!tls.matches_transport(TlsMode::Mtls, Some("h2")));
        assert!(!tls.matches_transport(TlsMode::Mtls, None));
        assert!(!tls.matches_transport(TlsMode::Plaintext, None));

        let raw = FilterChainMatch {
            transport_protocol: TransportMatch::RawBuffer,
            ..Default::default()
        };
        assert!(raw.matches_transport(TlsMode::Plaintext, None));
        assert!(!raw.matches_transport(TlsMode::Mtls, Some("istio")));

        let not_istio = FilterChainMatch {
            application_protocols: AlpnMatch::NotIstio,
            ..Default::default()
        };
        assert!(not_istio.matches_transport(TlsMode::Plaintext, None));
        assert!(not_istio.matches_transport(TlsMode::Mtls, None));
        assert!(!not_istio.matches_transport(TlsMode::Mtls, Some("istio")));
    }

    #[test]
    fn cluster_naming() {
        assert_eq!(inbound_cluster_name(8000, "foo.bar"), "inbound|8000||foo.bar");
        assert_eq!(PASSTHROUGH_CLUSTER_IPV4, "InboundPassthroughClusterIpv4");
    }
}
