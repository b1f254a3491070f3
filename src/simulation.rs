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

//! Replays synthetic inbound connections through a [ListenerModel].

use std::fmt;
use std::net::IpAddr;

use tracing::{instrument, trace};

use crate::listener::{FilterChain, ListenerModel, MatchResult};
use crate::state::service::Protocol;
use crate::strng::Strng;

#[derive(
    Default, Debug, Hash, Eq, PartialEq, Clone, Copy, serde::Serialize, serde::Deserialize,
)]
pub enum TlsMode {
    #[default]
    Plaintext,
    #[serde(alias = "MTLS", alias = "mtls")]
    Mtls,
}

#[derive(
    Default, Debug, Hash, Eq, PartialEq, Clone, Copy, serde::Serialize, serde::Deserialize,
)]
pub enum CallMode {
    #[default]
    Inbound,
    Outbound,
}

/// A synthetic connection arriving at a workload.
#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Call {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub tls: TlsMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Strng>,
    /// The destination address of the connection.
    pub address: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<IpAddr>,
    #[serde(default)]
    pub call_mode: CallMode,
}

impl Call {
    pub fn inbound(port: u16, protocol: Protocol, tls: TlsMode, address: IpAddr) -> Call {
        Call {
            port,
            protocol,
            tls,
            alpn: None,
            address,
            source: None,
            call_mode: CallMode::Inbound,
        }
    }

    pub fn with_alpn(mut self, alpn: impl Into<Strng>) -> Call {
        self.alpn = Some(alpn.into());
        self
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} {:?} {}:{}",
            self.call_mode, self.protocol, self.tls, self.address, self.port
        )?;
        if let Some(alpn) = &self.alpn {
            write!(f, " alpn={alpn}")?;
        }
        Ok(())
    }
}

/// Why a call did not reach a destination.
#[derive(
    thiserror::Error, Debug, Hash, Eq, PartialEq, Clone, Copy, serde::Serialize, serde::Deserialize,
)]
pub enum Error {
    /// No chain accepted the connection; it is dropped before any data is proxied.
    #[error("no filter chain matched")]
    NoFilterChain,
    /// A chain accepted the connection but could not parse what was sent.
    #[error("protocol error")]
    ProtocolError,
    #[error("only inbound calls can be simulated")]
    UnsupportedCallMode,
}

/// Evaluates a call against the listeners of a workload, returning the matched cluster.
#[instrument(level = "trace", skip_all, fields(workload = %model.workload, call = %call))]
pub fn evaluate(model: &ListenerModel, call: &Call) -> Result<Strng, Error> {
    if call.call_mode != CallMode::Inbound {
        return Err(Error::UnsupportedCallMode);
    }
    let listener = model.listener_for_port(call.port);
    trace!(listener = %listener.name, "selected listener");

    // Destination port narrows first: chains naming the port shadow chains naming none.
    let by_port: Vec<(&FilterChain, MatchResult)> = listener
        .chains
        .iter()
        .map(|c| (c, c.filter_chain_match.matches_destination_port(call.port)))
        .collect();
    let wanted = if by_port.iter().any(|(_, m)| *m == MatchResult::Matched) {
        MatchResult::Matched
    } else {
        MatchResult::NoRule
    };

    let chain = by_port
        .into_iter()
        .filter(|(_, m)| *m == wanted)
        .map(|(c, _)| c)
        .filter(|c| c.filter_chain_match.matches_destination_ip(call.address))
        .find(|c| {
            let matches = c
                .filter_chain_match
                .matches_transport(call.tls, call.alpn.as_deref());
            trace!(chain = %c.name, matches, "chain");
            matches
        })
        .ok_or(Error::NoFilterChain)?;

    if chain.protocol.is_http() && !can_parse_http(chain, call) {
        trace!(chain = %chain.name, "request is not parseable as HTTP");
        return Err(Error::ProtocolError);
    }
    Ok(chain.destination.clone())
}

fn can_parse_http(chain: &FilterChain, call: &Call) -> bool {
    let encrypted = call.tls == TlsMode::Mtls && !chain.terminates_tls;
    !encrypted && call.protocol.is_http()
}

/// An expected outcome for a call.
#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expected {
    Cluster(Strng),
    Error(Error),
}

impl Expected {
    pub fn matches(&self, actual: &Result<Strng, Error>) -> bool {
        match (self, actual) {
            (Expected::Cluster(want), Ok(got)) => want == got,
            (Expected::Error(want), Err(got)) => want == got,
            _ => false,
        }
    }
}

impl From<Result<Strng, Error>> for Expected {
    fn from(r: Result<Strng, Error>) -> Self {
        match r {
            Ok(c) => Expected::Cluster(c),
            Err(e) => Expected::Error(e),
        }
    }
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expected::Cluster(c) => write!(f, "cluster {c}"),
            Expected::Error(e) => write!(f, "error {e:?}"),
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Expect {
    pub name: Strng,
    pub call: Call,
    /// Written as a single entry map, `{cluster: <name>}` or `{error: <Error>}`.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub result: Expected,
    /// Set when the expected result documents behavior that is known to be wrong and awaits a
    /// decision. The observed behavior is still asserted so changes are noticed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Strng>,
}

#[derive(Debug, Eq, PartialEq, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub name: Strng,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub expected: Expected,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub actual: Expected,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<Strng>,
}

impl Outcome {
    pub fn passed(&self) -> bool {
        self.expected == self.actual
    }
}

/// Evaluates each expectation against the model.
pub fn check(model: &ListenerModel, expects: &[Expect]) -> Vec<Outcome> {
    expects
        .iter()
        .map(|e| {
            let actual = evaluate(model, &e.call);
            if !e.result.matches(&actual) {
                trace!(name = %e.name, expected = %e.result, "expectation failed");
            }
            Outcome {
                name: e.name.clone(),
                expected: e.result.clone(),
                actual: actual.into(),
                pending: e.pending.clone(),
            }
        })
        .collect()
}
