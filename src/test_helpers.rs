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

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::Config;
use crate::scenario;
use crate::simulation::{self, Call, Expect, TlsMode};
use crate::state::Snapshot;
use crate::state::service::Protocol;
use crate::state::workload::Workload;
use crate::strng::Strng;
use crate::telemetry;

/// The address of the workload the shared fixtures simulate calls against.
pub const TEST_WORKLOAD_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = telemetry::setup_logging();
});

pub fn initialize_telemetry() {
    Lazy::force(&TRACING);
}

/// A workload `default/foo` labelled `app: foo` at [TEST_WORKLOAD_IP].
pub fn test_workload() -> Workload {
    Workload {
        name: "foo".into(),
        namespace: "default".into(),
        labels: [("app".into(), "foo".into())].into_iter().collect(),
        addresses: vec![TEST_WORKLOAD_IP],
    }
}

/// An inbound call to the test workload. mTLS calls offer the mesh ALPN.
pub fn mk_call(port: u16, protocol: Protocol, tls: TlsMode) -> Call {
    let call = Call::inbound(port, protocol, tls, TEST_WORKLOAD_IP);
    match tls {
        TlsMode::Mtls => call.with_alpn("istio"),
        TlsMode::Plaintext => call,
    }
}

/// Like [mk_call], but never sets an ALPN.
pub fn mk_raw_call(port: u16, protocol: Protocol, tls: TlsMode) -> Call {
    Call::inbound(port, protocol, tls, TEST_WORKLOAD_IP)
}

pub fn expect(name: &str, call: Call, result: Result<&str, simulation::Error>) -> Expect {
    Expect {
        name: name.into(),
        call,
        result: result.map(Strng::from).into(),
        pending: None,
    }
}

pub fn expect_pending(
    name: &str,
    call: Call,
    result: Result<&str, simulation::Error>,
    reason: &str,
) -> Expect {
    Expect {
        pending: Some(reason.into()),
        ..expect(name, call, result)
    }
}

pub fn load(yaml: &str) -> Arc<Snapshot> {
    scenario::load_config(&Config::default(), yaml)
        .unwrap_or_else(|e| panic!("invalid test config: {e}"))
        .into_shared()
}

/// Asserts every expectation, including pending ones, against the snapshot.
pub fn assert_expectations(name: &str, snapshot: &Snapshot, workload: &Workload, calls: &[Expect]) {
    let model = snapshot.listener_model(workload);
    let failures: Vec<String> = simulation::check(&model, calls)
        .into_iter()
        .filter(|o| !o.passed())
        .map(|o| format!("{}: expected {}, got {}", o.name, o.expected, o.actual))
        .collect();
    assert!(
        failures.is_empty(),
        "{name} failed:\n{}\nlisteners:\n{model}",
        failures.join("\n")
    );
}
