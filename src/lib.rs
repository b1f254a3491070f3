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

use once_cell::sync::Lazy;
use std::env;

pub mod authn;
pub mod config;
pub mod listener;
pub mod scenario;
pub mod simulation;
pub mod state;
pub mod strng;
pub mod telemetry;
pub mod version;

#[cfg(any(test, feature = "testing"))]
pub mod test_helpers;

/// When true, peer authentication policy logs are emitted at INFO level instead of DEBUG.
pub static AUTHN_POLICY_INFO_LOGGING: Lazy<bool> =
    Lazy::new(|| env::var("AUTHN_POLICY_INFO_LOGGING").unwrap_or_default() == "true");

/// Logs a message at INFO level if AUTHN_POLICY_INFO_LOGGING is set to "true",
/// otherwise logs at DEBUG level.
#[macro_export]
macro_rules! authn_log {
    ($($arg:tt)+) => {
        if *$crate::AUTHN_POLICY_INFO_LOGGING {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}
