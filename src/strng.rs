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

use arcstr::ArcStr;

/// Strng is the shared, cheaply clonable string type used for every name in a snapshot.
pub type Strng = ArcStr;

pub use arcstr::literal;

pub const EMPTY: Strng = literal!("");

pub fn new<A: AsRef<str>>(s: A) -> Strng {
    ArcStr::from(s.as_ref())
}

pub fn format(args: std::fmt::Arguments<'_>) -> Strng {
    match args.as_str() {
        Some(s) => ArcStr::from(s),
        None => ArcStr::from(std::fmt::format(args)),
    }
}

/// Builds a Strng from a format string, skipping the allocation for plain literals.
#[macro_export]
macro_rules! strng_format {
    ($($arg:tt)*) => {
        $crate::strng::format(format_args!($($arg)*))
    };
}
