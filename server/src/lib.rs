// Copyright 2022 Ryan Seipp
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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! gaffel is a prefork HTTP/1.1 server.
//!
//! One master process owns the listening socket; a pool of forked worker
//! processes handles the connections it accepts. Each accepted descriptor
//! is placed by a load-balancing policy and transferred to its worker
//! out-of-band (`SCM_RIGHTS` over a per-worker control channel) alongside a
//! JSON metadata frame. Workers multiplex their connections on a single
//! readiness-polled thread: parse, dispatch to the user callback, write,
//! recycle for keep-alive. Where descriptor passing or fork is unavailable
//! the pool degrades to threads in a single process, over the very same
//! channels.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gaffel::{Master, ServerConfig, WorkerPoolConfig};
//! use parser::h1::response::Response;
//!
//! fn main() -> Result<(), gaffel::Error> {
//!     let handler = Arc::new(|_req: &parser::h1::request::Request| {
//!         Response::new(200).body("hello")
//!     });
//!
//!     let mut master = Master::bind(
//!         ServerConfig::default(),
//!         WorkerPoolConfig::default(),
//!         handler,
//!     )?;
//!     master.run()
//! }
//! ```

mod buffer;

pub mod balancer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod ipc;
pub mod master;
pub mod pool;
pub mod signal;
pub mod worker;

pub use config::{BalancerKind, ServerConfig, WorkerPoolConfig};
pub use error::{Error, Result};
pub use master::{Master, SpawnMode};
pub use worker::Handler;
