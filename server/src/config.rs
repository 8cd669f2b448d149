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

//! Server and worker-pool configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Hard ceiling on the worker count, auto-detected or explicit.
pub const MAX_WORKERS: usize = 1024;

/// Selection policy used by the master to place accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerKind {
    /// Pick the worker with the fewest active connections.
    LeastConnections,
    /// Rotate through workers in id order.
    RoundRobin,
    /// Accepted for configuration compatibility; resolves to
    /// least-connections at construction.
    Weighted,
}

impl FromStr for BalancerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_connections" => Ok(BalancerKind::LeastConnections),
            "round_robin" => Ok(BalancerKind::RoundRobin),
            "weighted" => Ok(BalancerKind::Weighted),
            other => Err(Error::Config(format!("unknown balancer '{other}'"))),
        }
    }
}

/// Per-server tunables: socket endpoint, connection and request policies.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub host: String,
    /// Port the listener binds to.
    pub port: u16,
    /// How long a single request may take from first byte to response.
    pub request_timeout: Duration,
    /// How long a connection may sit idle before it is closed.
    pub connection_timeout: Duration,
    /// Upper bound on connections a single worker keeps open.
    pub max_connections: usize,
    /// Upper bound on total request size, headers and body combined.
    pub max_request_size: usize,
    /// Per-cycle read cap and response write batching size.
    pub buffer_size: usize,
    /// Whether connections may be reused across requests.
    pub enable_keep_alive: bool,
    /// Idle bound between keep-alive requests.
    pub keep_alive_timeout: Duration,
    /// Requests served on one connection before it is retired.
    pub keep_alive_max_requests: u32,
    /// Accepted connections per master poll cycle.
    pub max_accepts_per_cycle: usize,
    /// Drain deadline for graceful shutdown, at master and workers alike.
    pub shutdown_grace: Duration,
    /// Whether the embedding program terminates TLS in front of the core.
    pub ssl: bool,
    /// Certificate path handed to the TLS layer.
    pub ssl_cert: Option<PathBuf>,
    /// Key path handed to the TLS layer.
    pub ssl_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(60),
            max_connections: 1000,
            max_request_size: 10 * 1024 * 1024,
            buffer_size: 8 * 1024,
            enable_keep_alive: true,
            keep_alive_timeout: Duration::from_secs(30),
            keep_alive_max_requests: 100,
            max_accepts_per_cycle: 10,
            shutdown_grace: Duration::from_secs(30),
            ssl: false,
            ssl_cert: None,
            ssl_key: None,
        }
    }
}

impl ServerConfig {
    /// Validates every recognized option; violations are fatal before any
    /// socket is opened.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.parse::<IpAddr>().is_err() {
            return Err(Error::Config(format!("invalid host '{}'", self.host)));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be in 1..65535".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be positive".to_string()));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::Config(
                "connection_timeout must be positive".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be positive".to_string()));
        }
        if self.max_request_size < 1024 {
            return Err(Error::Config(
                "max_request_size must be at least 1024 bytes".to_string(),
            ));
        }
        if self.buffer_size < 1024 {
            return Err(Error::Config(
                "buffer_size must be at least 1024 bytes".to_string(),
            ));
        }
        if self.max_accepts_per_cycle == 0 {
            return Err(Error::Config(
                "max_accepts_per_cycle must be positive".to_string(),
            ));
        }
        if self.ssl {
            let (Some(cert), Some(key)) = (&self.ssl_cert, &self.ssl_key) else {
                return Err(Error::Config(
                    "ssl enabled without ssl_cert and ssl_key".to_string(),
                ));
            };
            for (option, path) in [("ssl_cert", cert), ("ssl_key", key)] {
                if std::fs::File::open(path).is_err() {
                    return Err(Error::Config(format!(
                        "{option} '{}' is not readable",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Worker-pool tunables: sizing, balancing, restart policy.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Worker processes to fork; 0 auto-detects the CPU count.
    pub worker_count: usize,
    /// Selection policy for new connections.
    pub balancer: BalancerKind,
    /// Listen backlog handed to the kernel.
    pub backlog: u32,
    /// Active connections at which a worker stops receiving hand-offs.
    pub max_queue_size: usize,
    /// Whether crashed workers are replaced.
    pub auto_restart: bool,
    /// Base delay before a crashed worker is replaced.
    pub restart_delay: Duration,
    /// Worker count to assume when CPU detection fails.
    pub fallback_cpu_cores: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            worker_count: 0,
            balancer: BalancerKind::LeastConnections,
            backlog: 128,
            max_queue_size: 1000,
            auto_restart: true,
            restart_delay: Duration::from_secs(1),
            fallback_cpu_cores: 4,
        }
    }
}

impl WorkerPoolConfig {
    /// Validates every recognized option.
    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_count > MAX_WORKERS {
            return Err(Error::Config(format!(
                "worker_count must be at most {MAX_WORKERS}"
            )));
        }
        if self.backlog == 0 {
            return Err(Error::Config("backlog must be positive".to_string()));
        }
        if self.max_queue_size == 0 {
            return Err(Error::Config("max_queue_size must be positive".to_string()));
        }
        if self.fallback_cpu_cores == 0 {
            return Err(Error::Config(
                "fallback_cpu_cores must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the configured count: 0 auto-detects CPU cores, falling back
    /// to `fallback_cpu_cores`, clamped to `1..=MAX_WORKERS`.
    pub fn effective_worker_count(&self) -> usize {
        let count = if self.worker_count == 0 {
            match num_cpus::get() {
                0 => self.fallback_cpu_cores,
                cores => cores,
            }
        } else {
            self.worker_count
        };

        count.clamp(1, MAX_WORKERS)
    }
}
