use std::sync::Arc;

use gaffel::{Master, ServerConfig, WorkerPoolConfig};
use parser::h1::response::Response;

fn main() -> Result<(), gaffel::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let handler: gaffel::Handler = Arc::new(|req: &parser::h1::request::Request| {
        Response::new(200)
            .header("Content-Type", "text/plain")
            .body(format!("{} {}\n", req.method, req.target))
    });

    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 8080,
        ..ServerConfig::default()
    };
    let pool = WorkerPoolConfig {
        worker_count: 2,
        ..WorkerPoolConfig::default()
    };

    let mut master = Master::bind(config, pool, handler)?;
    println!("listening on http://{}", master.local_addr());
    master.run()
}
