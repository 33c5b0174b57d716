use futures::future::join_all;
use jsonrpc_link::{
    ClientConfig, ClientPool, ErrorBody, HandlerRegistry, Server, ServerConfig, SessionConfig,
};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;

async fn start_server(config: ServerConfig) -> anyhow::Result<Server> {
    let handlers = HandlerRegistry::new();
    handlers.register_fn("ping", |_, _: ()| async move { Ok::<_, ErrorBody>("pong") });
    handlers.register_fn("math.add", |_, (a, b): (i64, i64)| async move {
        Ok::<_, ErrorBody>(a + b)
    });
    Server::bind("demo", Arc::new(handlers), config).await
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let runtime_dir = tempfile::tempdir()?;

    // 1. start server on <runtime_dir>/demo-jsonrpc.socket
    let server = start_server(ServerConfig::default().with_runtime_dir(runtime_dir.path())).await?;
    println!("listening on {}", server.target());

    // 2. pooled client; the in-flight cap keeps the burst queued, not dropped
    let pool = ClientPool::new(
        ClientConfig::default()
            .with_runtime_dir(runtime_dir.path())
            .with_session(SessionConfig::default().with_max_queue_depth(10_000)),
    );
    let demo = pool.proxy("demo");
    println!("add -> {:?}", demo.call("math.add", Some(json!([2, 40]))).await);
    println!("missing -> {:?}", demo.call("math.div", None).await);

    let n = 5_000;
    let start_at = Instant::now();

    let client = pool.open("demo")?;
    let futures = (0..n)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.call("ping", None, None).await })
        })
        .collect::<Vec<_>>();

    let ok = join_all(futures)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();

    println!(
        "{ok}/{n} ok, {} requests per second",
        n as f64 / start_at.elapsed().as_secs_f64()
    );

    pool.close();
    server.close();
    Ok(())
}
