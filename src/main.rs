use std::io::BufRead;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::unbounded;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentinel_node::{
    config, default_factory, Args, NodeGraph, NodeServer, Request, StdoutSink,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// 标准输入作为控制通道: 一行一条 JSON 请求, EOF 即停机
fn spawn_stdin_reader(tx: crossbeam_channel::Sender<Request>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Request>(&line) {
                Ok(req) => {
                    if tx.send(req).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "malformed control request"),
            }
        }
    })
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let sink = Arc::new(StdoutSink);
    let graph = Arc::new(NodeGraph::new(default_factory(), sink.clone()));
    let server = NodeServer::new(graph.clone(), sink);

    if let Some(path) = &args.config {
        let cfg = config::load_pipeline(path)?;
        info!(nodes = cfg.nodes.len(), "bootstrapping from config");
        server.bootstrap(&cfg);
    }

    let (tx, rx) = unbounded();
    let reader = spawn_stdin_reader(tx);

    info!("control channel ready on stdin");
    server.run(rx);

    // 控制通道关闭: 有序拆除全部节点后退出
    info!("control channel closed, tearing down");
    graph.teardown();
    let _ = reader.join();
    Ok(())
}
