//! Netron CLI: run a node or poke at a remote one.

mod cli;

use async_trait::async_trait;
use clap::Parser;
use cli::{Cli, Commands};
use netron::{
    load_config, Arg, Context, ContextShape, Netron, NetronConfig, NetronEvent, NetronHooks,
    Payload, SharedSecretHooks,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: cannot start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(cli)) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref());
    let hooks: Arc<dyn NetronHooks> = match cli.secret {
        Some(secret) => Arc::new(SharedSecretHooks::new(secret)?),
        None => Arc::new(netron::DefaultHooks),
    };
    match cli.command {
        Commands::Serve {
            listen,
            is_super,
            demo,
        } => cmd_serve(config, hooks, &listen, is_super, demo).await,
        Commands::Ping { target, count } => cmd_ping(config, hooks, &target, count).await,
        Commands::Contexts { target, json } => cmd_contexts(config, hooks, &target, json).await,
    }
}

async fn cmd_serve(
    mut config: NetronConfig,
    hooks: Arc<dyn NetronHooks>,
    listen: &str,
    is_super: bool,
    demo: bool,
) -> anyhow::Result<()> {
    config.is_super |= is_super;
    let netron = Netron::with_hooks(config, hooks);
    if demo {
        started();
        netron.attach_context(Arc::new(Echo), None)?;
    }
    let addr = netron.bind(listen).await?;
    println!("Netron {} listening on {addr}", netron.uid());

    let mut events = netron.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event log lagged");
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    netron.unbind().await;
    netron.disconnect(None).await?;
    Ok(())
}

fn log_event(event: &NetronEvent) {
    match event {
        NetronEvent::PeerOnline { uid, .. } => info!(%uid, "Peer online"),
        NetronEvent::PeerOffline { uid, .. } => info!(%uid, "Peer offline"),
        NetronEvent::ContextAttach { peer, name, .. } => {
            info!(?peer, %name, "Context attached")
        }
        NetronEvent::ContextDetach { peer, name, .. } => {
            info!(?peer, %name, "Context detached")
        }
        _ => {}
    }
}

async fn cmd_ping(
    config: NetronConfig,
    hooks: Arc<dyn NetronHooks>,
    target: &str,
    count: u32,
) -> anyhow::Result<()> {
    let netron = Netron::with_hooks(config, hooks);
    let (host, port) = parse_target(target)?;
    let peer = netron.connect_to(host, port).await?;
    let uid = peer
        .uid()
        .ok_or_else(|| anyhow::anyhow!("peer has no uid"))?;
    for seq in 0..count {
        if let Some(rtt) = netron.ping(Some(uid)).await? {
            println!("pong from {uid}: seq={seq} time={:.2}ms", rtt.as_secs_f64() * 1000.0);
        }
        if seq + 1 < count {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    netron.disconnect(None).await?;
    Ok(())
}

async fn cmd_contexts(
    config: NetronConfig,
    hooks: Arc<dyn NetronHooks>,
    target: &str,
    as_json: bool,
) -> anyhow::Result<()> {
    let netron = Netron::with_hooks(config, hooks);
    let (host, port) = parse_target(target)?;
    let peer = netron.connect_to(host, port).await?;
    let definitions: Vec<_> = peer
        .context_names()
        .into_iter()
        .filter_map(|name| peer.definition_by_name(&name).map(|d| (name, d)))
        .collect();

    if as_json {
        let list: Vec<Value> = definitions
            .iter()
            .map(|(name, d)| json!({ "name": name, "definition": d }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else if definitions.is_empty() {
        println!("No contexts.");
    } else {
        for (name, d) in &definitions {
            println!("{name} ({}, id {})", d.name, d.id);
            if let Some(description) = &d.description {
                println!("  {description}");
            }
            for method in &d.methods {
                println!("  fn {method}()");
            }
            for property in &d.properties {
                let ro = if property.readonly { " (readonly)" } else { "" };
                println!("  prop {}{ro}", property.name);
            }
        }
    }
    netron.disconnect(None).await?;
    Ok(())
}

/// Split `host[:port]`. IPv6 literals go in brackets: `[::1]:8888`.
fn parse_target(target: &str) -> anyhow::Result<(&str, Option<u16>)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("unterminated '[' in {target}"))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(port.parse()?))),
            None if tail.is_empty() => Ok((host, None)),
            None => anyhow::bail!("invalid target {target}"),
        };
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host, Some(port.parse()?))),
        _ => Ok((target, None)),
    }
}

/// Demo context for `serve --demo`.
struct Echo;

#[async_trait]
impl Context for Echo {
    fn shape(&self) -> ContextShape {
        ContextShape::new("Echo")
            .description("Returns its arguments")
            .method("echo")
            .readonly_property("uptime")
    }

    async fn get(&self, property: &str) -> anyhow::Result<Payload> {
        match property {
            "uptime" => Ok(Payload::value(started().elapsed().as_secs())),
            _ => Ok(Payload::Undefined),
        }
    }

    async fn call(&self, _method: &str, args: Vec<Arg>) -> anyhow::Result<Payload> {
        let values = args
            .into_iter()
            .map(Arg::into_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Payload::Value(Value::Array(values)))
    }
}

fn started() -> std::time::Instant {
    static STARTED: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    *STARTED.get_or_init(std::time::Instant::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("example.com").unwrap(), ("example.com", None));
        assert_eq!(
            parse_target("10.0.0.5:9000").unwrap(),
            ("10.0.0.5", Some(9000))
        );
        assert_eq!(parse_target("[::1]:8888").unwrap(), ("::1", Some(8888)));
        assert_eq!(parse_target("[::1]").unwrap(), ("::1", None));
        assert_eq!(parse_target("::1").unwrap(), ("::1", None));
        assert!(parse_target("host:port").is_err());
        assert!(parse_target("[::1").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["netron", "serve", "--super", "--listen", "127.0.0.1:0"])
            .unwrap();
        match cli.command {
            Commands::Serve {
                listen, is_super, ..
            } => {
                assert_eq!(listen, "127.0.0.1:0");
                assert!(is_super);
            }
            _ => panic!("expected serve"),
        }
    }
}
