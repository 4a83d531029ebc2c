#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Result, anyhow};
use futures::StreamExt;
use registry::{EventKind, Registry, WatchEvent, spawn_heartbeat};
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

mod cli;
mod trace;

use cli::{Command, Parser};

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.log)?;
    debug!(?config, ?trace_config);

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(cli::DEFAULT_THREAD_NAME).enable_all();
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(start(config)).await {
            Err(err) => {
                error!(?err, "task failed");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    let registry_config = config.registry_config()?;
    info!(endpoints = ?registry_config.endpoints(), "connecting");
    let lease_ttl = registry_config.lease_ttl();
    let registry = Arc::new(Registry::connect(registry_config).await?);

    let span = info_span!("command", command = ?config.command);
    let res = run(Arc::clone(&registry), config.command, lease_ttl)
        .instrument(span)
        .await;

    match registry.close().await {
        Ok(summary) if !summary.is_clean() => {
            warn!(failed = summary.failed.len(), "some keys were left to expire")
        }
        Ok(_) => {}
        Err(err) => error!(?err, "failed to close registry"),
    }
    res
}

async fn run(
    registry: Arc<Registry<registry::EtcdStore>>,
    command: Command,
    lease_ttl: std::time::Duration,
) -> Result<()> {
    match command {
        Command::Register {
            key,
            value,
            refresh,
        } => {
            let lease = registry.register(&key, &value).await?;
            info!(key, %lease, "registered, press ctrl-c to deregister");

            let token = CancellationToken::new();
            let heartbeat = spawn_heartbeat(
                Arc::clone(&registry),
                key,
                move || value.clone(),
                refresh.unwrap_or(lease_ttl),
                token.clone(),
            );
            let ret = shutdown_signal(token).await;
            if let Err(err) = heartbeat.await {
                error!(?err, "error waiting for heartbeat task");
            }
            ret
        }
        Command::Get { key } => {
            println!("{}", registry.get(&key).await?);
            Ok(())
        }
        Command::List { prefix } => {
            for line in list_lines(registry.get_by_prefix(&prefix).await?) {
                println!("{line}");
            }
            Ok(())
        }
        Command::Watch { key, prefix } => {
            let mut events = registry.subscribe(&key, prefix).await?;
            loop {
                tokio::select! {
                    res = signal::ctrl_c() => {
                        return res.map_err(|err| anyhow!(err));
                    }
                    event = events.next() => match event {
                        Some(Ok(event)) => println!("{}", format_event(&event)),
                        Some(Err(err)) => return Err(err.into()),
                        None => {
                            debug!("watch stream ended");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

fn list_lines(found: std::collections::HashMap<String, String>) -> Vec<String> {
    let mut found = found.into_iter().collect::<Vec<_>>();
    found.sort_unstable();
    found.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn format_event(event: &WatchEvent) -> String {
    match event.kind {
        EventKind::Put => format!("PUT {}={}", event.key, event.value),
        EventKind::Delete => format!("DELETE {}", event.key),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
