use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::p2pproxy::{
    admin,
    config::{self, Mode},
    logging, net, telemetry,
    tunnel::{client::P2pClient, netserver::NetServer, server::P2pServer},
};

pub async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let admin_enabled = !cfg.admin_addr.is_empty();

    tracing::info!(
        mode = %cfg.mode,
        p2p_addr = %cfg.p2p_addr,
        server_addr = %cfg.server_addr,
        admin_addr = %cfg.admin_addr,
        heartbeat = %humantime::format_duration(cfg.timeouts.heartbeat_interval),
        dead_timeout = %humantime::format_duration(cfg.timeouts.dead_timeout),
        "p2pproxy: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    let mut admin_state = if admin_enabled {
        Some(admin::AdminState {
            prom: Arc::new(telemetry::init_prometheus()?),
            p2p: None,
            net: None,
            backends: None,
        })
    } else {
        None
    };

    match cfg.mode {
        Mode::Server => {
            let p2p = P2pServer::new(cfg.server_options());
            let netsrv = NetServer::new(cfg.netserver_options(), p2p.clone());

            if let Some(st) = admin_state.as_mut() {
                st.p2p = Some(p2p.clone());
                st.net = Some(netsrv.clone());
            }

            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { p2p.listen_and_serve(shutdown).await });

            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { netsrv.listen_and_serve(shutdown).await });
        }
        Mode::Client => {
            let client = Arc::new(P2pClient::new(cfg.client_options())?);

            if let Some(st) = admin_state.as_mut() {
                st.backends = Some(client.backends());
            }

            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { client.run(shutdown).await });
        }
    }

    if let Some(state) = admin_state {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Wait for Ctrl-C / SIGTERM, or a task ending on its own (bind failure).
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        drain(&mut tasks).await;
                        return Err(err);
                    }
                    Err(join_err) => {
                        drain(&mut tasks).await;
                        return Err(join_err.into());
                    }
                }
            }
        }
    }

    drain(&mut tasks).await;
    tracing::info!("p2pproxy: stopped");
    Ok(())
}

/// Waits for tasks to observe shutdown; aborts whatever is still running after 5s.
async fn drain(tasks: &mut JoinSet<anyhow::Result<()>>) {
    let wait = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::debug!(err = %err, "shutdown: task error during teardown");
            }
        }
    };

    if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
