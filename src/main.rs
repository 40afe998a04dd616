use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use elasticsearch_operator::controller::KubeLookup;
use elasticsearch_operator::health::{HealthState, run_health_server};
use elasticsearch_operator::{
    Context, OperatorConfig, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, run_controller,
    run_dormant_controller, run_snapshot_controller, run_webhook_server,
};

const LEASE_NAME: &str = "elasticsearch-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Bound on waiting for in-flight reconciles after shutdown starts
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("elasticsearch_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    let config = OperatorConfig::init_from_env()?;
    info!(?config, "starting elasticsearch-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    let shutdown = CancellationToken::new();
    let health_state = Arc::new(HealthState::new());

    // probes and admission are served whether or not this replica leads
    let health_handle = {
        let health_state = health_state.clone();
        let addr = config.health_addr.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, &addr, shutdown).await {
                error!(error = %e, "health server failed");
            }
        })
    };

    let webhook_handle =
        if Path::new(WEBHOOK_CERT_PATH).exists() && Path::new(WEBHOOK_KEY_PATH).exists() {
            info!("TLS certificates found, starting webhook server");
            let lookup = Arc::new(KubeLookup::new(client.clone()));
            let min_memory = config.min_memory_request.clone();
            let port = config.webhook_port;
            Some(tokio::spawn(async move {
                if let Err(e) =
                    run_webhook_server(lookup, min_memory, port, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH)
                        .await
                {
                    error!(error = %e, "webhook server failed");
                }
            }))
        } else {
            info!(
                cert = WEBHOOK_CERT_PATH,
                key = WEBHOOK_KEY_PATH,
                "TLS certificates not found, webhook server disabled"
            );
            None
        };

    let lease_lock = LeaseLock::new(client.clone(), &namespace, lease_params(&pod_name));

    info!(lease = LEASE_NAME, %namespace, "waiting to acquire leadership");
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown before acquiring leadership");
                shutdown.cancel();
                return Ok(());
            }
            result = lease_lock.try_acquire_or_renew() => match result {
                Ok(lease) if lease.acquired_lease => {
                    info!("acquired leadership");
                    break;
                }
                Ok(_) => info!("another instance is leader, waiting"),
                Err(e) => warn!(error = %e, "failed to acquire lease, retrying"),
            }
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let lease_renewal_handle = {
        let lease_lock = LeaseLock::new(client.clone(), &namespace, lease_params(&pod_name));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
                match lease_lock.try_acquire_or_renew().await {
                    Ok(lease) if lease.acquired_lease => {}
                    Ok(_) => {
                        error!("lost leadership, exiting");
                        std::process::exit(1);
                    }
                    Err(e) => {
                        error!(error = %e, "failed to renew lease, exiting");
                        std::process::exit(1);
                    }
                }
            }
        })
    };

    let ctx = Arc::new(Context::new(
        client,
        config,
        Some(health_state.clone()),
        shutdown.clone(),
    ));
    let mut controllers = tokio::spawn({
        let ctx = ctx.clone();
        async move {
            tokio::join!(
                run_controller(ctx.clone()),
                run_dormant_controller(ctx.clone()),
                run_snapshot_controller(ctx),
            );
        }
    });
    health_state.set_ready(true).await;
    info!("controllers started");

    let webhook_future = async {
        match webhook_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "webhook server task panicked");
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    let mut controllers_done = false;
    tokio::select! {
        result = &mut controllers => {
            controllers_done = true;
            if let Err(e) = result {
                error!(error = %e, "controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "health server task panicked");
            }
        }
        _ = webhook_future => {}
        Err(e) = lease_renewal_handle => {
            error!(error = %e, "lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    health_state.set_ready(false).await;
    ctx.cron.shutdown();
    shutdown.cancel();
    if !controllers_done
        && tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS), controllers)
            .await
            .is_err()
    {
        warn!("in-flight reconciles did not finish within the grace period");
    }

    info!("operator stopped");
    Ok(())
}

fn lease_params(holder_id: &str) -> LeaseLockParams {
    LeaseLockParams {
        holder_id: holder_id.to_string(),
        lease_name: LEASE_NAME.to_string(),
        lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
    }
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
