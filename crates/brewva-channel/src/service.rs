//! Service wiring and the shutdown supervisor.
//!
//! One [`ChannelService`] owns the whole channel: durable stores, the WAL,
//! the runtime pool, the orchestrator, and whichever ingestion transport the
//! config selects (webhook or long poll). The embedding host supplies the
//! [`RuntimeFactory`] for the black-box agent runtime and calls
//! [`run_until_shutdown`](ChannelService::run_until_shutdown).

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use brewva_agents::AgentRegistry;
use brewva_approval::{ApprovalRoutingStore, ApprovalStateStore};
use brewva_config::ChannelConfig;
use brewva_core::wal_scope;
use brewva_events::EventBus;
use brewva_ingress::{IngressServer, UpdateSink};
use brewva_runtime::{RuntimeFactory, RuntimePool, SessionMap};
use brewva_telegram::{TelegramTransport, run_polling_loop};
use brewva_wal::TurnWal;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::ChannelOrchestrator;

/// The running channel service.
pub struct ChannelService {
    orchestrator: ChannelOrchestrator,
    events: EventBus,
    ingress: Option<IngressServer>,
    polling: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ChannelService {
    /// Load config from `workspace_root` and start.
    ///
    /// # Errors
    ///
    /// Config validation failures, store/WAL open failures, a missing bot
    /// token, or an ingress bind failure. All are fatal at boot.
    pub async fn start(
        workspace_root: Option<&Path>,
        factory: Arc<dyn RuntimeFactory>,
        base_runtime_config: Value,
    ) -> anyhow::Result<Self> {
        let config = brewva_config::load(workspace_root)?;
        Self::start_with_config(config, factory, base_runtime_config).await
    }

    /// Start from an already-validated config.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub async fn start_with_config(
        config: ChannelConfig,
        factory: Arc<dyn RuntimeFactory>,
        base_runtime_config: Value,
    ) -> anyhow::Result<Self> {
        let events = EventBus::new();
        let channel_dir = config.runtime.channel_dir();
        let agents_root = config.runtime.state_dir.join("agents");

        let registry = Arc::new(AgentRegistry::open(
            &channel_dir,
            &agents_root,
            events.clone(),
        ));
        let approval_state = Arc::new(ApprovalStateStore::open(
            &channel_dir,
            config.runtime.approval_max_entries,
            events.clone(),
        ));
        let routing = Arc::new(ApprovalRoutingStore::open(
            &channel_dir,
            config.runtime.approval_max_entries,
            events.clone(),
        ));

        let scope = wal_scope(&config.channel.name);
        let wal = Arc::new(if config.runtime.wal_enabled {
            TurnWal::open(&config.runtime.effective_wal_dir(), &scope)
                .context("failed to open turn wal")?
        } else {
            TurnWal::disabled(&scope)
        });

        let pool = Arc::new(RuntimePool::new(
            factory,
            base_runtime_config,
            agents_root.display().to_string(),
            config.runtime.max_live_runtimes,
            events.clone(),
        ));
        let sessions = Arc::new(SessionMap::new());
        let transport =
            Arc::new(TelegramTransport::new(&config.telegram).context("telegram transport")?);

        let orchestrator = ChannelOrchestrator::new(
            config.clone(),
            events.clone(),
            registry,
            pool,
            sessions,
            wal,
            routing,
            approval_state,
            transport.clone(),
        );
        orchestrator.recover().await;
        orchestrator.start_maintenance().await;

        let sink: Arc<dyn UpdateSink> = Arc::new(orchestrator.clone());
        let (ingress, polling) = if config.ingress.enabled {
            let server = IngressServer::start(config.ingress.clone(), sink, events.clone())
                .await
                .context("failed to start webhook ingress")?;
            (Some(server), None)
        } else {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_polling_loop(transport, sink, cancel.clone()));
            (None, Some((cancel, handle)))
        };

        info!(channel = %config.channel.name, "channel service started");
        Ok(Self {
            orchestrator,
            events,
            ingress,
            polling,
        })
    }

    /// The orchestrator, e.g. for injecting turns in embedded setups.
    #[must_use]
    pub fn orchestrator(&self) -> &ChannelOrchestrator {
        &self.orchestrator
    }

    /// The event bus, for host-side observers.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Block until SIGINT/SIGTERM, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// Only signal-handler installation can fail.
    pub async fn run_until_shutdown(self) -> anyhow::Result<()> {
        wait_for_shutdown_signal().await?;
        info!("shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    /// Stop ingestion first, then drain and dispose everything. Idempotent
    /// through the orchestrator; in-flight WAL records survive for the next
    /// start.
    pub async fn shutdown(self) {
        if let Some(ingress) = self.ingress {
            ingress.stop().await;
        }
        if let Some((cancel, handle)) = self.polling {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "polling loop join failed");
            }
        }
        self.orchestrator.shutdown().await;
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("installing SIGINT handler")?,
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("installing SIGINT handler")
}
