use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{client_router, server_router, ServerApiState};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::jobs::{ClientJob, JobRepository, ServerJob};
use crate::lifecycle::{ClientLifecycle, ServerLifecycle};
use crate::supervisor::{
    ClientLauncher, LocalSourceResolver, ProcessSupervisor, ServerLauncher, SourceResolver,
};

/// Runs benchmarked applications for remote drivers.
pub struct ServerAgent {
    config: AgentConfig,
    repository: Arc<JobRepository<ServerJob>>,
    resolver: Arc<dyn SourceResolver>,
}

impl ServerAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            repository: Arc::new(JobRepository::with_limits(
                config.max_jobs,
                config.log_capacity,
            )),
            resolver: Arc::new(LocalSourceResolver::new()),
            config,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn repository(&self) -> Arc<JobRepository<ServerJob>> {
        self.repository.clone()
    }

    pub fn router(&self) -> Router {
        server_router(ServerApiState::new(self.repository.clone()))
    }

    pub fn lifecycle(&self) -> ServerLifecycle {
        let supervisor = ProcessSupervisor::new(self.config.lifecycle.stop_grace_period());
        let launcher = ServerLauncher::new(
            supervisor,
            self.resolver.clone(),
            self.config.lifecycle.ready_marker.clone(),
        )
        .with_work_root(self.config.work_root.clone());
        ServerLifecycle::new(self.repository.clone(), launcher, &self.config)
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let lifecycle = self.lifecycle();
        serve(
            "server",
            listener,
            self.router(),
            lifecycle.run(shutdown.clone()),
            shutdown,
        )
        .await
    }
}

/// Runs load-generation workers for remote drivers.
pub struct ClientAgent {
    config: AgentConfig,
    repository: Arc<JobRepository<ClientJob>>,
}

impl ClientAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            repository: Arc::new(JobRepository::with_limits(
                config.max_jobs,
                config.log_capacity,
            )),
            config,
        }
    }

    pub fn repository(&self) -> Arc<JobRepository<ClientJob>> {
        self.repository.clone()
    }

    pub fn router(&self) -> Router {
        client_router(self.repository.clone())
    }

    pub fn lifecycle(&self) -> ClientLifecycle {
        let supervisor = ProcessSupervisor::new(self.config.lifecycle.stop_grace_period());
        let launcher = ClientLauncher::new(supervisor).with_work_root(self.config.work_root.clone());
        ClientLifecycle::new(self.repository.clone(), launcher, &self.config)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let lifecycle = self.lifecycle();
        serve(
            "client",
            listener,
            self.router(),
            lifecycle.run(shutdown.clone()),
            shutdown,
        )
        .await
    }
}

/// Serve HTTP alongside the lifecycle loop. Both drain on `shutdown`; the
/// loop stops its process before this returns.
async fn serve<F>(
    role: &'static str,
    listener: TcpListener,
    router: Router,
    lifecycle: F,
    shutdown: CancellationToken,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(role, addr = ?addr, "Agent listening");

    let lifecycle = tokio::spawn(lifecycle);

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    // The HTTP server may also end on its own; the loop must not outlive it
    shutdown.cancel();
    if let Err(e) = lifecycle.await {
        tracing::error!(role, error = %e, "Lifecycle task panicked");
    }

    result?;
    tracing::info!(role, "Agent stopped");
    Ok(())
}
