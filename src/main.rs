//! Foghorn server entrypoint: wires every component together and runs two
//! axum listeners — the viewer/media-server-facing HTTP surface (`api`)
//! and the inter-cluster federation surface (`federation`) — alongside
//! `PeerManager`'s background leader-election and cadence loop.

use foghorn::api::{self, ApiState};
use foghorn::artifact_access::{ArtifactAccess, ArtifactAdIndex, PeerArtifactClient};
use foghorn::config::Config;
use foghorn::error::Result;
use foghorn::events::EventEmitter;
use foghorn::federation::{FederationClient, FederationState};
use foghorn::federation_cache::FederationCache;
use foghorn::kv;
use foghorn::origin_pull::OriginPullArranger;
use foghorn::peer_manager::PeerManager;
use foghorn::registry_client::{FakeRegistry, HttpRegistryClient, Registry};
use foghorn::source_resolver::SourceResolver;
use foghorn::state::StateStore;
use foghorn::triggers::TriggerHandler;
use foghorn::types::InstanceId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).init();

    let config = Config::from_env();
    info!(
        cluster_id = %config.cluster_id,
        instance_id = %config.instance_id,
        version = foghorn::VERSION,
        "starting foghorn"
    );

    let kv = kv::build(&config);

    let state = Arc::new(StateStore::new(
        config.cluster_id.clone(),
        InstanceId::new(config.instance_id.clone()),
        kv.clone(),
        config.weights,
    ));
    if let Err(e) = state.rehydrate().await {
        warn!(error = %e, "state rehydrate failed, continuing with empty view");
    }
    tokio::spawn(state.clone().run_subscriber());

    let fed_cache = Arc::new(FederationCache::new(config.cluster_id.clone(), kv.clone()));
    let fed_client = Arc::new(FederationClient::new(config.cluster_id.clone(), config.service_token.clone()));

    let registry: Arc<dyn Registry> = match &config.registry_url {
        Some(url) => Arc::new(HttpRegistryClient::new(url.clone(), config.service_token.clone())),
        None => {
            warn!("REGISTRY_URL not set, running against an in-memory FakeRegistry");
            Arc::new(FakeRegistry::default())
        }
    };

    let peer_manager = PeerManager::new(
        &config,
        kv.clone(),
        fed_cache.clone(),
        fed_client.clone(),
        state.clone(),
        registry.clone(),
    );

    let hmac_secret = config.service_token.clone().into_bytes();
    let artifacts = Arc::new(ArtifactAccess::new(
        config.cluster_id.clone(),
        state.clone(),
        fed_client.clone() as Arc<dyn PeerArtifactClient>,
        Arc::new(peer_manager.clone()) as Arc<dyn ArtifactAdIndex>,
        hmac_secret,
        format!("http://{}", config.http_bind),
    ));

    let events = EventEmitter::default();

    let resolver = Arc::new(SourceResolver::new(
        &config,
        state.clone(),
        registry.clone(),
        fed_client.clone(),
    ));

    let origin_pull = Arc::new(OriginPullArranger::new(
        config.cluster_id.clone(),
        state.clone(),
        fed_cache.clone(),
        fed_client.clone(),
        config.weights,
    ));

    let triggers = Arc::new(TriggerHandler::new(
        config.cluster_id.clone(),
        state.clone(),
        resolver.clone(),
        origin_pull.clone(),
        events.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let peer_manager_task = {
        let peer_manager = peer_manager.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            peer_manager.run(shutdown_rx).await;
        })
    };

    let federation_state = FederationState::new(
        &config,
        state.clone(),
        fed_cache.clone(),
        artifacts.clone(),
        Arc::new(peer_manager.clone()),
    );
    let federation_router = foghorn::federation::build_router(federation_state);
    let federation_listener = tokio::net::TcpListener::bind(&config.federation_bind)
        .await
        .map_err(foghorn::FoghornError::Io)?;
    info!(addr = %config.federation_bind, "federation listener bound");
    let federation_shutdown = shutdown_tx.subscribe();
    let federation_task = tokio::spawn(async move {
        let _ = axum::serve(federation_listener, federation_router)
            .with_graceful_shutdown(wait_for_shutdown(federation_shutdown))
            .await;
    });

    let api_state = ApiState {
        federation_base_url: config.federation_base_url.clone(),
        resolver: resolver.clone(),
        events: events.clone(),
        triggers: triggers.clone(),
        origin_pull: origin_pull.clone(),
    };
    let api_router = api::build_router(api_state);
    let api_listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .map_err(foghorn::FoghornError::Io)?;
    info!(addr = %config.http_bind, "http listener bound");
    let api_shutdown = shutdown_tx.subscribe();
    let api_task = tokio::spawn(async move {
        let _ = axum::serve(api_listener, api_router)
            .with_graceful_shutdown(wait_for_shutdown(api_shutdown))
            .await;
    });

    tokio::signal::ctrl_c().await.map_err(foghorn::FoghornError::Io)?;
    info!("shutdown signal received, draining peer channels");
    peer_manager.broadcast_goodbye("process shutting down").await;
    let _ = shutdown_tx.send(());

    if let Err(e) = tokio::try_join!(federation_task, api_task, peer_manager_task) {
        error!(error = %e, "a server task panicked during shutdown");
    }

    Ok(())
}

async fn wait_for_shutdown(mut rx: broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}
