pub mod appresult;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod db;
pub mod hub;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod repo;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::{Router, extract::FromRef};
use tower_http::trace::TraceLayer;

pub use appresult::{AppError, AppResult, ChatError};

use crate::{
    auth::{Authenticator, WorkspaceAuthorizer},
    bridge::{Bridge, Broker, BrokerError, Publisher},
    config::Config,
    hub::Hub,
    metrics::Metrics,
    presence::{PresenceTracker, PresenceView},
    repo::ChatRepository,
    rooms::{ChatService, MessageIngest},
};

/// Everything one server instance shares between its handlers and sessions.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<dyn ChatRepository>,
    pub authenticator: Arc<dyn Authenticator>,
    pub authorizer: Arc<dyn WorkspaceAuthorizer>,

    pub hub: Arc<Hub>,
    pub presence_view: Arc<PresenceView>,
    pub publisher: Publisher,

    pub ingest: Arc<MessageIngest>,
    pub rooms: Arc<ChatService>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Config,
        repo: Arc<dyn ChatRepository>,
        authenticator: Arc<dyn Authenticator>,
        authorizer: Arc<dyn WorkspaceAuthorizer>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let metrics = Arc::new(Metrics::default());
        let publisher = Publisher::new(broker, metrics.clone());

        let presence = Arc::new(PresenceTracker::new(repo.clone(), publisher.clone()));
        let hub = Arc::new(Hub::new(presence, metrics.clone()));

        let ingest = Arc::new(MessageIngest::new(
            repo.clone(),
            publisher.clone(),
            metrics.clone(),
            config.max_message_chars,
        ));
        let rooms = Arc::new(ChatService::new(
            repo.clone(),
            authorizer.clone(),
            ingest.clone(),
            publisher.clone(),
        ));

        Self {
            config: Arc::new(config),
            repo,
            authenticator,
            authorizer,
            hub,
            presence_view: Arc::new(PresenceView::new()),
            publisher,
            ingest,
            rooms,
            metrics,
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        self.hub.presence()
    }

    /// Subscribes this instance to the broker. Must run before serving so no
    /// event published after startup is missed.
    pub async fn start_bridge(&self) -> Result<Bridge, BrokerError> {
        Bridge::start(
            self.publisher.broker().clone(),
            self.hub.clone(),
            self.presence_view.clone(),
        )
        .await
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/ws", rooms::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
