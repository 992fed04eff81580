//! HTTP and WebSocket boundary.

mod error;
mod realtime;
mod routes;
mod session;

pub use error::ApiError;
pub use session::{bearer_token, CronCaller, Session};

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::db::Pool;
use crate::dispatch::Dispatcher;
use crate::realtime::TopicHub;
use crate::sweeper::Sweeper;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub dispatcher: Dispatcher,
    pub sweeper: Sweeper,
    pub hub: Arc<TopicHub>,
    pub cron_secret: Arc<str>,
    pub vapid_public_key: Arc<str>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/notifications",
            get(routes::list_notifications).post(routes::create_notification),
        )
        .route("/notifications/read-all", post(routes::read_all))
        .route("/notifications/{id}/read", post(routes::read_one))
        .route(
            "/push-subscriptions",
            get(routes::get_subscription)
                .post(routes::put_subscription)
                .delete(routes::delete_subscription),
        )
        .route("/push-subscriptions/public-key", get(routes::public_key))
        .route("/sweeps/notifications", post(routes::sweep_notifications))
        .route("/sweeps/tasks", post(routes::sweep_tasks))
        .route("/realtime", get(realtime::realtime_socket))
        .with_state(state)
}
