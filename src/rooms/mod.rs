pub mod msg;
pub mod service;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

pub use msg::MessageIngest;
pub use service::ChatService;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms/{room_id}", get(ws::room_ws))
        .route("/presence/{workspace_id}", get(ws::presence_ws))
}
