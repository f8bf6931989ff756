// WebSocket entry point: upgrade, then hand the socket to a connection.

mod connection;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};

use crate::routes::{AppState, Identity};

pub use connection::Disconnect;

#[derive(Clone)]
struct WsState {
    app: AppState,
    dispatch: Router,
}

/// `GET /ws`. Requests arriving on a connection are served by `dispatch`.
pub fn router(app: AppState, dispatch: Router) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(WsState { app, dispatch })
}

async fn ws_upgrade(
    State(state): State<WsState>,
    identity: Identity,
    ws: WebSocketUpgrade,
) -> Response {
    let max_message_bytes = state.app.connection.max_message_bytes;
    ws.max_message_size(max_message_bytes)
        .max_frame_size(max_message_bytes)
        .on_upgrade(move |socket| connection::serve(socket, identity, state.app, state.dispatch))
}
