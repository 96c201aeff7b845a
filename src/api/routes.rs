use axum::{
    routing::{get, put},
    Router,
};

use crate::api::handlers::{self, AppState};
use crate::store::Store;

pub fn create_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Read side: assembled graphs
        .route(
            "/dataset-lists/:list_id/tree",
            get(handlers::get_data_set_list_tree::<S>),
        )
        .route(
            "/datasets/:data_set_id/resolve",
            get(handlers::resolve_value::<S>),
        )
        // Overrides
        .route(
            "/datasets/:data_set_id/overrides",
            put(handlers::put_override::<S>).delete(handlers::delete_override::<S>),
        )
}
