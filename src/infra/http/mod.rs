mod admin;
mod error;
mod middleware;
mod public;

pub use admin::{AdminGuard, AdminState};
pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, codes};
pub use middleware::{RequestContext, X_REQUEST_ID};
pub use public::PublicState;

use std::sync::Arc;

use axum::Router;
use axum::extract::FromRef;
use axum::middleware as axum_middleware;

use crate::application::inventory::InventoryService;

use self::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct RouterState {
    pub public: PublicState,
    pub admin: AdminState,
}

impl RouterState {
    pub fn new(inventory: Arc<InventoryService>, guard: AdminGuard) -> Self {
        Self {
            public: PublicState {
                inventory: Arc::clone(&inventory),
            },
            admin: AdminState { inventory, guard },
        }
    }
}

impl FromRef<RouterState> for PublicState {
    fn from_ref(state: &RouterState) -> Self {
        state.public.clone()
    }
}

impl FromRef<RouterState> for AdminState {
    fn from_ref(state: &RouterState) -> Self {
        state.admin.clone()
    }
}

/// Full HTTP surface: public reads, cache administration, request logging.
pub fn build_router(state: RouterState) -> Router {
    public::build_public_router()
        .merge(admin::build_admin_router(state.clone()))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
