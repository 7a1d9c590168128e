pub mod environment_builds;
pub mod jobs;
pub mod jupyter_builds;
pub mod runs;
pub mod sessions;

use axum::Router;

use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(environment_builds::router())
        .merge(jupyter_builds::router())
        .merge(sessions::router())
        .merge(runs::router())
        .merge(jobs::router())
}
