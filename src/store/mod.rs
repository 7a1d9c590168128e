pub mod pool;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::cra::ContainerRuntime;
use crate::taskbus::TaskRegistry;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cra: Arc<dyn ContainerRuntime>,
    pub tasks: Arc<TaskRegistry>,
    pub config: Arc<Config>,
}
