use std::sync::Arc;

use warden_config::WardenConfig;
use warden_store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<WardenConfig>,
}
