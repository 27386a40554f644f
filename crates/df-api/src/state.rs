use df_core::Coordinator;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub config: AppConfig,
}
