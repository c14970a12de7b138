use crate::config::AppConfig;
use crate::dispatch::TaskDispatcher;
use crate::fetch::{FetchError, Fetcher};
use crate::hub::Hub;
use crate::ssrf::SafetyChecker;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub hub: Arc<Hub>,
    pub fetcher: Fetcher,
    pub dispatcher: TaskDispatcher,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, fetcher: Fetcher, dispatcher: TaskDispatcher) -> Self {
        Self {
            hub,
            fetcher,
            dispatcher,
        }
    }

    /// Build an empty hub plus a fetcher using the system resolver
    pub fn from_config(config: &AppConfig) -> Result<Self, FetchError> {
        let hub = Arc::new(Hub::new());
        let checker = SafetyChecker::system().allow(config.proxy_allow.iter().copied());
        let fetcher = Fetcher::new(Arc::new(checker), config.fetch.clone())?;
        let dispatcher = TaskDispatcher::new(hub.clone(), config.task_send_timeout);
        Ok(Self::new(hub, fetcher, dispatcher))
    }
}
