// Application state for HTTP handlers
use crate::application::signal_service::SignalService;

pub struct AppState {
    pub signal_service: SignalService,
}
