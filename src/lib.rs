pub mod backend_manager;
pub mod commands;
#[cfg(feature = "desktop")]
pub mod desktop;
pub mod errors;
pub mod health;
pub mod launcher;
pub mod lifecycle;
pub mod port_allocator;
pub mod settings;
pub mod state;
pub mod status_channel;
pub mod terminate;
pub mod updater;

pub use backend_manager::{BackendManager, BackendReadiness};
pub use settings::{RunMode, Settings};
pub use state::AppState;
pub use status_channel::{StatusChannel, StatusEvent, UPDATE_STATUS_EVENT};
pub use updater::UpdateManager;
