//! Tauri shell: window, webview commands and exit handling.

use std::sync::Arc;
use tauri::{AppHandle, Emitter, Manager, RunEvent};

use crate::commands::tauri_commands::*;
use crate::settings::{RunMode, Settings};
use crate::state::AppState;
use crate::status_channel::UPDATE_STATUS_EVENT;
use crate::updater::AppControl;

/// Leaves the app after an explicit install so the installer can replace it
struct TauriAppControl(AppHandle);

impl AppControl for TauriAppControl {
    fn exit(&self) {
        self.0.exit(0);
    }
}

pub fn run() {
    let settings = Settings::load().unwrap_or_else(|e| {
        tracing::warn!("{}, using default settings", e);
        Settings::default()
    });
    let state = AppState::new(settings);
    tracing::info!(
        mode = ?state.run_mode,
        "starting desktop shell {}",
        env!("CARGO_PKG_VERSION")
    );

    let app = tauri::Builder::default()
        .plugin(tauri_plugin_process::init())
        .plugin(tauri_plugin_single_instance::init(|app, _args, _cwd| {
            if let Some(window) = app.get_webview_window("main") {
                let _ = window.show();
                let _ = window.set_focus();
            }
        }))
        .manage(state)
        .invoke_handler(tauri::generate_handler![
            check_for_updates,
            download_update,
            install_update,
            dismiss_update,
            get_update_state,
            get_app_version,
            get_backend_port,
            get_backend_status,
        ])
        .setup(|app| {
            let state = app.state::<AppState>().inner().clone();
            let app_handle = app.handle().clone();

            tauri::async_runtime::spawn(async move {
                state
                    .updates
                    .set_app_control(Arc::new(TauriAppControl(app_handle.clone())))
                    .await;
                forward_status_events(&app_handle, &state);

                // The window only appears once the backend outcome is known
                state.lifecycle.startup(&state).await;
                if let Err(e) = show_main_window(&app_handle, state.run_mode) {
                    tracing::error!("Failed to create main window: {}", e);
                }

                state.lifecycle.start_update_checks(&state);
            });

            Ok(())
        })
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    app.run(|app_handle, event| {
        if let RunEvent::Exit = event {
            let state = app_handle.state::<AppState>().inner().clone();
            tauri::async_runtime::block_on(async move {
                state.lifecycle.shutdown(&state).await;
            });
        }
    });
}

/// Relay the status channel to the webview as `update-status` events
fn forward_status_events(app: &AppHandle, state: &AppState) {
    let mut subscription = state.status.subscribe();
    let app = app.clone();

    tauri::async_runtime::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if let Err(e) = app.emit(UPDATE_STATUS_EVENT, &event) {
                tracing::debug!("Failed to emit update status: {}", e);
            }
        }
    });
}

fn show_main_window(app: &AppHandle, run_mode: RunMode) -> tauri::Result<()> {
    let window = match app.get_webview_window("main") {
        Some(window) => window,
        None => tauri::WebviewWindowBuilder::new(app, "main", tauri::WebviewUrl::App("index.html".into()))
            .title("Desktop Shell")
            .inner_size(900.0, 700.0)
            .center()
            .resizable(true)
            .build()?,
    };

    #[cfg(debug_assertions)]
    if run_mode.is_dev() {
        window.open_devtools();
    }
    #[cfg(not(debug_assertions))]
    let _ = run_mode;

    window.show()?;
    window.set_focus()
}
