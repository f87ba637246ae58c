mod api;

use std::path::PathBuf;
use std::sync::Arc;

use api::AppState;
use directories::ProjectDirs;
use karna_core::backends::config as gateway_config;
use karna_core::db::init_db;
use karna_core::{ModelManager, ProviderGateway};
use tauri::Manager;

fn workspace_dir() -> PathBuf {
    if let Some(proj) = ProjectDirs::from("com", "Karna", "Karna") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("Karna")
    }
}

fn main() {
    tauri::Builder::default()
        .setup(|app| {
            let db = init_db(workspace_dir())?;
            let config = {
                let conn = db.get()?;
                gateway_config::load(&conn)?
            };
            let gateway = Arc::new(ProviderGateway::from_config(&config)?);
            let sweep_every = config.sweep_interval();
            let sweeper_owner = gateway.clone();
            // The sweeper must start inside the runtime; it detaches and keeps
            // running for as long as the gateway is alive.
            tauri::async_runtime::spawn(async move {
                sweeper_owner.spawn_sweeper(sweep_every);
            });
            let models = ModelManager::new(db.clone(), gateway);
            app.manage(AppState { db, models });
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            api::ping,
            api::gateway_backends,
            api::gateway_models,
            api::gateway_generate,
            api::gateway_generate_stream,
            api::gateway_set_api_key,
            api::settings_get,
            api::settings_put,
            api::history_list,
            api::history_conversations,
            api::modification_log_append,
            api::modification_log_list,
            api::events_recent
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
