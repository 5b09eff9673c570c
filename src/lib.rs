pub mod config;
pub mod device;
pub mod serial;
pub mod testing;

#[cfg(feature = "tauri-app")]
pub mod commands;

pub use config::BridgeConfig;
pub use device::{DeviceDescriptor, SessionManager, SessionState};
pub use serial::stream::{StreamEvent, StreamState};

#[cfg(feature = "tauri-app")]
const CONFIG_FILE: &str = "connectusb.toml";

#[cfg(feature = "tauri-app")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
  use std::sync::Arc;
  use tauri::Manager;

  tauri::Builder::default()
    .invoke_handler(tauri::generate_handler![
      commands::list_available_drivers,
      commands::connect_to_device,
      commands::disconnect,
      commands::send_data,
      commands::start_data_streaming,
      commands::stop_data_streaming,
      commands::listen_stream,
      commands::cancel_stream,
      commands::session_status,
    ])
    .setup(|app| {
      if cfg!(debug_assertions) {
        app.handle().plugin(
          tauri_plugin_log::Builder::default()
            .level(log::LevelFilter::Info)
            .build(),
        )?;
      }

      let config_path = app.path().app_config_dir()?.join(CONFIG_FILE);
      let config = BridgeConfig::load_or_default(&config_path)?;

      let host = Arc::new(serial::SerialportHost::new());
      let delivery = Arc::new(commands::MainThreadDelivery::new(app.handle().clone()));
      let manager = Arc::new(SessionManager::new(host, config).with_delivery(delivery));
      app.manage(manager);

      log::info!("ConnectUSB bridge started");
      Ok(())
    })
    .build(tauri::generate_context!())
    .expect("error while building tauri application")
    .run(|app, event| {
      if let tauri::RunEvent::Exit = event {
        let manager: tauri::State<Arc<SessionManager>> = app.state();
        manager.shutdown();
      }
    });
}
