use color_eyre::{eyre::eyre, Result};
use mqtt_workbench::config::AppConfig;
use mqtt_workbench::console;
use mqtt_workbench::mqtt::RumqttClient;
use mqtt_workbench::persistence::{ContextStore, FileStorage};
use mqtt_workbench::runtime::ClientRuntime;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = AppConfig::default_path();
    let mut config = AppConfig::ensure_default_config(&path)
        .await
        .map_err(|e| eyre!("Failed to load {}: {}", path.display(), e))?;
    config.apply_env();
    setup_logging(config.log_level());
    info!("Configuration loaded from {}", path.display());

    let storage = FileStorage::new(config.storage_dir());
    info!("Contexts are stored in {}", storage.dir().display());
    let store = ContextStore::open(
        storage,
        config.storage.key.clone(),
        config.context_defaults(),
        &config.defaults.context,
    )
    .await;

    let (runtime, handle) = ClientRuntime::new(
        Box::new(RumqttClient::new()),
        store,
        config.session_settings(),
        config.autosave_interval(),
    );
    let runtime_task = runtime.spawn();

    if let Err(e) = console::run(handle).await {
        error!("Console stopped: {}", e);
    }

    runtime_task
        .await
        .map_err(|e| eyre!("Session runtime panicked: {}", e))?;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}
