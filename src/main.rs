use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use dotenv::dotenv;
use imgcacher::cache::CachePolicy;
use imgcacher::config::{ConfigStore, DEFAULT_CONFIG_FILE};
use imgcacher::images::RemoteFetcher;
use imgcacher::logging;
use log::{error, info, warn};

#[rocket::launch]
async fn rocket() -> _ {
    dotenv().ok();

    // Load config
    let config_path = env::var("IMGCACHER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    let (config_store, warnings) = match ConfigStore::open(&config_path) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = logging::init(None);
            error!("Error: {}", e);
            process::exit(1);
        }
    };
    let config = config_store.snapshot();

    // Initialize logger
    let log_file = (!config.log_file_name.is_empty()).then(|| Path::new(&config.log_file_name));
    if let Err(e) = logging::init(log_file) {
        let _ = logging::init(None);
        error!("Error opening log file {}: {}", config.log_file_name, e);
        process::exit(1);
    }

    for warning in &warnings {
        warn!("{}", warning);
    }
    info!("Initialized config:\n{}", config.to_pretty_string());

    let fetcher = match RemoteFetcher::new(config.request_timeout) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            error!("Error creating HTTP client: {}", e);
            process::exit(1);
        }
    };

    let config_store = Arc::new(config_store);
    let policy = CachePolicy::new(config_store.clone(), Arc::new(fetcher));

    info!(
        "Starting image cache server on {}:{}",
        config.address, config.listen_port
    );

    imgcacher::build_rocket(imgcacher::figment(&config), config_store, policy)
}
