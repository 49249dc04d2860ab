#[macro_use]
extern crate rocket;

pub mod api;
pub mod cache;
pub mod config;
pub mod cors;
pub mod images;
pub mod logging;

use std::sync::Arc;

use rocket::figment::Figment;
use rocket::{Build, Rocket};

use cache::CachePolicy;
use config::{AppConfig, ConfigStore};
use cors::CORS;

/// Rocket settings derived from the app config.
pub fn figment(config: &AppConfig) -> Figment {
    rocket::Config::figment()
        .merge(("port", config.listen_port))
        .merge(("address", config.address.clone()))
}

/// Assembles the server: routes, CORS and managed state.
pub fn build_rocket(figment: Figment, config: Arc<ConfigStore>, policy: CachePolicy) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(CORS)
        .manage(config)
        .manage(policy)
        .mount(
            "/",
            routes![
                api::routes::index,
                api::routes::favicon,
                api::routes::reload,
                api::routes::cached_image,
                api::routes::post_not_allowed,
                api::routes::put_not_allowed,
                api::routes::delete_not_allowed,
                api::routes::patch_not_allowed,
                api::routes::options_not_allowed,
            ],
        )
}
