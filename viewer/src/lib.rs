//! HTTP view onto the recorder: latest stills, a camera list and a small
//! dashboard page.

use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use lookout_common::StillSource;
use std::sync::Arc;

pub mod api;

/// Binds the viewer on `host:port`. The returned server must be awaited (or
/// spawned) to start serving.
pub fn build_server(source: Arc<dyn StillSource>, host: &str, port: u16) -> std::io::Result<Server> {
    let source: web::Data<dyn StillSource> = web::Data::from(source);

    let server = HttpServer::new(move || App::new().app_data(source.clone()).configure(api::configure))
        .workers(2)
        .bind((host.to_string(), port))?
        .run();

    tracing::info!("Viewer listening on {}:{}", host, port);
    Ok(server)
}
