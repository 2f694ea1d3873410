use actix_web::http::header::{CacheControl, CacheDirective, ContentType};
use actix_web::{get, web, HttpResponse};
use lookout_common::StillSource;
use serde_json::json;

use super::is_camera_name;

#[get("/cameras")]
async fn list_cameras(source: web::Data<dyn StillSource>) -> HttpResponse {
    HttpResponse::Ok().json(source.cameras())
}

#[get("/cameras/{name}")]
async fn camera_image(
    source: web::Data<dyn StillSource>,
    path: web::Path<String>,
) -> HttpResponse {
    let name = path.into_inner();
    if !is_camera_name(&name) {
        return HttpResponse::NotFound().json(json!({ "error": "unknown camera" }));
    }

    match source.latest_still(&name) {
        Some(still) => HttpResponse::Ok()
            .content_type(ContentType::jpeg())
            .insert_header(CacheControl(vec![CacheDirective::NoCache]))
            .body(still.data().clone()),
        None => {
            tracing::debug!(camera = %name, "No still to serve");
            HttpResponse::NotFound().json(json!({ "error": "no image for camera", "camera": name }))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(list_cameras).service(camera_image);
}
