use actix_web::{get, web, HttpResponse};
use lookout_common::StillSource;
use serde_json::json;

#[get("/health")]
async fn health(source: web::Data<dyn StillSource>) -> HttpResponse {
    let cameras = source.cameras();
    let with_image = cameras.iter().filter(|camera| camera.has_image).count();

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "cameras": cameras.len(),
        "cameras_with_image": with_image,
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FixedStills;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_rt::test]
    async fn test_health_counts_cameras() {
        let source: Arc<dyn StillSource> = Arc::new(FixedStills::sample());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(source))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["cameras"], 2);
        assert_eq!(body["cameras_with_image"], 1);
    }
}
