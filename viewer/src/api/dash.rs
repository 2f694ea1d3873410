use actix_web::http::header::ContentType;
use actix_web::{get, web, HttpResponse};
use lookout_common::StillSource;

use super::is_camera_name;

const REFRESH_MS: u32 = 1000;

#[get("/dash")]
async fn dash(source: web::Data<dyn StillSource>) -> HttpResponse {
    let tiles: String = source
        .cameras()
        .iter()
        .filter(|camera| is_camera_name(&camera.name))
        .map(|camera| {
            format!(
                "<figure><img data-camera=\"{name}\" src=\"/cameras/{name}\" alt=\"{name}\">\
                 <figcaption>{name}</figcaption></figure>\n",
                name = camera.name
            )
        })
        .collect();

    let page = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Lookout</title>\n\
         <style>body{{font-family:sans-serif;background:#111;color:#eee}}\
         figure{{display:inline-block;margin:8px}}img{{width:480px;background:#333}}</style>\n\
         </head>\n<body>\n{tiles}<script>\n\
         setInterval(function() {{\n\
           document.querySelectorAll('img[data-camera]').forEach(function(img) {{\n\
             img.src = '/cameras/' + img.dataset.camera + '?t=' + Date.now();\n\
           }});\n\
         }}, {refresh});\n\
         </script>\n</body>\n</html>\n",
        tiles = tiles,
        refresh = REFRESH_MS
    );

    HttpResponse::Ok().content_type(ContentType::html()).body(page)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(dash);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FixedStills;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_rt::test]
    async fn test_dash_has_a_tile_per_camera() {
        let source: Arc<dyn StillSource> = Arc::new(FixedStills::sample());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(source))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/dash").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let page = String::from_utf8(body.to_vec()).unwrap();

        assert!(page.contains("src=\"/cameras/front_door\""));
        assert!(page.contains("src=\"/cameras/back_door\""));
        assert_eq!(page.matches("<figure>").count(), 2);
    }
}
