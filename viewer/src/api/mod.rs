mod cameras;
mod dash;
mod system;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.configure(system::configure)
        .configure(cameras::configure)
        .configure(dash::configure);
}

/// Camera names are restricted to `[A-Za-z0-9_-]`; anything else cannot
/// match a camera.
pub(crate) fn is_camera_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
