use actix_web::{get, web::Data, HttpRequest, HttpResponse, Responder};
use contour_operator::controllers::contour_controller::State;

#[get("/health")]
pub async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

/// Diagnostics of the controller, currently the time of the last reconcile.
#[get("/")]
pub async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}
