use actix_web::{dev::Server, middleware, web::Data, App, HttpServer};
use anyhow::Result;
use contour_operator::controllers::contour_controller::State;

use crate::handlers::{health, metrics};

/// Configure the HTTP server serving health, metrics and diagnostics
pub fn build_server(state: State, addr: &str) -> Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health::index)
            .service(health::health)
            .service(metrics::metrics)
    })
    .bind(addr)?
    .shutdown_timeout(5);

    Ok(server.run())
}
