//! Query View (I): read-only introspection HTTP endpoints over the engine's
//! registration table (spec §6), in the teacher's `actix-web` `App`/`web::Data`
//! style (`server/mod.rs`/`web_model.rs`).

use actix::Addr;
use actix_web::{error, web, App, Error, HttpRequest, HttpResponse, HttpServer};
use serde::Serialize;

use crate::engine::{EngineActor, ListApps, ListCallbacks};

/// Mirrors the teacher's `server::web_model::ApiResponse` envelope for error
/// bodies; success bodies are the bare JSON value.
#[derive(Serialize)]
struct ApiError<'a> {
    code: &'a str,
    message: String,
}

pub fn json_error_handler(err: error::JsonPayloadError, _req: &HttpRequest) -> Error {
    let message = err.to_string();
    let resp = HttpResponse::BadRequest().json(ApiError { code: "BAD_REQUEST", message });
    error::InternalError::from_response(err, resp).into()
}

async fn list_apps(engine: web::Data<Addr<EngineActor>>) -> HttpResponse {
    match engine.send(ListApps).await {
        Ok(apps) => HttpResponse::Ok().json(apps),
        Err(e) => HttpResponse::InternalServerError().json(ApiError { code: "ENGINE_UNREACHABLE", message: e.to_string() }),
    }
}

async fn list_callbacks(engine: web::Data<Addr<EngineActor>>, path: web::Path<String>) -> HttpResponse {
    let app_name = path.into_inner();
    match engine.send(ListCallbacks { app_name }).await {
        Ok(Ok(callbacks)) => HttpResponse::Ok().json(callbacks),
        Ok(Err(e)) => HttpResponse::NotFound().json(ApiError { code: "UNKNOWN_APP", message: e.to_string() }),
        Err(e) => HttpResponse::InternalServerError().json(ApiError { code: "ENGINE_UNREACHABLE", message: e.to_string() }),
    }
}

/// Builds the introspection `HttpServer`, bound to every configured
/// interface (spec §6 "bind to all interfaces").
pub fn build_server(engine: Addr<EngineActor>, interface: &str, port: u16) -> std::io::Result<actix_web::dev::Server> {
    let engine_data = web::Data::new(engine);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(engine_data.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .route("/apps", web::get().to(list_apps))
            .route("/apps/{app_name}/callbacks", web::get().to(list_callbacks))
    })
    .bind((interface, port))?
    .workers(1)
    .run();
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_serializes_with_code_and_message() {
        let err = ApiError { code: "BAD_REQUEST", message: "oops".to_string() };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "BAD_REQUEST");
        assert_eq!(json["message"], "oops");
    }
}
