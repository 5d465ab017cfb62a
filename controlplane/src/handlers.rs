use std::time::Duration;

use axum::body::{Body, BoxBody};
use axum::extract::{Extension, Path};
use axum::http::{Request, Response, StatusCode};
use axum::routing::{delete, get, post, put, Router};
use axum::Json;
use releasy_common::deployment::Deployment;
use releasy_common::event::Event;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, field, Span};
use uuid::Uuid;

use crate::deployment::{DeploymentCommand, DeploymentService};
use crate::error::Result;
use crate::service::{CreateServiceCommand, ServiceService};

pub fn make_router(
    deployment_service: DeploymentService,
    service_service: ServiceService,
) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/deployment", post(create_deployment))
        .route("/deployment/finish/:job_id", put(finish_deployment))
        .route("/service", post(create_service))
        .route("/service/:application/:name", delete(delete_service))
        .route(
            "/service/:application/:name/deployments",
            get(get_deployment_history),
        )
        .route("/service/:application/:name/events", get(get_service_events))
        .layer(Extension(deployment_service))
        .layer(Extension(service_service))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<Body>| {
                    debug_span!("request", http.uri = %request.uri(), http.method = %request.method(), http.status_code = field::Empty)
                })
                .on_response(
                    |response: &Response<BoxBody>, latency: Duration, span: &Span| {
                        span.record("http.status_code", response.status().as_u16());
                        debug!(latency = format_args!("{} ns", latency.as_nanos()), "finished processing request");
                    },
                ),
        )
}

async fn ping() -> Json<&'static str> {
    Json("pong")
}

async fn create_deployment(
    Extension(deployment_service): Extension<DeploymentService>,
    Json(command): Json<DeploymentCommand>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let job_id = deployment_service.execute(command).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "deployment created",
            "job_id": job_id,
        })),
    ))
}

async fn finish_deployment(
    Extension(deployment_service): Extension<DeploymentService>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    deployment_service.finish(job_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "finishing deployment" })),
    ))
}

async fn create_service(
    Extension(service_service): Extension<ServiceService>,
    Json(command): Json<CreateServiceCommand>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let job_id = service_service.create(command).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "service enrolled",
            "job_id": job_id,
        })),
    ))
}

async fn delete_service(
    Extension(service_service): Extension<ServiceService>,
    Path((application, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    service_service.delete(&application, &name).await?;

    Ok(Json(json!({ "status": "service deleted" })))
}

async fn get_deployment_history(
    Extension(service_service): Extension<ServiceService>,
    Path((application, name)): Path<(String, String)>,
) -> Result<Json<Vec<Deployment>>> {
    let deployments = service_service
        .deployment_history(&application, &name)
        .await?;

    Ok(Json(deployments))
}

async fn get_service_events(
    Extension(service_service): Extension<ServiceService>,
    Path((application, name)): Path<(String, String)>,
) -> Result<Json<Vec<Event>>> {
    let events = service_service.events(&application, &name).await?;

    Ok(Json(events))
}
