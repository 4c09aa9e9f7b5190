use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult};
use actix_ws::Message;
use dflowcore::{FlowError, InboundMessage, RoutingError};
use dflowruntime::{Engine, EngineConfig, Pipeline};
use dflowstores::{HttpForwarder, InMemoryContextStore, InMemoryCounterStore, TokioDelayScheduler};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod pipelines;

/// Application state shared across handlers
struct AppState {
    engine: Engine,
    pipelines: HashMap<String, Pipeline>,
}

/// Request body for an external callback
#[derive(Debug, Deserialize)]
struct CallRequest {
    trace_id: String,
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    trace_id: Option<String>,
}

/// Outcome of processing one message
#[derive(Debug, Serialize)]
struct AcceptedResponse {
    trace_id: String,
    accepted: bool,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    retryable: bool,
}

fn error_response(err: FlowError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
        retryable: err.is_retryable(),
    };
    match &err {
        FlowError::Routing(RoutingError::UnknownCallType(_))
        | FlowError::Routing(RoutingError::UnknownStep(_))
        | FlowError::Routing(RoutingError::NotStarted { .. }) => HttpResponse::NotFound().json(body),
        FlowError::Routing(_) => HttpResponse::Conflict().json(body),
        FlowError::Retry { .. } | FlowError::Store(_) => HttpResponse::ServiceUnavailable().json(body),
        FlowError::Step { .. } | FlowError::Terminated { .. } => HttpResponse::UnprocessableEntity().json(body),
        FlowError::Construction(_) | FlowError::Serialization(_) => {
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn accepted(trace_id: &str, result: Result<bool, FlowError>) -> HttpResponse {
    match result {
        Ok(accepted) => HttpResponse::Ok().json(AcceptedResponse {
            trace_id: trace_id.to_string(),
            accepted,
        }),
        Err(e) => {
            warn!("{} not processed: {}", trace_id, e);
            error_response(e)
        }
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "dflow",
        "machine_id": data.engine.machine_id(),
    }))
}

/// Deliver an external callback
#[post("/api/calls/{call_type}")]
async fn deliver_call(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<CallRequest>,
) -> ActixResult<impl Responder> {
    let call_type = path.into_inner();
    let req = req.into_inner();
    if call_type.contains('#') {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse {
            error: format!("Call type {} is internal", call_type),
            retryable: false,
        }));
    }
    info!("Callback {} for {}", call_type, req.trace_id);

    let result = data.engine.resume(&call_type, &req.payload, &req.trace_id).await;
    Ok(accepted(&req.trace_id, result))
}

/// Messages forwarded by other machines of the fleet
#[post("/api/forward")]
async fn forward(
    data: web::Data<AppState>,
    message: web::Json<InboundMessage>,
) -> ActixResult<impl Responder> {
    let message = message.into_inner();
    let trace_id = message.trace_id().to_string();
    info!("Forwarded message for {}", trace_id);

    let result = data.engine.dispatch(message).await;
    Ok(accepted(&trace_id, result))
}

/// Start a pipeline whose entry needs no callback
#[post("/api/flows/{pipeline}/start")]
async fn start_flow(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: Option<web::Json<StartRequest>>,
) -> ActixResult<impl Responder> {
    let name = path.into_inner();
    let Some(pipeline) = data.pipelines.get(&name) else {
        return Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Pipeline {} not found", name),
            retryable: false,
        }));
    };

    let trace_id = req
        .and_then(|r| r.into_inner().trace_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let result = data.engine.start(pipeline, &trace_id).await;
    Ok(accepted(&trace_id, result))
}

/// List installed pipelines
#[get("/api/flows")]
async fn list_pipelines(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let mut pipelines: Vec<&Pipeline> = data.pipelines.values().collect();
    pipelines.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(HttpResponse::Ok().json(pipelines))
}

/// Re-enter a step that asked for a retry
#[post("/api/retry/{trace_id}")]
async fn retry(data: web::Data<AppState>, path: web::Path<String>) -> ActixResult<impl Responder> {
    let trace_id = path.into_inner();
    let result = data.engine.retry(&trace_id).await;
    Ok(accepted(&trace_id, result))
}

/// Get the checkpoint of a flow instance
#[get("/api/checkpoints/{trace_id}")]
async fn get_checkpoint(data: web::Data<AppState>, path: web::Path<String>) -> ActixResult<impl Responder> {
    let trace_id = path.into_inner();
    match data.engine.checkpoint(&trace_id).await {
        Ok(Some(cp)) => Ok(HttpResponse::Ok().json(cp)),
        Ok(None) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Flow {} not found", trace_id),
            retryable: false,
        })),
        Err(e) => {
            error!("Checkpoint {} unreadable: {}", trace_id, e);
            Ok(error_response(e))
        }
    }
}

/// Routing table
#[get("/api/routes")]
async fn list_routes(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    Ok(HttpResponse::Ok().json(data.engine.router().routes().await))
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");
    let mut events = data.engine.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting dflow server");

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let mut config = EngineConfig::from_env();
    if std::env::var("DFLOW_MACHINE_ID").is_err() {
        config.machine_id = bind_address.clone();
    }

    let (scheduler, timers) = TokioDelayScheduler::new();
    let engine = Engine::builder(
        Arc::new(InMemoryContextStore::new()),
        Arc::new(InMemoryCounterStore::new()),
    )
    .config(config)
    .delay_scheduler(Arc::new(scheduler))
    .forwarder(Arc::new(HttpForwarder::new()))
    .build();

    let pipelines = pipelines::install_all(&engine).await?;
    info!(
        "Engine {} ready with {} pipelines",
        engine.machine_id(),
        pipelines.len()
    );

    let driver = engine.clone();
    actix_web::rt::spawn(async move { driver.drive(timers).await });

    let app_state = web::Data::new(AppState { engine, pipelines });

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(deliver_call)
            .service(forward)
            .service(list_pipelines)
            .service(start_flow)
            .service(retry)
            .service(get_checkpoint)
            .service(list_routes)
            .service(websocket_events)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
