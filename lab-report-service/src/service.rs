use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    middleware::from_fn,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    config::ServiceConfig,
    error::PipelineError,
    gateway::{GatewayError, OpenRouterGateway},
    models::{AnalysisOutcome, AnalyzeReportRequest},
    render::render_report,
    telemetry::correlation_id_middleware,
    text_source::{DocumentTextSource, ExtractionError, VisionOcr},
    workflow::ReportPipeline,
};

type ApiResult<T> = Result<T, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

fn pipeline_error(error: &PipelineError) -> ApiError {
    let status = match error {
        PipelineError::Extraction(ExtractionError::UnsupportedFormat { .. }) => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        PipelineError::Extraction(ExtractionError::NotFound { .. }) => StatusCode::NOT_FOUND,
        PipelineError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Gateway {
            source: GatewayError::Timeout { .. },
            ..
        } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Gateway { .. } => StatusCode::BAD_GATEWAY,
        PipelineError::MissingContext(_) | PipelineError::Workflow(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (
        status,
        Json(json!({
            "error": error.user_message(),
            "details": error.to_string()
        })),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ReportPipeline>,
}

impl AppState {
    pub fn from_config(config: &ServiceConfig) -> Result<Self, PipelineError> {
        let gateway = Arc::new(OpenRouterGateway::new(
            &config.api_key,
            &config.llm_model,
            config.temperature,
            config.timeout,
        ));
        let vision = VisionOcr::new(&config.api_key, &config.vision_model, config.timeout)?;
        let text_source = Arc::new(DocumentTextSource::new(Some(vision)));

        Ok(Self {
            pipeline: Arc::new(ReportPipeline::new(gateway, text_source)),
        })
    }
}

pub fn create_app(config: &ServiceConfig) -> Result<Router, PipelineError> {
    let app_state = AppState::from_config(config)?;
    Ok(build_router(app_state))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/reports/analyze", post(analyze_report))
        .route("/reports/analyze/pdf", post(analyze_report_pdf))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(correlation_id_middleware))
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Lab Report Analysis Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Turns a lab report into categorized results, plain-language explanations and a PDF summary",
        "endpoints": {
            "POST /reports/analyze": "Analyze a report and return the structured outcome",
            "POST /reports/analyze/pdf": "Analyze a report and return the PDF summary",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn analyze_report(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeReportRequest>,
) -> ApiResult<Json<AnalysisOutcome>> {
    let outcome = run_analysis(&state, &request).await?;
    Ok(Json(outcome))
}

async fn analyze_report_pdf(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeReportRequest>,
) -> ApiResult<Response> {
    let outcome = run_analysis(&state, &request).await?;

    let report = match outcome {
        AnalysisOutcome::Completed { report } => report,
        AnalysisOutcome::ShortCircuited {
            signal, message, ..
        } => {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": message, "signal": signal })),
            ));
        }
    };

    let bytes = tokio::task::spawn_blocking(move || {
        render_report(
            &report.records,
            report.explanation.as_deref(),
            report.summary.as_deref(),
        )
    })
    .await
    .map_err(|e| internal_error("PDF rendering aborted", &e.to_string()))?
    .map_err(|e| {
        error!(error = %e, "Failed to render PDF report");
        internal_error("Failed to render PDF report", &e.to_string())
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"lab_report_summary.pdf\"",
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn run_analysis(
    state: &AppState,
    request: &AnalyzeReportRequest,
) -> ApiResult<AnalysisOutcome> {
    validate_document_path(&request.document_path)?;
    info!(path = %request.document_path, "Starting lab report analysis");

    let path = PathBuf::from(request.document_path.trim());
    match state.pipeline.analyze_document(&path).await {
        Ok(outcome) => {
            if let Some(signal) = outcome.short_circuit() {
                warn!(path = %path.display(), signal = ?signal, "Analysis stopped early");
            }
            Ok(outcome)
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Analysis failed");
            Err(pipeline_error(&e))
        }
    }
}

fn validate_document_path(document_path: &str) -> Result<(), ApiError> {
    if document_path.trim().is_empty() {
        return Err(bad_request_error("Document path is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::ScriptedGateway;
    use crate::text_source::testing::StaticTextSource;
    use crate::text_source::TextSource;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router(gateway: ScriptedGateway, source: Arc<dyn TextSource>) -> Router {
        build_router(AppState {
            pipeline: Arc::new(ReportPipeline::new(Arc::new(gateway), source)),
        })
    }

    fn full_run() -> ScriptedGateway {
        ScriptedGateway::new()
            .reply(r#"[{"patient_name": "Jane Doe"}, {"test_name": "Hemoglobin", "value": "9.5"}]"#)
            .reply(r#"[{"patient_name": "Jane Doe"}, {"test_name": "Hemoglobin", "status": "Critical"}]"#)
            .reply(r#"[{"test_name": "Hemoglobin", "value": "9.5", "status": "Critical"}]"#)
            .reply("Hemoglobin: low.")
            .reply("**Summary**:\n- Low hemoglobin")
    }

    fn analyze(uri: &str, path: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "document_path": path }).to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_correlation_header() {
        let app = router(ScriptedGateway::new(), Arc::new(StaticTextSource::new("")));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-correlation-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-correlation-id"], "abc-123");
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_analyze_returns_outcome() {
        let app = router(full_run(), Arc::new(StaticTextSource::new("Hemoglobin 9.5")));
        let response = app.oneshot(analyze("/reports/analyze", "report.pdf")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["report"]["table"][0]["status"], "Critical");
        assert_eq!(body["report"]["status_counts"]["critical"], 1);
    }

    #[tokio::test]
    async fn test_short_circuit_is_reported_not_failed() {
        let app = router(ScriptedGateway::new(), Arc::new(StaticTextSource::new("  ")));
        let response = app.oneshot(analyze("/reports/analyze", "scan.png")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "short_circuited");
        assert_eq!(body["signal"], "text_extraction_failed");
    }

    #[tokio::test]
    async fn test_pdf_endpoint_returns_pdf() {
        let app = router(full_run(), Arc::new(StaticTextSource::new("Hemoglobin 9.5")));
        let response = app.oneshot(analyze("/reports/analyze/pdf", "report.pdf")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn test_pdf_endpoint_rejects_short_circuit() {
        let app = router(ScriptedGateway::new().reply("[]"), Arc::new(StaticTextSource::new("text")));
        let response = app.oneshot(analyze("/reports/analyze/pdf", "report.pdf")).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["signal"], "no_structured_data");
    }

    #[tokio::test]
    async fn test_request_errors_map_to_status_codes() {
        let app = router(ScriptedGateway::new(), Arc::new(DocumentTextSource::new(None)));

        let response = app.clone().oneshot(analyze("/reports/analyze", "  ")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.clone().oneshot(analyze("/reports/analyze", "notes.docx")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = app
            .oneshot(analyze("/reports/analyze", "/no/such/report.pdf"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_gateway_timeout_maps_to_504() {
        let gateway = ScriptedGateway::new().fail(GatewayError::Timeout { secs: 45 });
        let app = router(gateway, Arc::new(StaticTextSource::new("Hemoglobin 9.5")));
        let response = app.oneshot(analyze("/reports/analyze", "report.pdf")).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("45s"));
    }
}
