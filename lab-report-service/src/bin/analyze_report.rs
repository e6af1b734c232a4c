use anyhow::{Context as _, Result};
use lab_report_service::{
    AnalysisOutcome, ReportPipeline, ServiceConfig,
    gateway::OpenRouterGateway,
    render::render_report,
    telemetry::init_tracing,
    text_source::{DocumentTextSource, VisionOcr},
};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_OUTPUT: &str = "lab_report_summary.pdf";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if !(2..=3).contains(&args.len()) {
        eprintln!("Usage: {} <report.pdf|image> [output.pdf]", args[0]);
        eprintln!("Example: {} /path/to/lab_report.pdf summary.pdf", args[0]);
        std::process::exit(1);
    }

    let input = Path::new(&args[1]);
    let output = args
        .get(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    let gateway = Arc::new(OpenRouterGateway::new(
        &config.api_key,
        &config.llm_model,
        config.temperature,
        config.timeout,
    ));
    let vision = VisionOcr::new(&config.api_key, &config.vision_model, config.timeout)?;
    let pipeline = ReportPipeline::new(gateway, Arc::new(DocumentTextSource::new(Some(vision))));

    println!("Lab Report Analysis");
    println!("===================");
    println!("Processing: {}", input.display());
    println!();

    let report = match pipeline.analyze_document(input).await? {
        AnalysisOutcome::Completed { report } => report,
        AnalysisOutcome::ShortCircuited { message, .. } => {
            eprintln!("Analysis stopped: {message}");
            std::process::exit(2);
        }
    };

    println!("Test results:");
    println!("─────────────");
    for row in &report.table {
        let [name, value, unit, range, status] = row.cells();
        println!("  {name:<28} {value:>10} {unit:<10} {range:<16} {status}");
    }
    println!();

    for warning in &report.warnings {
        println!("Warning ({}): {}", warning.stage, warning.message);
    }

    if let Some(summary) = &report.summary {
        println!("Summary:");
        println!("────────");
        println!("{summary}");
        println!();
    }

    let bytes = render_report(
        &report.records,
        report.explanation.as_deref(),
        report.summary.as_deref(),
    )?;
    std::fs::write(&output, bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("PDF report written to {}", output.display());
    Ok(())
}
