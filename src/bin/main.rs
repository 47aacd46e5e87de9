use financial_agent_engine::{
    config::EngineConfig,
    engine::{Engine, EngineContext},
    models::{EngineRequest, EngineResponse},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_summary(label: &str, response: &EngineResponse) {
    println!("\n=== {} ===", label);
    println!("Request ID: {}", response.request_id);
    println!(
        "Workflow: {} (route: {}, source: {})",
        response.workflow_id.as_deref().unwrap_or("-"),
        response.route_id.as_deref().unwrap_or("-"),
        response.route_source.as_deref().unwrap_or("-"),
    );
    match response.cache_layer {
        Some(layer) => println!("Cached: yes ({})", layer.as_str()),
        None => println!("Cached: no"),
    }
    if let Some(answer) = &response.final_answer {
        println!("Answer: {}", answer);
    }

    println!("\nExecutors:");
    for record in &response.records {
        println!(
            "  {}: {} - {} ms, {}+{} tokens, ${:.6}{}",
            record.index + 1,
            record.executor_name,
            record.duration_ms,
            record.input_tokens,
            record.output_tokens,
            record.cost,
            if record.cached { " (tool cache)" } else { "" },
        );
    }
    for error in &response.errors {
        println!("  ⚠️  {}", error.message);
    }

    let costs = &response.costs;
    println!(
        "\nCost: ${:.6} actual / ${:.6} baseline, saved ${:.6} ({:.1}%)",
        costs.actual_cost, costs.baseline_cost, costs.savings, costs.savings_pct
    );

    println!("\nTimeline ({} ms):", response.timeline.total_duration_ms);
    for event in &response.timeline.events {
        println!(
            "  {:?} {} - {} ms ({:?})",
            event.event_type, event.name, event.duration_ms, event.status
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Financial Agent Engine demo starting");

    let engine = Engine::new(EngineContext::in_memory(EngineConfig::default()))?;
    engine.initialize().await;

    let query = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "price of AAPL".to_string());

    let first = engine.handle(EngineRequest::new(query.clone())).await?;
    print_summary("FIRST RUN", &first);

    let second = engine.handle(EngineRequest::new(query)).await?;
    print_summary("REPEAT RUN", &second);

    Ok(())
}
