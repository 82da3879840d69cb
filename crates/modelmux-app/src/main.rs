use std::process;
use std::sync::Arc;

use modelmux_app::cli::{AnalyzeArgs, Cli, Commands, ExtractArgs, ModelsArgs};
use modelmux_app::config::{self, LogFormat};
use modelmux_app::pipeline::{ExtractInput, ExtractorRegistry};
use modelmux_app::router::{
    AvailabilityView, Catalog, ScoreInput, ScoredMessage, route, score,
};
use modelmux_app::sniff::detect_mime;
use modelmux_app::{AppError, Gateway};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = config::load()?;
    init_tracing(&config, cli.verbose);

    match cli.command {
        Some(Commands::Serve(_)) => {
            let gateway = Gateway::bootstrap(config).await?;
            let server_config = gateway.server_config();
            let limits = gateway.rate_limits();
            let service: Arc<dyn modelmux_server::GatewayService> = gateway;
            modelmux_server::serve(service, server_config, limits).await?;
        }
        Some(Commands::Models(args)) => run_models(args, &config),
        Some(Commands::Analyze(args)) => run_analyze(args, &config)?,
        Some(Commands::Extract(args)) => run_extract(args, &config).await?,
        None => Cli::print_help(),
    }

    Ok(())
}

fn init_tracing(config: &modelmux_app::config::AppConfig, verbosity: u8) {
    let default_level = match verbosity {
        0 => config.observability.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = match config.observability.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    if result.is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

fn run_models(args: ModelsArgs, config: &modelmux_app::config::AppConfig) {
    let catalog = if config.providers.is_empty() {
        Catalog::builtin()
    } else {
        Catalog::from_providers(&config.providers)
    };

    if args.json {
        let ids: Vec<serde_json::Value> = catalog
            .models()
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "provider": m.provider_id,
                    "speed_tier": m.speed_tier.as_ref(),
                    "pricing_tier": m.pricing_tier.as_ref(),
                    "cost_per_1k_input": m.cost_per_1k_input,
                    "context_window": m.context_window,
                    "available": catalog.provider_has_key(&m.provider_id),
                })
            })
            .collect();
        println!("{}", serde_json::json!(ids));
        return;
    }

    for model in catalog.models() {
        let available = if catalog.provider_has_key(&model.provider_id) {
            "available"
        } else {
            "no-key"
        };
        println!(
            "{:<24} {:<12} {:<9} ${:<8.3} {}",
            model.id,
            model.provider_id,
            model.speed_tier.as_ref(),
            model.cost_per_1k_input,
            available,
        );
    }
}

fn run_analyze(args: AnalyzeArgs, config: &modelmux_app::config::AppConfig) -> Result<(), AppError> {
    let catalog = if config.providers.is_empty() {
        Catalog::builtin()
    } else {
        Catalog::from_providers(&config.providers)
    };

    let complexity = score(&ScoreInput {
        messages: vec![ScoredMessage {
            is_user: true,
            content: args.prompt,
        }],
        files: vec![],
        max_tokens_hint: None,
        fast_context_floor: catalog.fast_context_floor(),
    });

    let routed = route(
        &complexity,
        &args.model,
        &config.router,
        &catalog,
        &AvailabilityView::default(),
    );

    println!("{}", serde_json::to_string_pretty(&complexity)?);
    match routed {
        Ok(route) => println!("{}", serde_json::to_string_pretty(&route)?),
        Err(err) => println!("routing failed: {err}"),
    }
    Ok(())
}

async fn run_extract(
    args: ExtractArgs,
    config: &modelmux_app::config::AppConfig,
) -> Result<(), AppError> {
    let bytes = tokio::fs::read(&args.path).await.map_err(|source| AppError::Io {
        path: args.path.clone(),
        source,
    })?;

    let name = args
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.bin");
    let mime = detect_mime(&bytes, name);
    println!("detected: {mime}");

    let registry = ExtractorRegistry::standard(&config.extraction);
    let Some(extractor) = registry.find(mime) else {
        println!("no extractor registered for {mime}");
        return Ok(());
    };

    match extractor
        .extract(ExtractInput {
            bytes: &bytes,
            mime,
            size_hint: bytes.len() as u64,
            text_cap: config.extraction.text_cap,
        })
        .await
    {
        Ok(raw) => {
            println!("kind: {}", raw.kind.as_str());
            println!("metadata: {}", raw.metadata);
            for warning in &raw.warnings {
                println!("warning: {warning}");
            }
            println!("{}", raw.text);
        }
        Err(err) => println!("extraction failed: {err}"),
    }
    Ok(())
}
