use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fastrag::provider::{ChatMessage, ChatRequest};
use fastrag::{
    config, telemetry, LevelOrder, LogFormat, PipelineSpec, ProviderArgs, RetrievalContext,
    RetrievalPipeline, RetrievedContent, StoreArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "fastrag-retrieve",
    about = "Run a retrieval pipeline for a query and optionally answer it"
)]
struct RetrieveCli {
    /// Question to retrieve context for
    #[arg(long)]
    query: String,

    /// Pipeline definition (JSON)
    #[arg(long, env = "FASTRAG_PIPELINE")]
    pipeline: PathBuf,

    /// Comma separated hierarchy levels, coarsest first
    #[arg(long)]
    level_order: Option<String>,

    /// Abort retrieval after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Entries kept in the query embedding cache
    #[arg(long, default_value_t = 256)]
    query_cache: usize,

    /// Ask the generator label for an answer grounded in the context
    #[arg(long, default_value_t = false)]
    answer: bool,

    /// Chat label used for --answer
    #[arg(long, default_value = "generator")]
    answer_model: String,

    /// JSON file with prior chat messages ([{"role": .., "content": ..}])
    #[arg(long)]
    history: Option<PathBuf>,

    /// Print the retrieved units as JSON instead of text
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(flatten)]
    provider: ProviderArgs,

    #[command(flatten)]
    store: StoreArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = RetrieveCli::parse();
    telemetry::init(cli.log_format)?;

    let orchestrator = cli
        .provider
        .build_orchestrator()
        .context("failed to configure provider")?;
    let store = cli
        .store
        .connect()
        .await
        .context("failed to open document store")?;
    let spec = PipelineSpec::from_path(&cli.pipeline)
        .await
        .with_context(|| format!("failed to load pipeline {}", cli.pipeline.display()))?;

    let mut ctx = RetrievalContext::new(orchestrator.clone(), store).with_query_cache(cli.query_cache);
    if let Some(raw) = &cli.level_order {
        ctx = ctx.with_levels(LevelOrder::new(config::parse_levels(raw)?)?);
    }
    let mut pipeline = RetrievalPipeline::new(spec, ctx);
    if let Some(secs) = cli.deadline_secs {
        pipeline = pipeline.with_deadline(Duration::from_secs(secs));
    }

    let retrieved = pipeline.run(&cli.query).await.context("retrieval failed")?;
    if retrieved.is_empty() {
        bail!("pipeline selected no content for the query");
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&retrieved)?);
    } else {
        println!("--- Retrieved Context ---\n{}", render_context(&retrieved));
    }
    if !cli.answer {
        return Ok(());
    }

    let history: Vec<ChatMessage> = match &cli.history {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw).context("history must be a JSON list of messages")?
        }
        None => Vec::new(),
    };
    let prompt = build_prompt(&cli.query, &render_context(&retrieved));
    let completion = orchestrator
        .execute(&cli.answer_model, &ChatRequest::with_history(&history, prompt))
        .await
        .context("answer generation failed")?;
    println!("--- Answer ({}) ---\n{}", completion.model, completion.content);
    Ok(())
}

fn build_prompt(question: &str, context_block: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("Answer the question using only the context below. Cite the units you use as [doc_id:level_id].\n\n");
    prompt.push_str("Context:\n");
    prompt.push_str(context_block);
    prompt.push_str("\nQuestion:\n");
    prompt.push_str(question);
    prompt.push('\n');
    prompt
}

fn render_context(units: &[RetrievedContent]) -> String {
    let mut out = String::new();
    for unit in units {
        let score = unit
            .score
            .map(|score| format!("{score:.4}"))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "[{}:{}] {} ({}) score={}\n{}\n---\n",
            unit.doc_id,
            unit.level_id,
            unit.title,
            unit.level,
            score,
            unit.content.trim()
        ));
    }
    out
}
