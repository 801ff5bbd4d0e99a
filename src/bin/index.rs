use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fastrag::provider::conversion::OutputFormat;
use fastrag::provider::vision::VISION_LABEL;
use fastrag::provider::{ConversionRequest, VisionRequest};
use fastrag::units::EMBEDDING_CHUNK;
use fastrag::{
    replace_document, telemetry, Chunker, ChunkerConfig, EmbeddingRetriever, EmbeddingSpec,
    LogFormat, PipelineSpec, ProviderArgs, RetrievalContext, RetrievalPipeline, StoreArgs,
    CONVERSION_LABEL,
};

#[derive(Parser, Debug)]
#[command(
    name = "fastrag-index",
    about = "Convert, chunk, store and embed one document"
)]
struct IndexCli {
    /// Identifier the document is stored under
    #[arg(long)]
    doc_id: String,

    /// Source file (markdown/text, or anything the converter accepts)
    #[arg(long)]
    file: PathBuf,

    /// Document title, defaults to the file stem
    #[arg(long)]
    title: Option<String>,

    /// Send the file through the document converter even if it is markdown
    #[arg(long, default_value_t = false)]
    convert: bool,

    /// Approximate tokens per embedding chunk
    #[arg(long, env = "FASTRAG_CHUNK_TOKENS", default_value_t = 256)]
    chunk_tokens: usize,

    /// Pipeline definition whose embedding stages should be prepared
    #[arg(long)]
    pipeline: Option<PathBuf>,

    /// Embedding label used when no pipeline is given
    #[arg(long, default_value = "embeddings")]
    embedding_model: String,

    /// Only store the hierarchy
    #[arg(long, default_value_t = false)]
    skip_embeddings: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(flatten)]
    provider: ProviderArgs,

    #[command(flatten)]
    store: StoreArgs,
}

fn extension(path: &std::path::Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn is_plain_text(path: &std::path::Path) -> bool {
    matches!(extension(path).as_str(), "md" | "markdown" | "txt")
}

fn image_format(path: &std::path::Path) -> Option<&'static str> {
    match extension(path).as_str() {
        "png" => Some("png"),
        "jpg" | "jpeg" => Some("jpeg"),
        "webp" => Some("webp"),
        "gif" => Some("gif"),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = IndexCli::parse();
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

    let markdown = if let Some(format) = image_format(&cli.file) {
        let bytes = tokio::fs::read(&cli.file)
            .await
            .with_context(|| format!("failed to read {}", cli.file.display()))?;
        let request = VisionRequest::new(&bytes, format).question(
            "Transcribe all text in this image and describe any figures or tables as markdown.",
        );
        orchestrator
            .execute(VISION_LABEL, &request)
            .await
            .context("image description failed")?
            .content
    } else if cli.convert || !is_plain_text(&cli.file) {
        let request = ConversionRequest::from_path(&cli.file)
            .await
            .with_context(|| format!("failed to read {}", cli.file.display()))?
            .format(OutputFormat::Markdown);
        orchestrator
            .execute(CONVERSION_LABEL, &request)
            .await
            .context("document conversion failed")?
            .content
    } else {
        tokio::fs::read_to_string(&cli.file)
            .await
            .with_context(|| format!("failed to read {}", cli.file.display()))?
    };

    let title = cli.title.clone().unwrap_or_else(|| {
        cli.file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| cli.doc_id.clone())
    });
    let hierarchy = Chunker::new(ChunkerConfig {
        chunk_target_tokens: cli.chunk_tokens,
    })
    .build(&cli.doc_id, &title, &markdown);
    if hierarchy.units.is_empty() {
        bail!("{} produced no content", cli.file.display());
    }
    let stored = replace_document(store.as_ref(), &hierarchy)
        .await
        .context("failed to store document hierarchy")?;

    let ctx = RetrievalContext::new(orchestrator, store);
    let embedded = if cli.skip_embeddings {
        0
    } else if let Some(path) = &cli.pipeline {
        let spec = PipelineSpec::from_path(path)
            .await
            .with_context(|| format!("failed to load pipeline {}", path.display()))?;
        RetrievalPipeline::new(spec, ctx)
            .prepare(Some(&cli.doc_id))
            .await
            .context("failed to prepare pipeline embeddings")?
    } else {
        let spec = EmbeddingSpec {
            level: EMBEDDING_CHUNK.to_string(),
            retrieval_amount: 0,
            model: cli.embedding_model.clone(),
        };
        EmbeddingRetriever::new(spec, ctx)
            .generate_embeddings(Some(&cli.doc_id), &[])
            .await
            .context("failed to embed chunks")?
    };

    println!(
        "{}",
        serde_json::json!({
            "doc_id": cli.doc_id,
            "units": stored,
            "spans": hierarchy.spans.len(),
            "embedded": embedded,
        })
    );
    Ok(())
}
