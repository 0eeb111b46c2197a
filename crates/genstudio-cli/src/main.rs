mod serve;

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genstudio_contracts::events::{EventSink, EventWriter};
use genstudio_contracts::jobs::JobHandle;
use genstudio_contracts::media::{extension_for_mime, ImagePayload, ImageSource};
use genstudio_engine::{
    CancellationToken, GenerationOutcome, JobPoller, PollOutcome, PreviewStore, RemoteStudioClient,
    RequestBuilder, StudioConfig, StudioEngine, ThreadSleeper, UploadProcessor, VideoBackend,
    VideoRequest,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "genstudio", version, about = "Image and video generation studio")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate an image from a prompt.
    Generate(GenerateArgs),
    /// Edit one or more images with a prompt.
    Edit(EditArgs),
    /// Single conservative edit of the first image.
    EditSimple(EditArgs),
    /// Combine several images into one.
    Compose(EditArgs),
    /// Start a video job and, unless --no-wait, download the result.
    Video(VideoArgs),
    /// Print the status of a video operation.
    Operation(OperationArgs),
    /// Download a finished video by URI.
    Download(DownloadArgs),
    /// Validate and compress an image the way uploads are prepared.
    Compress(CompressArgs),
    /// Run the HTTP API.
    Serve(ServeArgs),
}

#[derive(Debug, Parser)]
struct OutputArgs {
    #[arg(long)]
    out: PathBuf,
    /// JSONL event log; defaults to events.jsonl next to --out.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Use a running `genstudio serve` instead of calling the provider.
    #[arg(long)]
    server: Option<String>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    /// Route through the Imagen predict endpoint.
    #[arg(long)]
    imagen: bool,
    /// Image written instead when generation fails.
    #[arg(long)]
    fallback_image: Option<PathBuf>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,
    /// Image being edited; sent after the --image inputs.
    #[arg(long)]
    current: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    fallback_image: Option<PathBuf>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct VideoArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    /// Starting frame.
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long)]
    no_wait: bool,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct OperationArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    server: Option<String>,
}

#[derive(Debug, Parser)]
struct DownloadArgs {
    #[arg(long)]
    uri: String,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct CompressArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
}

#[derive(Debug, Clone, Copy)]
enum EditKind {
    Edit,
    Simple,
    Compose,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("genstudio error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Edit(args) => run_edit(args, EditKind::Edit),
        Command::EditSimple(args) => run_edit(args, EditKind::Simple),
        Command::Compose(args) => run_edit(args, EditKind::Compose),
        Command::Video(args) => run_video(args),
        Command::Operation(args) => run_operation(args),
        Command::Download(args) => run_download(args),
        Command::Compress(args) => run_compress(args),
        Command::Serve(args) => run_serve(args),
    }
}

fn event_sink(events: Option<&Path>, out: &Path) -> Arc<dyn EventSink> {
    let path = events.map(Path::to_path_buf).unwrap_or_else(|| {
        out.parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join("events.jsonl")
    });
    let session_id = format!("genstudio-{}", std::process::id());
    Arc::new(EventWriter::new(path, session_id))
}

fn build_engine(events: Arc<dyn EventSink>, fallback: Option<&Path>) -> Result<StudioEngine> {
    let fallback_image = fallback.map(read_image).transpose()?;
    Ok(StudioEngine::new(StudioConfig::from_env(), events)?.with_fallback_image(fallback_image))
}

fn remote_client(server: &str) -> Result<RemoteStudioClient> {
    RemoteStudioClient::new(server, &StudioConfig::from_env())
        .with_context(|| format!("invalid studio server URL '{server}'"))
}

fn read_image(path: &Path) -> Result<ImagePayload> {
    let source = ImageSource::from_path(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    source
        .to_payload()
        .map_err(|err| anyhow::anyhow!("{}: {err}", path.display()))
}

/// `ratio` is original size over compressed size.
fn compression_summary(name: &str, ratio: f64) -> String {
    format!("compressed {name}: {ratio:.2}x smaller")
}

/// Validates and, when large, compresses an input before it is sent.
fn prepare_input(processor: &UploadProcessor, path: &Path) -> Result<ImageSource> {
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("image")
        .to_string();
    let payload = read_image(path)?;
    let processed = processor
        .process(&name, payload)
        .with_context(|| format!("rejected {}", path.display()))?;
    if let Some(ratio) = processed.compression_ratio.filter(|_| processed.was_compressed) {
        eprintln!("{}", compression_summary(&name, ratio));
    }
    Ok(ImageSource::file(
        processed.name,
        processed.payload.bytes,
        processed.payload.mime_type,
    ))
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed writing {}", path.display()))
}

fn report_outcome(outcome: &GenerationOutcome, out: &Path) -> Result<i32> {
    write_output(out, &outcome.payload.bytes)?;
    if let Some(err) = outcome.error.as_ref().filter(|_| outcome.fallback_used) {
        eprintln!("generation failed, wrote fallback image: {err}");
    }
    println!(
        "{}",
        json!({
            "out": out.display().to_string(),
            "mime_type": outcome.payload.mime_type,
            "size_bytes": outcome.payload.len(),
            "attempts": outcome.attempts,
            "fallback_used": outcome.fallback_used,
            "suggested_extension": extension_for_mime(&outcome.payload.mime_type),
        })
    );
    Ok(if outcome.fallback_used { 2 } else { 0 })
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    if let Some(server) = &args.output.server {
        let payload = remote_client(server)?.generate(&args.prompt, args.model.as_deref())?;
        return report_outcome(&remote_outcome(payload), &args.output.out);
    }
    let events = event_sink(args.output.events.as_deref(), &args.output.out);
    let engine = build_engine(events, args.fallback_image.as_deref())?;
    let outcome = if args.imagen {
        engine.generate_imagen(&args.prompt, args.model.as_deref())?
    } else {
        engine.generate(&args.prompt, args.model.as_deref())?
    };
    report_outcome(&outcome, &args.output.out)
}

fn run_edit(args: EditArgs, kind: EditKind) -> Result<i32> {
    let events = event_sink(args.output.events.as_deref(), &args.output.out);
    let processor = UploadProcessor::new(&StudioConfig::from_env(), PreviewStore::new(), events.clone());
    let mut builder = RequestBuilder::new(args.prompt.clone());
    for path in &args.images {
        builder = builder.add_image(prepare_input(&processor, path)?);
    }
    if let Some(path) = &args.current {
        builder = builder.current_image(Some(prepare_input(&processor, path)?));
    }

    if let Some(server) = &args.output.server {
        let client = remote_client(server)?;
        let payload = match kind {
            EditKind::Simple => client.edit_simple(&builder)?,
            EditKind::Edit | EditKind::Compose => client.edit(&builder)?,
        };
        return report_outcome(&remote_outcome(payload), &args.output.out);
    }

    let engine = build_engine(events, args.fallback_image.as_deref())?;
    let model = args.model.as_deref();
    let outcome = match kind {
        EditKind::Edit => engine.edit(&builder, model)?,
        EditKind::Simple => engine.edit_simple(&builder, model)?,
        EditKind::Compose => engine.compose(&builder, model)?,
    };
    report_outcome(&outcome, &args.output.out)
}

fn remote_outcome(payload: ImagePayload) -> GenerationOutcome {
    GenerationOutcome {
        payload,
        fallback_used: false,
        error: None,
        attempts: 1,
    }
}

fn run_video(args: VideoArgs) -> Result<i32> {
    let mut request = VideoRequest::new(args.prompt.clone(), args.model.clone().unwrap_or_default());
    request.negative_prompt = args.negative_prompt.clone();
    request.aspect_ratio = args.aspect_ratio.clone();
    request.image = args.image.as_deref().map(read_image).transpose()?;

    let events = event_sink(args.output.events.as_deref(), &args.output.out);
    let cancel = CancellationToken::new();
    let outcome = if let Some(server) = &args.output.server {
        let config = StudioConfig::from_env();
        let client = Arc::new(remote_client(server)?);
        if request.model.trim().is_empty() {
            request.model = config.video_model.clone();
        }
        let handle = client.start_video(&request)?;
        eprintln!("operation: {handle}");
        if args.no_wait {
            println!("{}", json!({ "name": handle.as_str() }));
            return Ok(0);
        }
        let mut poller = JobPoller::new(
            client,
            config.poll_interval,
            config.poll_max_attempts,
            Arc::new(ThreadSleeper),
            events,
        );
        poller.wait(&handle, &cancel)?
    } else {
        let engine = build_engine(events, None)?;
        let handle = engine.start_video(request)?;
        eprintln!("operation: {handle}");
        if args.no_wait {
            println!("{}", json!({ "name": handle.as_str() }));
            return Ok(0);
        }
        engine.wait_for_video(&handle, &cancel)?
    };

    match outcome {
        PollOutcome::Completed { uri, asset } => {
            write_output(&args.output.out, &asset.bytes)?;
            println!(
                "{}",
                json!({
                    "out": args.output.out.display().to_string(),
                    "uri": uri,
                    "size_bytes": asset.bytes.len(),
                    "content_type": asset.content_type,
                })
            );
            Ok(0)
        }
        PollOutcome::CompletedWithoutResult => {
            eprintln!("video job finished without a downloadable result");
            Ok(2)
        }
    }
}

fn run_operation(args: OperationArgs) -> Result<i32> {
    let handle = JobHandle::new(args.name.trim());
    let status = match &args.server {
        Some(server) => remote_client(server)?.job_status(&handle)?,
        None => {
            let engine = StudioEngine::new(
                StudioConfig::from_env(),
                Arc::new(genstudio_contracts::events::NullEventSink),
            )?;
            engine.operation_status(&handle)?
        }
    };
    println!("{}", serde_json::to_string(&status)?);
    Ok(if status.done { 0 } else { 3 })
}

fn run_download(args: DownloadArgs) -> Result<i32> {
    let asset = match &args.output.server {
        Some(server) => remote_client(server)?.download_asset(args.uri.trim())?,
        None => {
            let events = event_sink(args.output.events.as_deref(), &args.output.out);
            build_engine(events, None)?.download_asset(&args.uri)?
        }
    };
    write_output(&args.output.out, &asset.bytes)?;
    println!("{}", args.output.out.display());
    Ok(0)
}

fn run_compress(args: CompressArgs) -> Result<i32> {
    let events = event_sink(args.events.as_deref(), &args.out);
    let processor = UploadProcessor::new(&StudioConfig::from_env(), PreviewStore::new(), events);
    let name = args
        .input
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("image")
        .to_string();
    let processed = processor.process(&name, read_image(&args.input)?)?;
    write_output(&args.out, &processed.payload.bytes)?;
    println!(
        "{}",
        json!({
            "out": args.out.display().to_string(),
            "mime_type": processed.payload.mime_type,
            "size_bytes": processed.payload.len(),
            "was_compressed": processed.was_compressed,
            "compression_ratio": processed.compression_ratio,
        })
    );
    Ok(0)
}

fn run_serve(args: ServeArgs) -> Result<i32> {
    serve::init_tracing();
    let host: IpAddr = args
        .host
        .parse()
        .with_context(|| format!("invalid host '{}'", args.host))?;
    let addr = SocketAddr::new(host, args.port);

    // Built outside the runtime: the blocking HTTP client must not be
    // created or dropped on an async worker.
    let engine = Arc::new(StudioEngine::new(
        StudioConfig::from_env(),
        Arc::new(serve::TracingEventSink),
    )?);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(serve::serve(addr, engine.clone()));
    drop(runtime);
    drop(engine);
    result?;
    Ok(0)
}
