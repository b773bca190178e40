use anyhow::{Context, Result};
use presence_core::{get_reference_embedding, resolve_reference_dir, OnnxFaceAnalyzer, RecognitionEngine};
use presence_hw::Camera;
use presence_mqtt::PublishChannel;
use presenced::{orchestrator, Config, FrameSink, NoopSink, PreviewWriter, PublishSettings};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env().context("invalid configuration")?;
    tracing::debug!(?config, "configuration loaded");

    let reference_dir = resolve_reference_dir(&config.reference_dir)?;

    let mut analyzer = OnnxFaceAnalyzer::load(&config.model_dir, config.intra_threads)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    tracing::info!(dir = %config.model_dir.display(), "face analyzer loaded");

    let reference = get_reference_embedding(&mut analyzer, &reference_dir, &config.cache_filename)
        .context("no usable reference embedding")?;
    tracing::info!(dim = reference.dim(), "reference embedding ready");

    let preview: Box<dyn FrameSink + Send> = match &config.preview_path {
        Some(path) => Box::new(PreviewWriter::new(path.clone())?),
        None => Box::new(NoopSink),
    };

    let channel = Arc::new(PublishChannel::new(config.broker.connection.clone(), config.broker.topic.clone())?);
    channel
        .connect()
        .await
        .with_context(|| format!("broker {}:{} unreachable", config.broker.connection.host, config.broker.connection.port))?;

    let camera = match Camera::open(&config.camera_device, config.frame_width, config.frame_height) {
        Ok(camera) => camera,
        Err(e) => {
            channel.close().await;
            return Err(e).with_context(|| format!("failed to open camera {}", config.camera_device));
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; stopping after the current frame");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let settings = PublishSettings {
        qos: config.broker.qos,
        retain: config.broker.retain,
    };
    let mut engine = RecognitionEngine::new(analyzer, reference, config.similarity_threshold);
    let publisher = channel.clone();
    let mut preview = preview;
    tracing::info!(topic = %config.broker.topic, device = %config.camera_device, "presenced ready");

    // Inference blocks, so the frame loop gets its own thread.
    let frame_loop = tokio::task::spawn_blocking(move || {
        orchestrator::run(camera, &mut engine, &*publisher, preview.as_mut(), settings, &stop)
    });
    let outcome = frame_loop.await;

    channel.close().await;
    let stats = outcome.context("frame loop panicked")?;
    tracing::info!(
        frames = stats.frames,
        faces = stats.faces,
        published = stats.published,
        "presenced stopped"
    );

    Ok(())
}
