use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use presence_core::actuator::{self, LedState};
use presence_core::{
    get_reference_embedding, resolve_reference_dir, FaceAnalyzer, OnnxFaceAnalyzer, DEFAULT_CACHE_FILENAME,
};
use presence_hw::{Camera, CaptureSource};
use presence_mqtt::PublishChannel;
use presenced::BrokerConfig;
use rumqttc::{AsyncClient, Event, Packet};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "presence", about = "Presence detection CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or load the reference embedding
    Reference {
        /// Directory of reference photos
        #[arg(short, long, env = "PRESENCE_REFERENCE_DIR")]
        dir: PathBuf,
        /// Delete the cached embedding and build it again
        #[arg(long)]
        rebuild: bool,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long, env = "PRESENCE_MODEL_DIR")]
        model_dir: Option<PathBuf>,
        /// Cache file name inside the reference directory
        #[arg(long, env = "PRESENCE_CACHE_FILENAME", default_value = DEFAULT_CACHE_FILENAME)]
        cache: String,
        /// ONNX Runtime intra-op threads per session
        #[arg(long, env = "PRESENCE_INTRA_THREADS", default_value_t = 2)]
        threads: usize,
        #[arg(long)]
        json: bool,
    },
    /// Publish one payload to the configured topic
    Publish {
        /// Presence payload: "1" (present) or "0" (absent)
        #[arg(value_parser = [actuator::PAYLOAD_PRESENT, actuator::PAYLOAD_ABSENT])]
        payload: String,
    },
    /// Follow the topic and show what an LED actuator would do
    Listen,
    /// List V4L2 capture devices
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// Run camera diagnostics
    Test {
        /// Number of frames to capture
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
        #[arg(short, long, env = "PRESENCE_CAMERA_DEVICE", default_value = "/dev/video0")]
        device: String,
        #[arg(long, env = "PRESENCE_MODEL_DIR")]
        model_dir: Option<PathBuf>,
        #[arg(long, env = "PRESENCE_FRAME_WIDTH", default_value_t = 640)]
        width: u32,
        #[arg(long, env = "PRESENCE_FRAME_HEIGHT", default_value_t = 480)]
        height: u32,
        /// ONNX Runtime intra-op threads per session
        #[arg(long, env = "PRESENCE_INTRA_THREADS", default_value_t = 2)]
        threads: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Before parsing, so `env` defaults see values from .env.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Reference {
            dir,
            rebuild,
            model_dir,
            cache,
            threads,
            json,
        } => reference(dir, rebuild, model_dir, &cache, threads, json),
        Commands::Publish { payload } => publish(&payload).await,
        Commands::Listen => listen().await,
        Commands::Devices { json } => {
            devices(json);
            Ok(())
        }
        Commands::Test {
            frames,
            device,
            model_dir,
            width,
            height,
            threads,
        } => test_camera(&device, frames, (width, height), model_dir, threads),
    }
}

fn load_analyzer(model_dir: Option<PathBuf>, threads: usize) -> Result<OnnxFaceAnalyzer> {
    let model_dir = model_dir.unwrap_or_else(presence_core::default_model_dir);
    OnnxFaceAnalyzer::load(&model_dir, threads.max(1))
        .with_context(|| format!("failed to load models from {}", model_dir.display()))
}

fn reference(
    dir: PathBuf,
    rebuild: bool,
    model_dir: Option<PathBuf>,
    cache: &str,
    threads: usize,
    json: bool,
) -> Result<()> {
    let dir = resolve_reference_dir(dir)?;
    let cache_path = dir.join(cache);

    if rebuild && cache_path.exists() {
        std::fs::remove_file(&cache_path)
            .with_context(|| format!("failed to delete {}", cache_path.display()))?;
        println!("Deleted cached embedding {}", cache_path.display());
    }

    let mut analyzer = load_analyzer(model_dir, threads)?;
    let reference = get_reference_embedding(&mut analyzer, &dir, cache)?;

    if json {
        let out = serde_json::json!({
            "dim": reference.dim(),
            "cache": cache_path,
            "model_version": reference.embedding().model_version,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Reference embedding: {} dimensions", reference.dim());
        println!("Cache: {}", cache_path.display());
    }
    Ok(())
}

async fn publish(payload: &str) -> Result<()> {
    let broker = BrokerConfig::from_env().context("invalid broker configuration")?;
    let channel = PublishChannel::new(broker.connection.clone(), broker.topic.clone())?;
    channel.connect().await?;

    let sent = channel.publish(payload, broker.qos, broker.retain);
    // Give the event loop a moment to flush before disconnecting.
    tokio::time::sleep(Duration::from_millis(200)).await;
    channel.close().await;

    sent?;
    println!("Published {payload:?} to {}", broker.topic);
    Ok(())
}

async fn listen() -> Result<()> {
    let broker = BrokerConfig::from_env().context("invalid broker configuration")?;
    let mut params = broker.connection.clone();
    params.client_id = format!("{}-listen", params.client_id);

    let ca = match (&params.ca_cert, params.use_tls) {
        (Some(path), true) => Some(
            std::fs::read(path).with_context(|| format!("failed to read CA certificate {}", path.display()))?,
        ),
        _ => None,
    };

    let (client, mut eventloop) = AsyncClient::new(params.mqtt_options(ca.as_deref()), 10);
    let mut led = LedState::default();
    println!("Listening on {} (Ctrl-C to stop)", broker.topic);

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                // Sessions are clean, so subscribe again after every (re)connect.
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    client
                        .try_subscribe(broker.topic.as_str(), broker.qos)
                        .context("subscribe failed")?;
                    tracing::info!(topic = %broker.topic, "subscribed");
                }
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    let command = actuator::interpret(&msg.payload);
                    let changed = led.apply(command);
                    tracing::debug!(payload = ?msg.payload, ?command, "message");
                    if changed {
                        println!("LED {}", if led.on { "ON" } else { "OFF" });
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "connection error; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.try_disconnect().ok();
    Ok(())
}

fn devices(json: bool) {
    let devices = Camera::list_devices();

    if json {
        let out: Vec<_> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "path": d.path,
                    "name": d.name,
                    "driver": d.driver,
                    "bus": d.bus,
                })
            })
            .collect();
        println!("{}", serde_json::Value::Array(out));
        return;
    }

    if devices.is_empty() {
        println!("No video capture devices found");
        return;
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

fn test_camera(
    device: &str,
    frames: usize,
    (width, height): (u32, u32),
    model_dir: Option<PathBuf>,
    threads: usize,
) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let mut camera = Camera::open(device, width, height)?;
    println!("Opened {}x{} ({:?})", camera.width, camera.height, camera.fourcc);

    let mut analyzer = match load_analyzer(model_dir, threads) {
        Ok(analyzer) => Some(analyzer),
        Err(e) => {
            println!("Face detection unavailable: {e:#}");
            None
        }
    };

    for _ in 0..frames {
        let frame = camera.read_frame()?;
        let faces = match analyzer.as_mut() {
            Some(a) => match a.analyze(&frame.data, frame.width, frame.height) {
                Ok(detections) => detections.len().to_string(),
                Err(e) => format!("error: {e}"),
            },
            None => "-".to_string(),
        };
        println!(
            "frame {:>4}  brightness {:6.1}{}  faces {}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark(0.95) { " (dark)" } else { "" },
            faces
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_publish_accepts_only_presence_payloads() {
        for payload in ["1", "0"] {
            let cli = Cli::try_parse_from(["presence", "publish", payload]).unwrap();
            assert!(matches!(cli.command, Commands::Publish { payload: p } if p == payload));
        }
        for payload in ["toggle", "on", "10", ""] {
            assert!(Cli::try_parse_from(["presence", "publish", payload]).is_err(), "{payload:?}");
        }
    }

    #[test]
    fn test_camera_resolution_and_threads_flags() {
        let cli = Cli::try_parse_from([
            "presence", "test", "--width", "1280", "--height", "720", "--threads", "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Test { width, height, threads, .. } => {
                assert_eq!((width, height, threads), (1280, 720, 4));
            }
            _ => panic!("expected test subcommand"),
        }

        let cli = Cli::try_parse_from(["presence", "reference", "--dir", "/tmp/ref", "--threads", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Reference { threads: 3, .. }));
    }
}
