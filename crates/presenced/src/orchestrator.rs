//! The frame loop: capture, recognize, publish, annotate, render.

use crate::preview::FrameSink;
use presence_core::{FaceAnalyzer, RecognitionEngine};
use presence_hw::CaptureSource;
use presence_mqtt::{Publisher, QoS};
use std::sync::atomic::{AtomicBool, Ordering};

const BOX_THICKNESS: i32 = 2;
/// Caption baseline offset above the box; the font is 7 pixels tall.
const CAPTION_OFFSET: i32 = 10;

/// How presence payloads are published.
#[derive(Debug, Clone, Copy)]
pub struct PublishSettings {
    pub qos: QoS,
    pub retain: bool,
}

/// Counters reported when the loop ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub frames: u64,
    pub faces: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub skipped_frames: u64,
}

/// Run until `stop` is raised or the capture source fails.
///
/// Every frame is read, processed, published and rendered before the next
/// one is read. The capture source is consumed and released before this
/// returns, so the caller only has the publish channel left to close.
pub fn run<S, A, P, K>(
    capture: S,
    engine: &mut RecognitionEngine<A>,
    publisher: &P,
    sink: &mut K,
    settings: PublishSettings,
    stop: &AtomicBool,
) -> LoopStats
where
    S: CaptureSource,
    A: FaceAnalyzer,
    P: Publisher + ?Sized,
    K: FrameSink + ?Sized,
{
    let mut capture = capture;
    let mut stats = LoopStats::default();
    tracing::info!(threshold = engine.threshold(), "frame loop started");

    while !stop.load(Ordering::SeqCst) {
        let mut frame = match capture.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed; leaving loop");
                break;
            }
        };
        stats.frames += 1;

        let results = match engine.process_frame(&frame.data, frame.width, frame.height) {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "analysis failed; frame skipped");
                stats.skipped_frames += 1;
                continue;
            }
        };
        stats.faces += results.len() as u64;

        for result in &results {
            match publisher.publish(result.payload(), settings.qos, settings.retain) {
                Ok(()) => stats.published += 1,
                Err(e) => {
                    tracing::warn!(error = %e, payload = result.payload(), "publish skipped");
                    stats.publish_failures += 1;
                }
            }
            tracing::debug!(
                sequence = frame.sequence,
                label = result.label(),
                similarity = result.similarity,
                "face"
            );

            let b = result.bbox;
            frame.draw_box(b.x1, b.y1, b.x2, b.y2, result.color(), BOX_THICKNESS);
            frame.draw_text(b.x1, b.y1 - CAPTION_OFFSET, &result.caption(), result.color(), 1);
        }

        if let Err(e) = sink.render(&frame, &results) {
            tracing::warn!(error = %e, "render failed");
        }
    }

    drop(capture);
    tracing::info!(
        frames = stats.frames,
        published = stats.published,
        publish_failures = stats.publish_failures,
        "frame loop stopped; capture released"
    );
    stats
}
