//! Offline rendering to WAV files.
//!
//! Pulls a session to its end as fast as it renders and writes the result as
//! 16-bit stereo, without touching an audio device.

use crate::synth::{FrameProducer, StreamStatus};
use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use std::time::Duration;

/// Frames rendered per chunk.
const RENDER_BUFFER_SIZE: usize = 4096;

/// Renders `producer` into a WAV file.
///
/// # Arguments
///
/// * `producer` - The session to render; consumed up to its end of stream
/// * `sample_rate` - Rate the producer renders at
/// * `output_path` - Path for the output WAV file
/// * `limit` - Stop after this much audio even if the content continues
/// * `progress_callback` - Optional callback for progress updates (0.0 to 1.0)
///
/// # Errors
///
/// Returns error if:
/// - The content has no end and no limit was given
/// - Output file cannot be created or written
/// - The session fails to read its content
pub fn export_to_wav<P, F>(
    producer: &mut dyn FrameProducer,
    sample_rate: u32,
    output_path: P,
    limit: Option<Duration>,
    mut progress_callback: Option<F>,
) -> Result<()>
where
    P: AsRef<Path>,
    F: FnMut(f32),
{
    let expected = match (limit, producer.duration()) {
        (Some(limit), Some(duration)) => limit.min(duration),
        (Some(limit), None) => limit,
        (None, Some(duration)) => duration,
        (None, None) => bail!("Content has no end; a render limit is required"),
    };
    let expected_frames = (expected.as_secs_f64() * sample_rate as f64).round() as usize;
    let max_frames = limit.map(|l| (l.as_secs_f64() * sample_rate as f64).round() as usize);

    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(output_path.as_ref(), spec).with_context(|| {
        format!(
            "Failed to create output WAV file: {}",
            output_path.as_ref().display()
        )
    })?;

    let mut left_buf = vec![0.0f32; RENDER_BUFFER_SIZE];
    let mut right_buf = vec![0.0f32; RENDER_BUFFER_SIZE];
    let mut written = 0usize;

    loop {
        let request = match max_frames {
            Some(max) if written >= max => break,
            Some(max) => (max - written).min(RENDER_BUFFER_SIZE),
            None => RENDER_BUFFER_SIZE,
        };

        let rendered = producer.render(&mut left_buf[..request], &mut right_buf[..request]);
        let frames = rendered.frames.min(request);

        // Write to WAV (interleaved stereo, 16-bit)
        for i in 0..frames {
            let left_sample = (left_buf[i] * 32767.0).clamp(-32768.0, 32767.0) as i16;
            let right_sample = (right_buf[i] * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(left_sample)?;
            writer.write_sample(right_sample)?;
        }
        written += frames;

        if let Some(ref mut callback) = progress_callback {
            let fraction = if expected_frames == 0 {
                1.0
            } else {
                (written as f32 / expected_frames as f32).min(1.0)
            };
            callback(fraction);
        }

        match rendered.status {
            StreamStatus::Active => {}
            StreamStatus::EndOfStream => break,
            StreamStatus::Underrun(e) => {
                return Err(e).context("Failed to read content during export");
            }
        }
    }

    writer.finalize().context("Failed to finalize WAV file")?;
    tracing::info!(
        path = %output_path.as_ref().display(),
        frames = written,
        "exported WAV"
    );

    Ok(())
}
