//! # Interop Player
//!
//! Headless playback host: opens a file, prints its stream descriptors and
//! pulls samples from both streams the way a media host would, always asking
//! next for the stream that is behind.

use std::time::Instant;

use anyhow::Result;
use serde::Serialize;

use interop_core::{MediaPipeline, NextSample, PipelineConfig, StreamKind};

struct PlayerOptions {
    input: String,
    samples: u64,
    seek_seconds: Option<f64>,
    probe: bool,
    verbose: bool,
    config: PipelineConfig,
}

#[derive(Debug, Default, Serialize)]
struct StreamStats {
    samples: u64,
    bytes: u64,
    keyframes: u64,
    discontinuities: u64,
    first_ms: Option<i64>,
    last_ms: Option<i64>,
    /// Samples whose timestamp went backwards.
    regressions: u64,
    end_of_stream: bool,
}

impl StreamStats {
    fn record(&mut self, timestamp_ms: i64, bytes: usize, keyframe: bool, discontinuous: bool) {
        if let Some(last) = self.last_ms {
            if timestamp_ms < last && !discontinuous {
                self.regressions += 1;
            }
        }
        self.samples += 1;
        self.bytes += bytes as u64;
        self.keyframes += u64::from(keyframe);
        self.discontinuities += u64::from(discontinuous);
        self.first_ms.get_or_insert(timestamp_ms);
        self.last_ms = Some(timestamp_ms);
    }

    fn wants_more(&self, limit: u64) -> bool {
        !self.end_of_stream && self.samples < limit
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let filter = if options.verbose {
        "interop=debug,interop_core=debug"
    } else {
        "interop=info,interop_core=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Interop Player v{}", interop_core::VERSION);

    let pipeline = MediaPipeline::open_uri(&options.input, &options.config)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", options.input, e))?;

    if options.probe {
        println!("{}", serde_json::to_string_pretty(pipeline.descriptor())?);
        return Ok(());
    }

    if let Some(seconds) = options.seek_seconds {
        let target = (seconds * 10_000_000.0) as i64;
        match pipeline.seek(target) {
            Some(position) => tracing::info!("Seeked to {:.3}s", position as f64 / 1e7),
            None => tracing::warn!("Seek to {:.3}s not available", seconds),
        }
    }

    let started = Instant::now();
    let (audio, video) = pull_samples(&pipeline, options.samples);
    let elapsed = started.elapsed();

    for (kind, stats) in [(StreamKind::Audio, &audio), (StreamKind::Video, &video)] {
        if stats.samples > 0 || stats.end_of_stream {
            tracing::info!("{} stats: {}", kind, serde_json::to_string(stats)?);
        }
        if stats.regressions > 0 {
            tracing::warn!("{} timestamps went backwards {} time(s)", kind, stats.regressions);
        }
    }
    tracing::info!(
        "Pulled {} samples in {:.1} ms",
        audio.samples + video.samples,
        elapsed.as_secs_f64() * 1000.0
    );

    pipeline.close();
    Ok(())
}

/// Pull until both streams reach the limit, end of stream, or stop
/// producing. The stream with the earlier last timestamp goes first.
fn pull_samples(pipeline: &MediaPipeline, limit: u64) -> (StreamStats, StreamStats) {
    let descriptor = pipeline.descriptor();
    let mut audio = StreamStats {
        end_of_stream: descriptor.audio.is_none(),
        ..Default::default()
    };
    let mut video = StreamStats {
        end_of_stream: descriptor.video.is_none(),
        ..Default::default()
    };

    loop {
        let kind = match (audio.wants_more(limit), video.wants_more(limit)) {
            (false, false) => break,
            (true, false) => StreamKind::Audio,
            (false, true) => StreamKind::Video,
            (true, true) => {
                if audio.last_ms.unwrap_or(i64::MIN) <= video.last_ms.unwrap_or(i64::MIN) {
                    StreamKind::Audio
                } else {
                    StreamKind::Video
                }
            }
        };
        let stats = match kind {
            StreamKind::Audio => &mut audio,
            StreamKind::Video => &mut video,
        };

        match pipeline.get_next_sample(kind) {
            NextSample::Ready(sample) => {
                tracing::debug!(
                    "{} {:>8} ms  {:>7} bytes{}{}",
                    kind,
                    sample.timestamp_ms(),
                    sample.data.len(),
                    if sample.keyframe { "  key" } else { "" },
                    if sample.discontinuous { "  discontinuity" } else { "" }
                );
                stats.record(
                    sample.timestamp_ms(),
                    sample.data.len(),
                    sample.keyframe,
                    sample.discontinuous,
                );
            }
            NextSample::EndOfStream => {
                tracing::info!("{} reached end of stream", kind);
                stats.end_of_stream = true;
            }
            NextSample::Unavailable => {
                if pipeline.is_faulted() {
                    tracing::error!("Pipeline faulted, stopping");
                    break;
                }
                tracing::warn!("No {} sample available, giving up on this stream", kind);
                stats.end_of_stream = true;
            }
        }
    }

    (audio, video)
}

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut input: Option<String> = None;
    let mut samples: u64 = 100;
    let mut seek_seconds = None;
    let mut probe = false;
    let mut verbose = false;
    let mut config_path: Option<String> = None;
    let mut overrides: Vec<(String, String)> = Vec::new();
    let mut force_audio = false;
    let mut force_video = false;

    let mut i = 1;
    while i < args.len() {
        let value = || {
            args.get(i + 1)
                .ok_or_else(|| anyhow::anyhow!("Missing value for {}", args[i]))
        };
        match args[i].as_str() {
            "--input" | "-i" => {
                input = Some(value()?.clone());
                i += 2;
            }
            "--samples" | "-n" => {
                let v = value()?;
                samples = v
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("Invalid sample count {}: {}", v, e))?;
                i += 2;
            }
            "--seek" => {
                let v = value()?;
                let seconds = v
                    .parse::<f64>()
                    .map_err(|e| anyhow::anyhow!("Invalid seek position {}: {}", v, e))?;
                seek_seconds = Some(seconds);
                i += 2;
            }
            "--config" => {
                config_path = Some(value()?.clone());
                i += 2;
            }
            "--option" | "-o" => {
                let v = value()?;
                let (key, val) = v
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("Expected KEY=VALUE, got {}", v))?;
                overrides.push((key.to_string(), val.to_string()));
                i += 2;
            }
            "--probe" => {
                probe = true;
                i += 1;
            }
            "--force-audio-decode" => {
                force_audio = true;
                i += 1;
            }
            "--force-video-decode" => {
                force_video = true;
                i += 1;
            }
            "--verbose" | "-v" => {
                verbose = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if input.is_none() && !other.starts_with('-') => {
                input = Some(other.to_string());
                i += 1;
            }
            other => {
                return Err(anyhow::anyhow!("Unknown argument: {}", other));
            }
        }
    }

    let input = input.ok_or_else(|| {
        print_usage();
        anyhow::anyhow!("Missing required --input")
    })?;

    let mut config = match config_path {
        Some(path) => PipelineConfig::from_json_file(&path)
            .map_err(|e| anyhow::anyhow!("{}", e))?,
        None => PipelineConfig::default(),
    };
    for (key, val) in overrides {
        config.set_option(key, val);
    }
    config.force_audio_decode |= force_audio;
    config.force_video_decode |= force_video;

    Ok(PlayerOptions {
        input,
        samples,
        seek_seconds,
        probe,
        verbose,
        config,
    })
}

fn print_usage() {
    eprintln!(
        "Usage: interop --input <path|file-uri> [options]\n\
         \n\
         Options:\n\
         \x20 -n, --samples N          samples to pull per stream (default 100)\n\
         \x20     --seek SECONDS       seek before pulling\n\
         \x20     --probe              print stream descriptors as JSON and exit\n\
         \x20     --config FILE        JSON pipeline configuration\n\
         \x20 -o, --option KEY=VALUE   container option (format, probesize, genpts)\n\
         \x20     --force-audio-decode decode audio to PCM\n\
         \x20     --force-video-decode decode video to NV12\n\
         \x20 -v, --verbose            debug logging"
    );
}
