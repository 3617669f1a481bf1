use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;

use frameline::buffer::{BufferPool, registry};
use frameline::line::ProductionLine;
use frameline::worker::{WorkerConfig, WorkerType};

/// Exercise the frame pipeline against a real source:
/// raw files (mmap or batched reads), encoded files, RTSP streams, or the
/// built-in synthetic source when no media is at hand.
#[derive(Parser, Debug)]
#[command(name = "frameline")]
#[command(about = "🎞  Drive the zero-copy frame pipeline against a video source")]
struct Args {
    /// Test mode to run (see --list-tests)
    #[arg(short = 'm', long = "mode", value_name = "TEST", default_value = "raw_loop")]
    mode: String,

    /// Source path or URL (raw file, container file, rtsp://…, synthetic:…)
    path: Option<String>,

    /// List available test modes and exit
    #[arg(long)]
    list_tests: bool,

    /// Load the worker configuration from a JSON file instead of flags
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Producer thread count
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Wrap around at the end of the source
    #[arg(long = "loop-playback")]
    loop_playback: bool,

    /// Enable the performance monitor
    #[arg(long)]
    monitor: bool,

    /// Buffers in the working pool (ingest depth for streaming workers)
    #[arg(long, default_value_t = 4)]
    buffers: usize,

    /// Frames to consume before stopping (0 = until the source ends)
    #[arg(long, default_value_t = 120)]
    frames: u64,

    /// Raw source width in pixels
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Raw source height in pixels
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Raw source bits per pixel
    #[arg(long, default_value_t = 32)]
    bpp: u32,
}

struct TestMode {
    name: &'static str,
    description: &'static str,
    run: fn(&Args, WorkerConfig) -> Result<()>,
}

const TEST_MODES: &[TestMode] = &[
    TestMode {
        name: "raw_loop",
        description: "mmap raw file, looped playback, verify steady consumption",
        run: run_raw_loop,
    },
    TestMode {
        name: "raw_sequential",
        description: "mmap raw file, single pass from first to last frame",
        run: run_raw_sequential,
    },
    TestMode {
        name: "producer",
        description: "multi-threaded producers over one pool",
        run: run_producer,
    },
    TestMode {
        name: "async_raw",
        description: "raw file through the batched-read worker",
        run: run_async_raw,
    },
    TestMode {
        name: "decode",
        description: "encoded file (or synthetic source) through the decode worker",
        run: run_decode,
    },
    TestMode {
        name: "rtsp",
        description: "live stream ingest with a deliberately slow consumer",
        run: run_rtsp,
    },
    TestMode {
        name: "pool_stress",
        description: "hammer one pool from producer and consumer threads",
        run: run_pool_stress,
    },
];

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.list_tests {
        println!("Available test modes:");
        for mode in TEST_MODES {
            println!("  {:<16} {}", mode.name, mode.description);
        }
        return Ok(());
    }

    let mode = TEST_MODES
        .iter()
        .find(|m| m.name == args.mode)
        .with_context(|| {
            format!(
                "unknown test mode '{}'; run with --list-tests to see the choices",
                args.mode
            )
        })?;

    let config = build_config(&args)?;
    println!("mode: {}  source: {}", mode.name, config.file.path);
    (mode.run)(&args, config)
}

fn build_config(args: &Args) -> Result<WorkerConfig> {
    if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file '{}'", path.display()))?;
        let config: WorkerConfig =
            serde_json::from_str(&text).context("parse worker config JSON")?;
        return Ok(config);
    }
    let Some(path) = &args.path else {
        bail!("a source path is required (or use --config)");
    };
    let mut config = WorkerConfig::raw_file(path, args.width, args.height, args.bpp);
    config.pool.buffer_count = args.buffers;
    Ok(config)
}

/// Shared consume loop: drain the line's pool until `frames` frames were
/// seen (0 = until acquires dry up), pausing `dwell` per frame like a
/// display would.
fn consume(
    line: &ProductionLine,
    pool: &Arc<BufferPool>,
    frames: u64,
    dwell: Duration,
) -> Result<u64> {
    let mut consumed = 0u64;
    let mut dry_spells = 0u32;
    let started = Instant::now();
    while frames == 0 || consumed < frames {
        match pool.acquire_filled(true, Some(Duration::from_millis(100))) {
            Ok(buffer) => {
                dry_spells = 0;
                if !dwell.is_zero() {
                    std::thread::sleep(dwell);
                }
                pool.release_filled(&buffer)?;
                consumed += 1;
            }
            Err(_) => {
                dry_spells += 1;
                // A second of silence on a bounded source means it ended.
                if dry_spells >= 10 {
                    break;
                }
            }
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "consumed {consumed} frames in {elapsed:.2}s ({:.1} fps), produced {} skipped {}",
        consumed as f64 / elapsed.max(f64::EPSILON),
        line.produced_frames(),
        line.skipped_frames(),
    );
    Ok(consumed)
}

fn start_line(args: &Args, config: &WorkerConfig, looping: bool) -> Result<(ProductionLine, Arc<BufferPool>)> {
    let mut line = ProductionLine::new(looping, args.threads, args.monitor);
    line.set_error_callback(Box::new(|message| eprintln!("⚠ {message}")));
    line.start(config)?;
    let pool = registry()
        .get_pool(line.working_pool_id())
        .upgrade()
        .context("working pool vanished right after start")?;
    Ok((line, pool))
}

fn run_raw_loop(args: &Args, mut config: WorkerConfig) -> Result<()> {
    config.worker_type = WorkerType::MmapRaw;
    let (mut line, pool) = start_line(args, &config, true)?;
    let target = if args.frames == 0 { 120 } else { args.frames };
    consume(&line, &pool, target, Duration::ZERO)?;
    line.stop();
    line.print_stats();
    Ok(())
}

fn run_raw_sequential(args: &Args, mut config: WorkerConfig) -> Result<()> {
    config.worker_type = WorkerType::MmapRaw;
    let (mut line, pool) = start_line(args, &config, false)?;
    let consumed = consume(&line, &pool, 0, Duration::ZERO)?;
    line.stop();
    println!("single pass complete: {consumed} frames");
    Ok(())
}

fn run_producer(args: &Args, mut config: WorkerConfig) -> Result<()> {
    config.worker_type = WorkerType::MmapRaw;
    let mut args_multi = clone_args(args);
    args_multi.threads = args.threads.max(2);
    let (mut line, pool) = start_line(&args_multi, &config, true)?;
    let target = if args.frames == 0 { 240 } else { args.frames };
    consume(&line, &pool, target, Duration::ZERO)?;
    line.stop();
    line.print_stats();
    Ok(())
}

fn run_async_raw(args: &Args, mut config: WorkerConfig) -> Result<()> {
    config.worker_type = WorkerType::AsyncRaw;
    let (mut line, pool) = start_line(args, &config, args.loop_playback)?;
    consume(&line, &pool, args.frames, Duration::ZERO)?;
    line.stop();
    Ok(())
}

fn run_decode(args: &Args, mut config: WorkerConfig) -> Result<()> {
    config.worker_type = WorkerType::DecodeFile;
    // Geometry for the decode path comes from the stream; keep the raw
    // defaults only for the synthetic source, which needs explicit size.
    let (mut line, pool) = start_line(args, &config, args.loop_playback)?;
    consume(&line, &pool, args.frames, Duration::ZERO)?;
    line.stop();
    Ok(())
}

fn run_rtsp(args: &Args, mut config: WorkerConfig) -> Result<()> {
    config.worker_type = WorkerType::Rtsp;
    let (mut line, pool) = start_line(args, &config, false)?;
    // A display consumer dwells on every frame; backpressure must hold.
    let frames = if args.frames == 0 { 100 } else { args.frames };
    consume(&line, &pool, frames, Duration::from_millis(10))?;
    println!(
        "filled backlog at stop: {} (soft-limited), skipped: {}",
        pool.filled_count(),
        line.skipped_frames()
    );
    line.stop();
    Ok(())
}

fn run_pool_stress(args: &Args, mut config: WorkerConfig) -> Result<()> {
    config.worker_type = WorkerType::MmapRaw;
    let mut args_stress = clone_args(args);
    args_stress.threads = args.threads.max(4);
    let (mut line, pool) = start_line(&args_stress, &config, true)?;

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let per_consumer = (if args.frames == 0 { 500 } else { args.frames }) / 2;
            std::thread::spawn(move || {
                let mut consumed = 0u64;
                while consumed < per_consumer {
                    if let Ok(buffer) = pool.acquire_filled(true, Some(Duration::from_millis(100)))
                    {
                        pool.release_filled(&buffer).ok();
                        consumed += 1;
                    }
                }
                consumed
            })
        })
        .collect();

    let mut total = 0u64;
    for consumer in consumers {
        total += consumer.join().unwrap_or(0);
    }
    line.stop();
    println!(
        "stress done: {} frames consumed across consumers, produced {}, skipped {}",
        total,
        line.produced_frames(),
        line.skipped_frames()
    );
    Ok(())
}

fn clone_args(args: &Args) -> Args {
    Args {
        mode: args.mode.clone(),
        path: args.path.clone(),
        list_tests: args.list_tests,
        config: args.config.clone(),
        threads: args.threads,
        loop_playback: args.loop_playback,
        monitor: args.monitor,
        buffers: args.buffers,
        frames: args.frames,
        width: args.width,
        height: args.height,
        bpp: args.bpp,
    }
}
