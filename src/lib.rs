//! Embedded H.264 playback engine.
//!
//! Top-level wiring of the pipeline: decode a media source with FFmpeg
//! (C4) into a per-stream frame pool (C2) drained by a pinned worker
//! thread (C5), upload and keystone-correct it on an EGL/GLES context
//! (C7), and present it straight to a DRM/KMS scan-out surface (C8) —
//! no compositor, no windowing system. [`Engine::new`] wires C1–C11
//! together; [`Engine::run`] hands control to the render loop (C6)
//! until it quits, finishes, or every stream breaks.

pub mod config;
pub mod core_affinity;
pub mod decode;
pub mod display;
pub mod error;
pub mod gpu;
pub mod input;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod render;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};

pub use config::{EngineConfig, LogLevel, OverlayHook, StartupConfig};
pub use error::EngineError;
pub use gpu::keystone::Corners;
pub use input::{InputEvent, InputSource, NoInput};
pub use metrics::{EngineMetrics, Metrics};

use decode::worker::{Worker, WorkerResult};
use display::DisplaySurface;
use gpu::GpuContext;
use pool::Pool;
use render::{RenderLoop, StreamHandle};

/// Frame slots kept per stream. §9's open question leaves this at
/// implementer discretion between 2 and 3; 3 gives the render loop one
/// extra slot of play against an occasional slow decode without forcing
/// a repeat. See DESIGN.md.
const POOL_SLOTS: usize = 3;

pub struct Engine {
    render: RenderLoop,
    lifecycle: lifecycle::Lifecycle,
    metrics: Arc<Metrics>,
}

impl Engine {
    /// Validate `config`, acquire the display and GPU context, open
    /// every source, and spawn their decode workers. Returns once every
    /// stream has produced (or failed to produce) its first frame within
    /// `decode_timeout_ms`.
    pub fn new(config: StartupConfig, input: Box<dyn InputSource>) -> Result<Self, EngineError> {
        let config = EngineConfig::load(config)?;
        config::init_logging(config.log_level);

        let display = open_any_display()?;
        let display = Arc::new(Mutex::new(display));

        let gpu = {
            let surface = display.lock().unwrap();
            GpuContext::new(surface.native_display(), surface.native_window())
                .map_err(EngineError::Display)?
        };

        let metrics = Arc::new(Metrics::new(config.sources.len()));
        let mut handles = Vec::with_capacity(config.sources.len());

        for (index, source) in config.sources.iter().enumerate() {
            let handle = open_stream(index, source, &config, &gpu, &metrics)?;
            handles.push(handle);
        }

        let lifecycle = lifecycle::Lifecycle::install(Arc::clone(&display))
            .map_err(|e| EngineError::Resource(format!("signal handler install failed: {e}")))?;

        let render = RenderLoop::new(
            gpu,
            display,
            handles,
            metrics.clone(),
            config.overlay_hook,
            input,
            lifecycle.quit_flag(),
        );

        Ok(Self {
            render,
            lifecycle,
            metrics,
        })
    }

    /// Run until quit, clean finish, or `EngineError::AllStreamsBroken`;
    /// tears every module down in the documented order regardless of
    /// which way `run` ends.
    pub fn run(mut self) -> Result<(), EngineError> {
        let result = self.render.run();
        let (gpu, display, handles) = self.render.into_parts();

        let mut workers = Vec::with_capacity(handles.len());
        let mut pools = Vec::with_capacity(handles.len());
        for handle in handles {
            workers.push(handle.worker);
            pools.push(handle.pool);
        }
        lifecycle::ordered_teardown(workers, pools, gpu, display);
        drop(self.lifecycle);

        result
    }

    /// Request a clean shutdown, as if SIGINT/SIGTERM had been received.
    pub fn request_quit(&self) {
        self.lifecycle.request_quit();
    }

    /// A thread-safe handle an external launcher can poll — from any
    /// thread, independent of this engine's own lifetime inside
    /// [`Engine::run`] — for an on-screen stats overlay. Call before
    /// `run`, which consumes `self` for the duration of playback.
    pub fn metrics_handle(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }
}

/// Enumerate `/dev/dri/card0`.. up to a reasonable bound, acquiring the
/// first one with a connected connector. No path is hard-coded beyond
/// the standard device directory (§6).
fn open_any_display() -> Result<DisplaySurface, EngineError> {
    const MAX_CARDS: u32 = 16;
    let mut last_error = None;

    for index in 0..MAX_CARDS {
        let path = format!("/dev/dri/card{index}");
        if !Path::new(&path).exists() {
            continue;
        }
        match DisplaySurface::open(&path) {
            Ok(surface) => return Ok(surface),
            Err(e) => {
                warn!("skipping {path}: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(EngineError::Display(last_error.unwrap_or_else(|| {
        anyhow::anyhow!("no /dev/dri/card* device found")
    })))
}

fn open_stream(
    index: usize,
    source: &str,
    config: &EngineConfig,
    gpu: &GpuContext,
    metrics: &Arc<Metrics>,
) -> Result<StreamHandle, EngineError> {
    // All `OpenError` variants are start-up failures, not run-time decode
    // failures: the source was never readable, never had a usable video
    // track, or used a codec this build can't decode. None of that is
    // fixable by retrying, so it's a configuration problem, not a fatal
    // decode error.
    let decoder = decode::open(source, config.prefer_hardware, config.max_decode_attempts)
        .map_err(|e| EngineError::Configuration(format!("stream {index}: {e}")))?;

    let (width, height) = decoder.dimensions();
    if width > config.max_video_width || height > config.max_video_height {
        return Err(EngineError::Resource(format!(
            "stream {index}: {width}x{height} exceeds the configured {}x{} limit",
            config.max_video_width, config.max_video_height
        )));
    }

    let (alloc_luma, alloc_chroma) = (
        pool::padded_dims(width, height),
        pool::padded_dims(width / 2, height / 2),
    );
    let bytes_per_slot = alloc_luma.0 as f64 * alloc_luma.1 as f64
        + 2.0 * alloc_chroma.0 as f64 * alloc_chroma.1 as f64;
    let estimated_mb = (bytes_per_slot * POOL_SLOTS as f64) / (1024.0 * 1024.0);
    if estimated_mb > config.memory_limit_mb as f64 {
        return Err(EngineError::Resource(format!(
            "stream {index}: pool would need ~{estimated_mb:.0} MB, over the {} MB limit",
            config.memory_limit_mb
        )));
    }

    let pool = Arc::new(Pool::new(width, height, POOL_SLOTS));
    let textures = gpu
        .create_stream_textures(alloc_luma, alloc_chroma)
        .map_err(EngineError::Display)?;

    info!("stream {index}: opened {source} ({width}x{height}), pool sized for ~{estimated_mb:.1} MB");

    let worker = Worker::spawn(index, Box::new(decoder), Arc::clone(&pool));
    let open_started = std::time::Instant::now();
    worker.request_next();
    match worker.wait_ready_timeout(Duration::from_millis(config.decode_timeout_ms)) {
        Some(WorkerResult::Frame(_)) => {
            metrics.stream(index).record_decode(open_started.elapsed());
        }
        Some(WorkerResult::Terminal(outcome)) => {
            return Err(EngineError::DecodeFatal {
                index,
                source: anyhow::anyhow!("stream ended before a first frame: {outcome:?}"),
            })
        }
        None => {
            return Err(EngineError::DecodeFatal {
                index,
                source: anyhow::anyhow!(
                    "no frame decoded within {} ms",
                    config.decode_timeout_ms
                ),
            })
        }
    }

    Ok(StreamHandle {
        worker,
        pool,
        textures,
        keystone: config.keystone_initial,
    })
}
