//! Render loop (C6).
//!
//! Runs on its own, unpinned thread (decode workers hold the pinned
//! cores). Every iteration is non-blocking towards the decode workers —
//! frames are picked up straight from each stream's pool, never by
//! waiting on the worker — so the only blocking point in the whole loop
//! is `present`, which gates on VSync.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::OverlayHook;
use crate::decode::worker::Worker;
use crate::display::DisplaySurface;
use crate::error::{DecodeOutcome, EngineError};
use crate::gpu::keystone::Corners;
use crate::gpu::{GpuContext, StreamTextures};
use crate::input::{InputEvent, InputSource};
use crate::metrics::Metrics;
use crate::pool::Pool;

/// Degrees... rather, NDC units a single input nudge moves a corner by.
const NUDGE_STEP: f32 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamStatus {
    Active,
    Finished,
    Broken,
}

/// Everything the render loop owns for one video stream, assembled by
/// the engine once the decoder, worker, and pool are constructed.
pub struct StreamHandle {
    pub worker: Worker,
    pub pool: Arc<Pool>,
    pub textures: StreamTextures,
    pub keystone: Corners,
}

struct StreamRuntime {
    handle: StreamHandle,
    held_slot: Option<usize>,
    status: StreamStatus,
}

pub struct RenderLoop {
    gpu: GpuContext,
    display: Arc<Mutex<DisplaySurface>>,
    streams: Vec<StreamRuntime>,
    metrics: Arc<Metrics>,
    overlay_hook: Option<OverlayHook>,
    input: Box<dyn InputSource>,
    quit: Arc<AtomicBool>,
    overlay_enabled: bool,
    active_corner: usize,
}

impl RenderLoop {
    pub fn new(
        gpu: GpuContext,
        display: Arc<Mutex<DisplaySurface>>,
        streams: Vec<StreamHandle>,
        metrics: Arc<Metrics>,
        overlay_hook: Option<OverlayHook>,
        input: Box<dyn InputSource>,
        quit: Arc<AtomicBool>,
    ) -> Self {
        Self {
            gpu,
            display,
            streams: streams
                .into_iter()
                .map(|handle| StreamRuntime {
                    handle,
                    held_slot: None,
                    status: StreamStatus::Active,
                })
                .collect(),
            metrics,
            overlay_hook,
            input,
            quit,
            overlay_enabled: true,
            active_corner: 0,
        }
    }

    /// Drive frames until quit is requested, every stream finishes
    /// cleanly, or every stream is broken.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let frame_budget = {
            let hz = self.display.lock().unwrap().refresh_hz().max(1);
            Duration::from_secs_f64(1.0 / hz as f64)
        };

        loop {
            if self.quit.load(Ordering::Relaxed) {
                info!("render loop: quit requested");
                return Ok(());
            }

            self.drain_input();

            let frame_start = Instant::now();
            let active = self.pump_streams();
            if !active {
                return self.terminal_result();
            }

            self.gpu.begin_frame();
            for stream in &self.streams {
                if stream.status != StreamStatus::Active {
                    continue;
                }
                self.gpu.draw_stream(&stream.handle.textures, &stream.handle.keystone);
            }
            if self.overlay_enabled {
                self.run_overlay_hook();
            }

            if let Err(e) = self.gpu.swap_buffers() {
                return Err(EngineError::Display(e));
            }
            if let Err(e) = self.display.lock().unwrap().present() {
                return Err(EngineError::Display(e));
            }

            let elapsed = frame_start.elapsed();
            self.metrics.record_frame(elapsed, elapsed > frame_budget);
            if elapsed > frame_budget {
                warn!("missed vsync: frame took {elapsed:?}, budget {frame_budget:?}");
            }
        }
    }

    fn drain_input(&mut self) {
        while let Some(event) = self.input.poll() {
            match event {
                InputEvent::Quit => self.quit.store(true, Ordering::Relaxed),
                InputEvent::ToggleOverlay => self.overlay_enabled = !self.overlay_enabled,
                InputEvent::SelectCorner(index) if index < 4 => self.active_corner = index,
                InputEvent::SelectCorner(_) => {}
                InputEvent::NudgeCorner { dx, dy } => {
                    if let Some(stream) = self.streams.first_mut() {
                        stream.handle.keystone.nudge(
                            self.active_corner,
                            dx as f32 * NUDGE_STEP,
                            dy as f32 * NUDGE_STEP,
                        );
                    }
                }
                InputEvent::ResetKeystone => {
                    if let Some(stream) = self.streams.first_mut() {
                        stream.handle.keystone = Corners::identity();
                    }
                }
            }
        }
    }

    /// Run the per-stream request/borrow/upload sequence. Returns `false`
    /// once no stream is active any more.
    fn pump_streams(&mut self) -> bool {
        let mut any_active = false;
        for (index, stream) in self.streams.iter_mut().enumerate() {
            if stream.status != StreamStatus::Active {
                continue;
            }

            if let Some(outcome) = stream.handle.worker.poll_terminal() {
                stream.status = match outcome {
                    DecodeOutcome::Eof => StreamStatus::Finished,
                    _ => StreamStatus::Broken,
                };
                if let Some(held) = stream.held_slot.take() {
                    stream.handle.pool.release(held);
                }
                continue;
            }
            any_active = true;

            stream.handle.worker.request_next();

            // Pool::borrow_latest already frees the previously held slot
            // internally when it hands out a new one.
            let slot_to_upload = match stream.handle.pool.borrow_latest() {
                Some(idx) => {
                    stream.held_slot = Some(idx);
                    Some(idx)
                }
                None => {
                    if stream.held_slot.is_some() {
                        self.metrics.stream(index).record_repeat();
                    }
                    stream.held_slot
                }
            };

            if let Some(idx) = slot_to_upload {
                let gpu = &self.gpu;
                let textures = &mut stream.handle.textures;
                stream.handle.pool.with_slot(idx, |slot| {
                    let (luma_w, luma_h) = slot.valid_luma;
                    let (chroma_w, chroma_h) = slot.valid_chroma;
                    gpu.upload_frame(
                        textures,
                        (slot.y.as_slice(), luma_w, luma_h, slot.y_stride),
                        (slot.u.as_slice(), chroma_w, chroma_h, slot.u_stride),
                        (slot.v.as_slice(), chroma_w, chroma_h, slot.v_stride),
                    );
                });
            }
        }
        any_active
    }

    fn run_overlay_hook(&mut self) {
        if let Some(OverlayHook(hook)) = self.overlay_hook.as_mut() {
            let snapshot = self.metrics.snapshot();
            if let Err(e) = hook(&snapshot) {
                warn!("overlay hook failed, skipping for this frame: {e}");
            }
        }
    }

    /// Consume the loop and hand back its components for ordered
    /// teardown, in the order [`crate::lifecycle::ordered_teardown`]
    /// expects them.
    pub fn into_parts(self) -> (GpuContext, Arc<Mutex<DisplaySurface>>, Vec<StreamHandle>) {
        let streams = self.streams.into_iter().map(|s| s.handle).collect();
        (self.gpu, self.display, streams)
    }

    fn terminal_result(&self) -> Result<(), EngineError> {
        let all_broken = self
            .streams
            .iter()
            .all(|s| s.status == StreamStatus::Broken);
        if all_broken {
            Err(EngineError::AllStreamsBroken)
        } else {
            info!("render loop: all streams finished");
            Ok(())
        }
    }
}
