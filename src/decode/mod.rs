//! Decode pipeline (§4.2–§4.5).
//!
//! [`Decoder`] is the contract a backend (currently only [`ffmpeg`])
//! must satisfy; [`state`] drives the per-stream lifecycle on top of it;
//! [`worker`] runs a decoder on its own pinned thread and hands finished
//! frames to the render loop through a [`crate::pool::Pool`].

pub mod ffmpeg;
pub mod hw_fallback;
pub mod state;
pub mod worker;

use crate::error::{DecodeOutcome, OpenError};
use crate::pool::FrameSlot;

/// A single opened media stream. Implementations own the demuxer and
/// codec context; `next_frame` is called repeatedly by [`worker`] until
/// it returns [`DecodeOutcome::Eof`] or [`DecodeOutcome::Fatal`].
pub trait Decoder: Send {
    /// Native (unpadded) frame dimensions, known once the stream opens.
    fn dimensions(&self) -> (u32, u32);

    /// Attempt to produce one decoded frame into `slot`. May return
    /// [`DecodeOutcome::Retry`] any number of times before a frame (or
    /// end of stream, or a fatal error) is produced; the caller is
    /// expected to call again immediately on `Retry`, not back off.
    fn next_frame(&mut self, slot: &mut FrameSlot) -> DecodeOutcome;
}

/// Open `source`, probing for a video track and picking hardware or
/// software decode per `prefer_hardware`. Implemented today by
/// [`ffmpeg::FfmpegDecoder::open`]; a constructor function rather than a
/// trait method because opening has no shared state to dispatch on.
pub fn open(
    source: &str,
    prefer_hardware: bool,
    max_decode_attempts: u32,
) -> Result<ffmpeg::FfmpegDecoder, OpenError> {
    ffmpeg::FfmpegDecoder::open(source, prefer_hardware, max_decode_attempts)
}
