//! FFmpeg-backed decoder (C4).
//!
//! Wraps `avformat`/`avcodec` via `ffmpeg-next`. Hardware acceleration is
//! attempted through a DRM-PRIME hw device context (the V4L2 M2M/DRM
//! stack on the target board); frames are always transferred back to
//! system memory before they reach the pool, since the render path
//! uploads plain YUV420 planes rather than importing DMA-BUFs directly.

use std::ptr;

use ffmpeg::ffi::{
    av_buffer_ref, av_buffer_unref, av_hwdevice_ctx_create, av_hwframe_transfer_data,
    AVBufferRef, AVCodecContext, AVHWDeviceType, AVPixelFormat,
};
use ffmpeg::format::Pixel;
use ffmpeg::media::Type as MediaType;
use ffmpeg_next as ffmpeg;
use log::{info, warn};

use super::hw_fallback::{DecodeMode, HwFallbackTracker};
use crate::error::{DecodeOutcome, OpenError};
use crate::pool::copier::copy_plane;
use crate::pool::FrameSlot;

/// Owns a hardware device context for the lifetime of the decoder that
/// created it; dropped before the codec context it was attached to.
struct HwDeviceCtx(*mut AVBufferRef);

// SAFETY: the pointer is never shared; exclusive ownership lives on the
// decode worker's thread for this decoder's entire lifetime.
unsafe impl Send for HwDeviceCtx {}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: self.0 was produced by av_hwdevice_ctx_create and
            // not freed elsewhere.
            unsafe { av_buffer_unref(&mut self.0) };
        }
    }
}

/// `get_format` callback requesting DRM-PRIME hardware frames, falling
/// back to planar YUV420 when the decoder can't produce them.
unsafe extern "C" fn get_drm_prime_format(
    ctx: *mut AVCodecContext,
    mut fmt: *const AVPixelFormat,
) -> AVPixelFormat {
    while *fmt != AVPixelFormat::AV_PIX_FMT_NONE {
        if *fmt == AVPixelFormat::AV_PIX_FMT_DRM_PRIME && !(*ctx).hw_device_ctx.is_null() {
            return AVPixelFormat::AV_PIX_FMT_DRM_PRIME;
        }
        fmt = fmt.add(1);
    }
    warn!("get_format: DRM_PRIME not offered by decoder, falling back to YUV420P");
    AVPixelFormat::AV_PIX_FMT_YUV420P
}

pub struct FfmpegDecoder {
    input: ffmpeg::format::context::Input,
    video_stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    hw_device: Option<HwDeviceCtx>,
    fallback: HwFallbackTracker,
    eof_sent: bool,
    /// Set on hardware fallback; discard inter frames until the next
    /// keyframe so the freshly opened software decoder never has to
    /// reference frames it never saw.
    awaiting_keyframe: bool,
    dims: (u32, u32),
}

impl FfmpegDecoder {
    pub fn open(
        source: &str,
        prefer_hardware: bool,
        max_decode_attempts: u32,
    ) -> Result<Self, OpenError> {
        ffmpeg::init().map_err(|e| OpenError::CannotOpen(e.to_string()))?;

        let input = ffmpeg::format::input(&source)
            .map_err(|e| OpenError::CannotOpen(format!("{source}: {e}")))?;

        let stream = input
            .streams()
            .best(MediaType::Video)
            .ok_or(OpenError::NoVideoTrack)?;
        let video_stream_index = stream.index();

        let mut context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| OpenError::CodecUnsupported(e.to_string()))?;

        // Thread count must be set before the codec is opened below;
        // changing it afterwards has no effect on most decoders. Hardware
        // decode doesn't use this (the V4L2 M2M stack parallelizes on its
        // own), so this only matters when `prefer_hardware` is false. If
        // hardware is preferred but turns out to be unavailable, the
        // decoder falls back to single-threaded software decode for this
        // stream's lifetime — `attach_hw_device` runs after the codec is
        // already open and can't retroactively change thread count.
        if !prefer_hardware {
            let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            context.set_threading(ffmpeg::codec::threading::Config::count(threads));
        }

        let mut decoder = context
            .decoder()
            .video()
            .map_err(|e| OpenError::CodecUnsupported(e.to_string()))?;

        let (hw_device, mode) = if prefer_hardware {
            match Self::attach_hw_device(&mut decoder) {
                Ok(device) => (Some(device), DecodeMode::Hardware),
                Err(reason) => {
                    info!("hardware decode unavailable ({reason}), using software");
                    (None, DecodeMode::Software)
                }
            }
        } else {
            (None, DecodeMode::Software)
        };

        let dims = (decoder.width(), decoder.height());
        if dims.0 == 0 || dims.1 == 0 {
            return Err(OpenError::CodecUnsupported(
                "stream reports zero dimensions".to_string(),
            ));
        }

        Ok(Self {
            input,
            video_stream_index,
            decoder,
            hw_device,
            fallback: HwFallbackTracker::new(mode, max_decode_attempts),
            eof_sent: false,
            awaiting_keyframe: false,
            dims,
        })
    }

    /// Attach a DRM hardware device context and the matching
    /// `get_format` callback. Returns the owned context on success so
    /// its lifetime can be tied to the decoder.
    fn attach_hw_device(decoder: &mut ffmpeg::codec::decoder::Video) -> Result<HwDeviceCtx, String> {
        unsafe {
            let mut hw_device_ctx: *mut AVBufferRef = ptr::null_mut();
            let ret = av_hwdevice_ctx_create(
                &mut hw_device_ctx,
                AVHWDeviceType::AV_HWDEVICE_TYPE_DRM,
                ptr::null(),
                ptr::null_mut(),
                0,
            );
            if ret < 0 || hw_device_ctx.is_null() {
                return Err(format!("av_hwdevice_ctx_create failed (error {ret})"));
            }

            // The context takes the reference `av_hwdevice_ctx_create`
            // produced; the Rust-side guard gets its own independent
            // reference via `av_buffer_ref` rather than aliasing the
            // context's pointer, so the two owners can `av_buffer_unref`
            // on their own schedules without double-freeing the buffer.
            let guard_ref = av_buffer_ref(hw_device_ctx);
            if guard_ref.is_null() {
                av_buffer_unref(&mut hw_device_ctx);
                return Err("av_buffer_ref failed for hw_device_ctx guard".to_string());
            }

            let raw_ctx = decoder.as_mut_ptr();
            (*raw_ctx).hw_device_ctx = hw_device_ctx;
            (*raw_ctx).get_format = Some(get_drm_prime_format);

            Ok(HwDeviceCtx(guard_ref))
        }
    }

    /// Pull one decoded, CPU-resident frame from the decoder into
    /// `video`, transferring out of hardware memory first if needed.
    /// Returns `Ok(true)` when a frame was written, `Ok(false)` on
    /// `EAGAIN` (feed more packets), and the ffmpeg error otherwise.
    fn receive_software_frame(
        &mut self,
        video: &mut ffmpeg::util::frame::Video,
    ) -> Result<bool, ffmpeg::Error> {
        let mut hw_frame = ffmpeg::util::frame::Video::empty();
        match self.decoder.receive_frame(&mut hw_frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno } if errno == ffmpeg::ffi::EAGAIN) => {
                return Ok(false)
            }
            Err(e) => return Err(e),
        }

        if hw_frame.format() == Pixel::DRM_PRIME {
            // SAFETY: hw_frame wraps a valid AVFrame for the lifetime of
            // this call; video starts empty and receives ownership of
            // the transferred data.
            let ret = unsafe { av_hwframe_transfer_data(video.as_mut_ptr(), hw_frame.as_ptr(), 0) };
            if ret < 0 {
                return Err(ffmpeg::Error::Other { errno: ret });
            }
        } else {
            *video = hw_frame;
        }
        Ok(true)
    }

    fn copy_into_slot(&self, video: &ffmpeg::util::frame::Video, slot: &mut FrameSlot) {
        let width = video.width();
        let height = video.height();
        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);

        slot.valid_luma = (width, height);
        slot.valid_chroma = (chroma_w, chroma_h);

        copy_plane(
            video.data(0),
            video.stride(0),
            slot.y.as_mut_slice(),
            slot.y_stride as usize,
            width as usize,
            height as usize,
        );
        copy_plane(
            video.data(1),
            video.stride(1),
            slot.u.as_mut_slice(),
            slot.u_stride as usize,
            chroma_w as usize,
            chroma_h as usize,
        );
        copy_plane(
            video.data(2),
            video.stride(2),
            slot.v.as_mut_slice(),
            slot.v_stride as usize,
            chroma_w as usize,
            chroma_h as usize,
        );
    }

    fn fall_back_to_software(&mut self) {
        warn!("hardware decode failing repeatedly, falling back to software");
        if self.hw_device.take().is_some() {
            // SAFETY: self.decoder is a valid, live AVCodecContext for the
            // rest of this call. Clearing hw_device_ctx here, before the
            // guard above is dropped and unrefs its own reference, means
            // the two unrefs target distinct references to the same
            // buffer rather than the context's field dangling after the
            // guard frees out from under it. `get_format` doesn't need
            // touching: `get_drm_prime_format` already checks
            // `hw_device_ctx.is_null()` and falls back to YUV420P once
            // this clears it.
            unsafe {
                let raw_ctx = self.decoder.as_mut_ptr();
                if !(*raw_ctx).hw_device_ctx.is_null() {
                    av_buffer_unref(&mut (*raw_ctx).hw_device_ctx);
                }
            }
        }
        self.awaiting_keyframe = true;
    }
}

impl super::Decoder for FfmpegDecoder {
    fn dimensions(&self) -> (u32, u32) {
        self.dims
    }

    fn next_frame(&mut self, slot: &mut FrameSlot) -> DecodeOutcome {
        let mut video = ffmpeg::util::frame::Video::empty();

        loop {
            match self.receive_software_frame(&mut video) {
                Ok(true) => {
                    if self.awaiting_keyframe {
                        if !video.is_key() {
                            continue;
                        }
                        self.awaiting_keyframe = false;
                    }
                    if self.fallback.mode() == DecodeMode::Hardware {
                        self.fallback.record_success();
                    }
                    self.copy_into_slot(&video, slot);
                    return DecodeOutcome::Ok;
                }
                Ok(false) => break,
                Err(_) => {
                    if self.fallback.mode() == DecodeMode::Hardware && self.fallback.record_failure()
                    {
                        self.fall_back_to_software();
                        return DecodeOutcome::Retry;
                    }
                    if self.fallback.mode() == DecodeMode::Hardware {
                        return DecodeOutcome::Retry;
                    }
                    return DecodeOutcome::Fatal;
                }
            }
        }

        let mut packets = self.input.packets();
        match packets.next() {
            Some((stream, packet)) if stream.index() == self.video_stream_index => {
                if self.awaiting_keyframe && !packet.is_key() {
                    return DecodeOutcome::Retry;
                }
                match self.decoder.send_packet(&packet) {
                    Ok(()) => DecodeOutcome::Retry,
                    Err(_) => DecodeOutcome::Fatal,
                }
            }
            Some(_) => DecodeOutcome::Retry,
            None => {
                if !self.eof_sent {
                    self.eof_sent = true;
                    let _ = self.decoder.send_eof();
                    return DecodeOutcome::Retry;
                }
                DecodeOutcome::Eof
            }
        }
    }
}
