//! Display surface (C8): DRM/KMS connector acquisition, CRTC save and
//! restore, GBM buffer allocation, page-flip presentation.
//!
//! No X11/Wayland compositor is involved — this opens a DRM render node
//! directly and drives the scan-out hardware itself, the way a
//! fullscreen embedded player would on a bare TTY.

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use drm::control::{connector, crtc, Device as ControlDevice, Mode, PageFlipFlags};
use drm::Device as BasicDevice;
use khronos_egl as egl;
use log::{info, warn};

/// Thin handle over the DRM file descriptor; `drm`'s device traits are
/// marker traits requiring only [`AsFd`].
struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

/// Snapshot of a CRTC's configuration at acquisition time, restored
/// verbatim on teardown so the console (or next application) finds the
/// display exactly as it was.
struct CrtcSnapshot {
    handle: crtc::Handle,
    mode: Option<Mode>,
    framebuffer: Option<drm::control::framebuffer::Handle>,
    position: (i32, i32),
}

pub struct DisplaySurface {
    card: Card,
    gbm: gbm::Device<Card>,
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
    original_crtc: CrtcSnapshot,
    surface: gbm::Surface<()>,
    /// The buffer object and framebuffer used for the initial mode-set in
    /// `open`, kept alive for as long as the CRTC might still reference
    /// it. `present`'s page flips target the rendering `surface` above,
    /// not this one; it exists purely so `open` hands the CRTC an
    /// already-valid scan-out source before the first real frame.
    initial_scanout: (drm::control::framebuffer::Handle, gbm::BufferObject<()>),
}

impl DisplaySurface {
    /// Open `path` (typically `/dev/dri/card0`), pick the first
    /// connected connector's preferred mode, and mode-set to it.
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Path::new(path))
            .with_context(|| format!("opening DRM device {path}"))?;
        let card = Card(file);

        let resources = card
            .resource_handles()
            .context("drmModeGetResources failed")?;

        let (connector, mode) = resources
            .connectors()
            .iter()
            .filter_map(|&handle| card.get_connector(handle, false).ok())
            .find(|info| info.state() == connector::State::Connected)
            .and_then(|info| info.modes().first().copied().map(|mode| (info.handle(), mode)))
            .ok_or_else(|| anyhow!("no connected connector with a usable mode"))?;

        let encoder = card
            .get_connector(connector, false)?
            .current_encoder()
            .ok_or_else(|| anyhow!("connector has no current encoder"))?;
        let crtc = card
            .get_encoder(encoder)?
            .crtc()
            .or_else(|| resources.filter_crtcs(drm::control::crtc::Handle::MASK_ALL).first().copied())
            .ok_or_else(|| anyhow!("no CRTC available for connector"))?;

        let original = card.get_crtc(crtc).context("drmModeGetCrtc failed")?;
        let original_crtc = CrtcSnapshot {
            handle: crtc,
            mode: original.mode(),
            framebuffer: original.framebuffer(),
            position: original.position(),
        };

        let gbm = gbm::Device::new(Card(card.0.try_clone()?))
            .context("gbm_create_device failed")?;
        let (width, height) = mode.size();
        let surface = gbm
            .create_surface::<()>(
                width as u32,
                height as u32,
                gbm::Format::Xrgb8888,
                gbm::BufferObjectFlags::SCANOUT | gbm::BufferObjectFlags::RENDERING,
            )
            .context("gbm_surface_create failed")?;

        // Mode-set now, with a dedicated scan-out buffer rather than the
        // rendering surface above: the EGL context that will eventually
        // render into `surface` doesn't exist yet (it's built from this
        // surface's native handles, so it must come after `open`
        // returns), so there is no rendered frame to lock as a front
        // buffer yet. `present`'s page flips take over from here for
        // every subsequent frame.
        let initial_bo = gbm
            .create_buffer_object::<()>(
                width as u32,
                height as u32,
                gbm::Format::Xrgb8888,
                gbm::BufferObjectFlags::SCANOUT,
            )
            .context("gbm_bo_create failed for the initial mode-set buffer")?;
        let initial_fb = card
            .add_framebuffer(&initial_bo, 24, 32)
            .context("drmModeAddFB failed for the initial mode-set buffer")?;
        card.set_crtc(crtc, Some(initial_fb), (0, 0), &[connector], Some(mode))
            .context("drmModeSetCrtc failed")?;

        info!(
            "display acquired: connector {:?}, mode {}x{}@{}",
            connector,
            width,
            height,
            mode.vrefresh()
        );

        Ok(Self {
            card,
            gbm,
            connector,
            crtc,
            mode,
            original_crtc,
            surface,
            initial_scanout: (initial_fb, initial_bo),
        })
    }

    pub fn size(&self) -> (u32, u32) {
        let (w, h) = self.mode.size();
        (w as u32, h as u32)
    }

    /// The display's refresh rate, used by the render loop to size its
    /// missed-VSync budget.
    pub fn refresh_hz(&self) -> u32 {
        self.mode.vrefresh()
    }

    /// Native EGL display handle bound to this GBM device.
    pub fn native_display(&self) -> egl::NativeDisplayType {
        self.gbm.as_raw() as egl::NativeDisplayType
    }

    /// Native EGL window handle bound to this GBM surface.
    pub fn native_window(&self) -> egl::NativeWindowType {
        self.surface.as_raw() as egl::NativeWindowType
    }

    /// Lock the GBM surface's front buffer, ensure it has a DRM
    /// framebuffer, and submit a page flip. Blocks on the flip-complete
    /// event — this is the render loop's VSync gate.
    pub fn present(&mut self) -> Result<()> {
        let buffer_object = self
            .surface
            .lock_front_buffer()
            .context("gbm_surface_lock_front_buffer failed")?;

        let framebuffer = self
            .card
            .add_framebuffer(&buffer_object, 24, 32)
            .context("drmModeAddFB failed")?;

        self.card
            .page_flip(self.crtc, framebuffer, PageFlipFlags::EVENT, None)
            .context("drmModePageFlip failed")?;

        loop {
            let events = self.card.receive_events().context("drmHandleEvent failed")?;
            if events
                .into_iter()
                .any(|event| matches!(event, drm::control::Event::PageFlip(_)))
            {
                break;
            }
        }

        let _ = self.card.destroy_framebuffer(framebuffer);
        Ok(())
    }

    /// Restore the CRTC to its pre-acquisition configuration. Called by
    /// `Drop`, but exposed so the lifecycle supervisor can call it
    /// explicitly before other teardown in the documented order.
    pub fn restore(&mut self) {
        if let Some(mode) = self.original_crtc.mode {
            let result = self.card.set_crtc(
                self.original_crtc.handle,
                self.original_crtc.framebuffer,
                self.original_crtc.position,
                &[self.connector],
                Some(mode),
            );
            if let Err(e) = result {
                warn!("failed to restore original CRTC configuration: {e}");
            }
        }
        let _ = self.card.destroy_framebuffer(self.initial_scanout.0);
    }
}

impl Drop for DisplaySurface {
    fn drop(&mut self) {
        self.restore();
    }
}
