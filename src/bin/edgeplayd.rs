//! edgeplayd - thin launcher for the embedded playback engine.
//!
//! Loads a [`StartupConfig`] from a JSON file named on the command line,
//! or falls back to the remaining positional arguments as media sources
//! with engine defaults otherwise. Wires [`StdinInput`], a non-blocking
//! single-key input source, and an overlay hook that logs a metrics
//! line once a second. Everything here is launcher concern, not core:
//! a different launcher on the same target could use a GPIO remote and
//! draw the overlay with its own text renderer instead.

use std::fs;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use edgeplay_engine::{Engine, EngineMetrics, InputEvent, InputSource, OverlayHook, StartupConfig};
use log::{error, info};

fn main() {
    if let Err(e) = run() {
        error!("edgeplayd: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = load_config(&args)?;

    config.overlay_hook = Some(OverlayHook(Box::new(log_overlay())));

    let input = Box::new(StdinInput::spawn());
    let engine = Engine::new(config, input)?;

    info!("edgeplayd: starting playback, ctrl-c to quit");
    engine.run()?;
    Ok(())
}

/// `edgeplayd config.json` loads a full [`StartupConfig`]; any other
/// argument list is treated as up to two bare media paths layered over
/// the engine's defaults.
fn load_config(args: &[String]) -> Result<StartupConfig> {
    if let [path] = args {
        if path.ends_with(".json") {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?;
            return serde_json::from_str(&text)
                .with_context(|| format!("parsing config file {path}"));
        }
    }

    if args.is_empty() || args.len() > 2 {
        anyhow::bail!("usage: edgeplayd <config.json> | <source.mp4> [source2.mp4]");
    }

    Ok(StartupConfig {
        sources: args.to_vec(),
        ..StartupConfig::default()
    })
}

/// Logs a one-line metrics summary at most once a second, called from
/// the render thread right before `present`; cheap enough not to affect
/// frame pacing.
fn log_overlay() -> impl FnMut(&EngineMetrics) -> Result<()> {
    let mut last_logged = Instant::now() - Duration::from_secs(1);
    move |snapshot: &EngineMetrics| {
        let now = Instant::now();
        if now.duration_since(last_logged) < Duration::from_secs(1) {
            return Ok(());
        }
        last_logged = now;
        info!(
            "render: {:.2}ms mean / {:.2}ms p99, {} presented, {} repeated, {} missed vsync",
            snapshot.render_mean_ms,
            snapshot.render_p99_ms,
            snapshot.frames_presented,
            snapshot.frames_repeated,
            snapshot.missed_vsyncs,
        );
        Ok(())
    }
}

/// Reads single keypresses from stdin in raw mode on a dedicated thread
/// and maps them to [`InputEvent`]s: `q` quits, `o` toggles the
/// overlay, `1`-`4` select a keystone corner, arrow-like `hjkl` nudge
/// it, `r` resets it. Anything else is ignored.
struct StdinInput {
    rx: mpsc::Receiver<InputEvent>,
    _raw_mode: Option<RawModeGuard>,
}

impl StdinInput {
    fn spawn() -> Self {
        let raw_mode = RawModeGuard::enable();
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("stdin-input".into())
            .spawn(move || read_loop(tx))
            .expect("failed to spawn stdin input thread");
        Self {
            rx,
            _raw_mode: raw_mode,
        }
    }
}

impl InputSource for StdinInput {
    fn poll(&mut self) -> Option<InputEvent> {
        self.rx.try_recv().ok()
    }
}

fn read_loop(tx: mpsc::Sender<InputEvent>) {
    let mut stdin = std::io::stdin();
    let mut byte = [0u8; 1];
    loop {
        if stdin.read_exact(&mut byte).is_err() {
            return;
        }
        let event = match byte[0] {
            b'q' => InputEvent::Quit,
            b'o' => InputEvent::ToggleOverlay,
            b'1' => InputEvent::SelectCorner(0),
            b'2' => InputEvent::SelectCorner(1),
            b'3' => InputEvent::SelectCorner(2),
            b'4' => InputEvent::SelectCorner(3),
            b'h' => InputEvent::NudgeCorner { dx: -1, dy: 0 },
            b'l' => InputEvent::NudgeCorner { dx: 1, dy: 0 },
            b'k' => InputEvent::NudgeCorner { dx: 0, dy: 1 },
            b'j' => InputEvent::NudgeCorner { dx: 0, dy: -1 },
            b'r' => InputEvent::ResetKeystone,
            _ => continue,
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}

/// Puts stdin into raw, unbuffered, unechoed mode for the duration of
/// playback and restores the original attributes on drop. The core's
/// own crash handler restores cooked mode independently (it doesn't
/// know this launcher exists); this is the clean-exit counterpart.
struct RawModeGuard {
    fd: i32,
    original: libc::termios,
}

impl RawModeGuard {
    fn enable() -> Option<Self> {
        let fd = std::io::stdin().as_raw_fd();
        let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
        // SAFETY: fd is a valid descriptor; tcgetattr only writes to
        // `termios` on success.
        if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
            return None;
        }
        // SAFETY: tcgetattr succeeded above.
        let original = unsafe { termios.assume_init() };

        let mut raw = original;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        // SAFETY: fd and the termios layout are the ones captured above.
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &raw);
        }

        Some(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // SAFETY: fd and `original` were captured together in `enable`.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.original);
        }
    }
}
