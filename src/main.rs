use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use calloop::generic::Generic;
use calloop::{EventLoop, Interest, Mode, PostAction};
use drm_fourcc::DrmFourcc;
use tracing::{debug, info, warn};

use ember::config::Config;
use ember::engine::{DisplayEngine, Renderer};
use ember::geometry::{Point, Size};
use ember::hotplug::HotplugAction;
use ember::hw::drm::DrmDevice;
use ember::hw::{BufferDesc, ConnectorId, DisplayControl, ImageRef};
use ember::registry::OutputIdx;
use ember::scene::View;
use ember::scheduler::Nanos;

fn main() -> anyhow::Result<()> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .compact()
            .init();
    }

    #[cfg(feature = "profile-with-tracy")]
    profiling::tracy_client::Client::start();

    profiling::register_thread!("Main Thread");

    #[cfg(feature = "profile-with-puffin")]
    let _server = puffin_http::Server::new(&format!("0.0.0.0:{}", puffin_http::DEFAULT_PORT));
    #[cfg(feature = "profile-with-puffin")]
    profiling::puffin::set_scopes_on(true);

    let arg = std::env::args().nth(1);
    match arg.as_deref() {
        Some("--probe") => probe(),
        Some(other) => Err(anyhow!("unknown argument: {other}\nUSAGE: ember [--probe]")),
        None => run(),
    }
}

/// Lists connectors and their mode lists, then exits.
fn probe() -> anyhow::Result<()> {
    let device = open_first_card()?;
    let resources = device
        .resources()
        .map_err(|e| anyhow!("enumerate resources: {e}"))?;
    for conn in &resources.connectors {
        let state = if conn.connected { "connected" } else { "disconnected" };
        println!("{} ({state})", conn.name);
        for mode in &conn.modes {
            let tag = if mode.preferred { " (preferred)" } else { "" };
            println!(
                "\t{}x{}@{}.{:03}{}",
                mode.width,
                mode.height,
                mode.refresh_mhz / 1000,
                mode.refresh_mhz % 1000,
                tag
            );
        }
    }
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let config = Config::load();
    let device = Rc::new(open_first_card()?);
    let engine = DisplayEngine::new(device.clone(), &config)
        .map_err(|e| anyhow!("initialize display engine: {e}"))?;

    let mut event_loop: EventLoop<App> =
        EventLoop::try_new().context("create event loop")?;
    let handle = event_loop.handle();

    handle
        .insert_source(
            Generic::new(DeviceSource(device.clone()), Interest::READ, Mode::Level),
            |_, source, app: &mut App| {
                app.drm_ready(&source.0);
                Ok(PostAction::Continue)
            },
        )
        .map_err(|e| anyhow!("insert drm event source: {e}"))?;

    let monitor = udev::MonitorBuilder::new()
        .context("create udev monitor")?
        .match_subsystem("drm")
        .context("filter udev monitor")?
        .listen()
        .context("listen on udev monitor")?;
    handle
        .insert_source(
            Generic::new(monitor, Interest::READ, Mode::Level),
            |_, socket, app: &mut App| {
                let changed = socket.iter().any(|ev| ev.event_type() == udev::EventType::Change);
                if changed {
                    app.hotplug();
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|e| anyhow!("insert udev event source: {e}"))?;

    let mut app = App {
        engine,
        config,
        renderer: TestPatternRenderer::new(device.clone()),
        active: HashMap::new(),
    };

    let connected: Vec<ConnectorId> = app
        .engine
        .registry()
        .connectors()
        .filter(|c| c.desc.connected)
        .map(|c| c.desc.id)
        .collect();
    if connected.is_empty() {
        info!("no connected displays, waiting for hotplug");
    }
    for conn in connected {
        app.try_enable(conn);
    }

    loop {
        app.tick(monotonic_now())?;
        let timeout = app.engine.next_wake(monotonic_now()).map(|due| {
            Duration::from_nanos(due.saturating_sub(monotonic_now()))
        });
        event_loop
            .dispatch(timeout, &mut app)
            .context("event loop dispatch")?;
    }
}

struct DeviceSource(Rc<DrmDevice>);

impl AsFd for DeviceSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

struct App {
    engine: DisplayEngine<Rc<DrmDevice>>,
    config: Config,
    renderer: TestPatternRenderer,
    active: HashMap<ConnectorId, OutputIdx>,
}

impl App {
    fn tick(&mut self, now: Nanos) -> anyhow::Result<()> {
        let outcome = self
            .engine
            .dispatch(&mut self.renderer, now)
            .map_err(|e| anyhow!("dispatch failed: {e}"))?;
        for conn in outcome.disconnected {
            if let Some(idx) = self.active.remove(&conn) {
                self.renderer.retire(idx);
            }
        }
        Ok(())
    }

    fn drm_ready(&mut self, device: &Rc<DrmDevice>) {
        let now = monotonic_now();
        match device.dispatch_events() {
            Ok(flips) => {
                for flip in flips {
                    if let Err(err) = self.engine.on_page_flip(flip.crtc, flip.stamp, now) {
                        warn!(crtc = flip.crtc.0, error = %err, "page flip handling failed");
                    }
                }
            }
            Err(err) => warn!(error = %err, "reading drm events failed"),
        }
    }

    /// Re-probes every connector after a drm change uevent. The engine
    /// debounces, so feeding unchanged connectors is harmless.
    fn hotplug(&mut self) {
        let now = monotonic_now();
        let conns: Vec<ConnectorId> = self
            .engine
            .registry()
            .connectors()
            .map(|c| c.desc.id)
            .collect();
        for conn in conns {
            match self.engine.on_hotplug(conn, now) {
                Ok(HotplugAction::Connect) => self.try_enable(conn),
                Ok(_) => {}
                Err(err) => warn!(connector = conn.0, error = %err, "hotplug probe failed"),
            }
        }
    }

    fn try_enable(&mut self, conn: ConnectorId) {
        let Ok(entry) = self.engine.registry().connector(conn) else {
            return;
        };
        if entry.claimed_by.is_some() || !entry.desc.connected {
            return;
        }
        let name = entry.desc.name.clone();
        let display = self.config.display(&name);
        if display.enabled == Some(false) {
            info!(output = %name, "output disabled by config");
            return;
        }
        match self.engine.enable(conn, &display) {
            Ok(idx) => {
                self.active.insert(conn, idx);
            }
            Err(err) => warn!(output = %name, error = %err, "failed to enable output"),
        }
    }
}

/// Fills the primary plane with a moving gradient. Stands in for a real
/// renderer; content arrives through dumb buffer uploads.
struct TestPatternRenderer {
    dev: Rc<DrmDevice>,
    chains: HashMap<OutputIdx, Swapchain>,
    frame: u64,
}

struct Swapchain {
    bufs: [BufferDesc; 2],
    next: usize,
}

impl TestPatternRenderer {
    fn new(dev: Rc<DrmDevice>) -> Self {
        Self {
            dev,
            chains: HashMap::new(),
            frame: 0,
        }
    }

    fn retire(&mut self, idx: OutputIdx) {
        if let Some(chain) = self.chains.remove(&idx) {
            for buf in chain.bufs {
                if let Err(err) = self.dev.release_buffer(buf.id) {
                    warn!(buffer = buf.id.0, error = %err, "releasing swapchain buffer failed");
                }
            }
        }
    }
}

impl Renderer for TestPatternRenderer {
    fn render(
        &mut self,
        output: OutputIdx,
        area: Size,
        _views: &[View],
    ) -> ember::Result<Option<BufferDesc>> {
        if self
            .chains
            .get(&output)
            .is_some_and(|c| c.bufs[0].size != area)
        {
            self.retire(output);
        }
        if !self.chains.contains_key(&output) {
            let a = self.dev.allocate_buffer(area, DrmFourcc::Xrgb8888)?;
            let b = match self.dev.allocate_buffer(area, DrmFourcc::Xrgb8888) {
                Ok(b) => b,
                Err(err) => {
                    let _ = self.dev.release_buffer(a.id);
                    return Err(err);
                }
            };
            self.chains.insert(output, Swapchain { bufs: [a, b], next: 0 });
        }
        let chain = self.chains.get_mut(&output).unwrap();
        let buf = chain.bufs[chain.next];
        chain.next ^= 1;

        let mut pixels = vec![0u8; (area.w as usize) * (area.h as usize) * 4];
        fill_pattern(&mut pixels, area, self.frame);
        self.frame += 1;
        self.dev.write_buffer(
            buf.id,
            Point::new(0, 0),
            ImageRef {
                size: area,
                stride: area.w * 4,
                data: &pixels,
            },
        )?;
        Ok(Some(buf))
    }
}

fn fill_pattern(pixels: &mut [u8], area: Size, frame: u64) {
    let shift = frame as u8;
    for y in 0..area.h {
        let g = (y * 255 / area.h.max(1)) as u8;
        for x in 0..area.w {
            let i = ((y * area.w + x) * 4) as usize;
            pixels[i] = ((x * 255 / area.w.max(1)) as u8).wrapping_add(shift);
            pixels[i + 1] = g;
            pixels[i + 2] = shift;
            pixels[i + 3] = 0xff;
        }
    }
}

fn monotonic_now() -> Nanos {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    ts.tv_sec as Nanos * 1_000_000_000 + ts.tv_nsec as Nanos
}

fn open_first_card() -> anyhow::Result<DrmDevice> {
    let entries = std::fs::read_dir("/dev/dri").context("list /dev/dri")?;
    let mut cards: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("card"))
        })
        .collect();
    cards.sort();
    for path in &cards {
        let device = match DrmDevice::open(path) {
            Ok(device) => device,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "skipping drm node");
                continue;
            }
        };
        match device.resources() {
            Ok(res) if !res.connectors.is_empty() => {
                info!(path = %path.display(), "using drm device");
                return Ok(device);
            }
            Ok(_) => debug!(path = %path.display(), "no connectors, skipping"),
            Err(err) => debug!(path = %path.display(), error = %err, "skipping drm node"),
        }
    }
    Err(anyhow!("no usable drm device under /dev/dri"))
}
