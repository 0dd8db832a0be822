//! The display commit engine.
//!
//! Owns the registry, framebuffer pool, repaint scheduler and hotplug
//! debouncer, and drives each enabled output through the repaint
//! cycle: duplicate the committed state, assign views to planes,
//! serialize and submit one atomic commit, then reseat states when the
//! page-flip event arrives. The engine is reactor-agnostic; the caller
//! feeds it monotonic timestamps, device events and a wake timer armed
//! from [`DisplayEngine::next_wake`].

use std::rc::Rc;

use drm_fourcc::DrmFourcc;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, DisplayConfig, ModeSelector};
use crate::error::{Error, Result};
use crate::framebuffer::{FbKind, FbPool};
use crate::geometry::{DisplayFit, FixedRect, Point, Rect, Size};
use crate::hotplug::{HotplugAction, HotplugDebouncer};
use crate::hw::{
    BlobId, BufferDesc, BufferId, CommitFlags, ConnectorId, CrtcId, DisplayControl, FbSource,
    ImageRef, Mode, PlaneKind,
};
use crate::registry::{OutputIdx, PlaneIdx, Registry};
use crate::scene::{CursorImage, View, ViewContent};
use crate::scheduler::{Nanos, RepaintScheduler};
use crate::state::{OutputState, PlaneCopy, PowerMode, StateSeq};
use crate::transaction::{build_request, OutputAssignment, TxnId};

/// Produces the primary plane content for an output.
pub trait Renderer {
    /// Renders one frame of `views` into a buffer of `area` pixels.
    /// Returning `None` reuses the previously submitted buffer.
    fn render(&mut self, output: OutputIdx, area: Size, views: &[View]) -> Result<Option<BufferDesc>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableOutcome {
    /// The output is off and its resources are released.
    Done,
    /// A commit is in flight; teardown happens at its completion.
    Deferred,
}

/// What a dispatch pass decided besides repainting.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Connectors whose disconnect debounce expired this pass. Their
    /// outputs are torn down (or scheduled for teardown).
    pub disconnected: Vec<ConnectorId>,
    /// Outputs whose repaint failed non-transiently this pass. They
    /// stay enabled but frozen on their last committed frame until new
    /// damage arrives.
    pub failed: Vec<OutputIdx>,
}

struct Output {
    connector: ConnectorId,
    crtc: CrtcId,
    name: String,
    mode: Mode,
    render_area: Size,
    fit: DisplayFit,
    primary: PlaneIdx,
    overlay: Option<PlaneIdx>,
    /// Cursor plane with its double-buffered upload targets.
    cursor: Option<(PlaneIdx, [BufferDesc; 2])>,
    cursor_front: usize,
    cursor_dirty: bool,
    cursor_clip: Option<Point>,
    mode_blob: BlobId,
    /// Next commit must carry the mode blob and allow a modeset.
    pending_mode: bool,
    damage: bool,
    views: Vec<View>,
    last_primary: Option<BufferDesc>,
    state_cur: OutputState,
    state_last: Option<OutputState>,
    in_flight: Option<TxnId>,
    submitted_at: Option<Nanos>,
    disable_pending: bool,
}

impl Output {
    fn plane_idxs(&self) -> Vec<PlaneIdx> {
        let mut idxs = vec![self.primary];
        idxs.extend(self.overlay);
        idxs.extend(self.cursor.as_ref().map(|(p, _)| *p));
        idxs
    }

    fn interval(&self) -> Nanos {
        self.mode.refresh_interval().as_nanos() as Nanos
    }

    fn area_rect(&self) -> Rect {
        Rect::from_size(self.render_area)
    }
}

pub struct DisplayEngine<D: DisplayControl> {
    dev: D,
    registry: Registry,
    pool: FbPool,
    sched: RepaintScheduler,
    hotplug: HotplugDebouncer,
    outputs: Vec<Option<Output>>,
    next_seq: u64,
    next_txn: u64,
    /// Zero unknown device state on the next commit.
    invalidated: bool,
    completion_timeout: Option<Nanos>,
    release_hook: Option<Rc<dyn Fn(BufferId)>>,
}

impl<D: DisplayControl> DisplayEngine<D> {
    pub fn new(dev: D, config: &Config) -> Result<Self> {
        let registry = Registry::enumerate(&dev)?;
        let mut hotplug = HotplugDebouncer::new(config.hotplug_debounce_ms * 1_000_000);
        for entry in registry.connectors() {
            hotplug.seed(entry.desc.id, entry.desc.connected);
        }
        Ok(Self {
            dev,
            registry,
            pool: FbPool::new(),
            sched: RepaintScheduler::new(),
            hotplug,
            outputs: Vec::new(),
            next_seq: 0,
            next_txn: 0,
            invalidated: true,
            completion_timeout: (config.completion_timeout_ms != 0)
                .then(|| config.completion_timeout_ms * 1_000_000),
            release_hook: None,
        })
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Hook invoked when an imported buffer's last framebuffer
    /// reference is dropped, returning the buffer to its owner.
    pub fn set_release_hook(&mut self, hook: Rc<dyn Fn(BufferId)>) {
        self.release_hook = Some(hook);
    }

    /// Marks all device state unknown, as after a session switch. The
    /// next commit reprograms every output and zeroes everything else.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
        for slot in 0..self.outputs.len() {
            if let Some(output) = self.outputs[slot].as_mut() {
                output.pending_mode = true;
                output.damage = true;
                self.sched.request(OutputIdx(slot));
            }
        }
    }

    fn alloc_seq(&mut self) -> StateSeq {
        let seq = StateSeq(self.next_seq);
        self.next_seq += 1;
        seq
    }

    fn output_by_connector(&self, conn: ConnectorId) -> Option<OutputIdx> {
        self.outputs
            .iter()
            .position(|o| o.as_ref().is_some_and(|o| o.connector == conn))
            .map(OutputIdx)
    }

    fn output_by_crtc(&self, crtc: CrtcId) -> Option<OutputIdx> {
        self.outputs
            .iter()
            .position(|o| o.as_ref().is_some_and(|o| o.crtc == crtc))
            .map(OutputIdx)
    }

    pub fn outputs(&self) -> Vec<OutputIdx> {
        self.outputs
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().map(|_| OutputIdx(i)))
            .collect()
    }

    pub fn output_name(&self, idx: OutputIdx) -> Result<&str> {
        self.output(idx).map(|o| o.name.as_str())
    }

    pub fn output_mode(&self, idx: OutputIdx) -> Result<&Mode> {
        self.output(idx).map(|o| &o.mode)
    }

    fn output(&self, idx: OutputIdx) -> Result<&Output> {
        self.outputs
            .get(idx.0)
            .and_then(|o| o.as_ref())
            .ok_or(Error::UnknownOutput)
    }

    fn output_mut(&mut self, idx: OutputIdx) -> Result<&mut Output> {
        self.outputs
            .get_mut(idx.0)
            .and_then(|o| o.as_mut())
            .ok_or(Error::UnknownOutput)
    }

    fn alloc_cursor_bufs(&self) -> Result<[BufferDesc; 2]> {
        let limit = self.dev.cursor_size();
        let front = self.dev.allocate_buffer(limit, DrmFourcc::Argb8888)?;
        match self.dev.allocate_buffer(limit, DrmFourcc::Argb8888) {
            Ok(back) => Ok([front, back]),
            Err(err) => {
                let _ = self.dev.release_buffer(front.id);
                Err(err)
            }
        }
    }

    /// Brings up `conn` on a free crtc. The output powers on with its
    /// first repaint commit, which carries the modeset.
    pub fn enable(&mut self, conn: ConnectorId, cfg: &DisplayConfig) -> Result<OutputIdx> {
        let entry = self.registry.connector(conn)?;
        if !entry.desc.connected {
            return Err(Error::Invariant("enabling a disconnected connector"));
        }
        let name = entry.desc.name.clone();
        let mode = select_mode(&entry.desc.modes, cfg).ok_or(Error::NoMode(conn))?;

        let idx = OutputIdx(
            self.outputs
                .iter()
                .position(|o| o.is_none())
                .unwrap_or(self.outputs.len()),
        );
        let crtc = self.registry.claim_pipeline(conn, idx)?;
        let primary = match self.registry.claim_plane(PlaneKind::Primary, crtc, idx) {
            Ok(primary) => primary,
            Err(err) => {
                self.registry.release_claims(idx);
                return Err(err);
            }
        };
        let overlay = self.registry.claim_plane(PlaneKind::Overlay, crtc, idx).ok();
        let cursor_plane = self.registry.claim_plane(PlaneKind::Cursor, crtc, idx).ok();

        let mode_blob = match self.dev.create_mode_blob(conn, &mode) {
            Ok(blob) => blob,
            Err(err) => {
                self.registry.release_claims(idx);
                return Err(err);
            }
        };

        let cursor = match cursor_plane {
            Some(plane) => match self.alloc_cursor_bufs() {
                Ok(bufs) => Some((plane, bufs)),
                Err(err) => {
                    let _ = self.dev.destroy_blob(mode_blob);
                    self.registry.release_claims(idx);
                    return Err(err);
                }
            },
            None => None,
        };

        let render_area = match (cfg.render_width, cfg.render_height) {
            (Some(w), Some(h)) => Size::new(w, h),
            _ => mode.size(),
        };
        let fit = DisplayFit::compute(mode.size(), render_area);

        let seq = self.alloc_seq();
        let mut planes = vec![primary];
        planes.extend(overlay);
        planes.extend(cursor.as_ref().map(|(p, _)| *p));
        let output = Output {
            connector: conn,
            crtc,
            name: name.clone(),
            render_area,
            fit,
            primary,
            overlay,
            cursor,
            cursor_front: 0,
            cursor_dirty: true,
            cursor_clip: None,
            mode_blob,
            pending_mode: true,
            damage: true,
            views: Vec::new(),
            last_primary: None,
            state_cur: OutputState::off(seq, planes),
            state_last: None,
            in_flight: None,
            submitted_at: None,
            disable_pending: false,
            mode,
        };
        info!(
            output = %name,
            mode = %output.mode.name,
            refresh_mhz = output.mode.refresh_mhz,
            crtc = crtc.0,
            "output enabled"
        );
        if idx.0 == self.outputs.len() {
            self.outputs.push(Some(output));
        } else {
            self.outputs[idx.0] = Some(output);
        }
        self.sched.request(idx);
        Ok(idx)
    }

    /// Turns the output off and releases its resources. With a commit
    /// in flight the teardown is deferred to the completion event, so
    /// a framebuffer the hardware may still scan out is never freed.
    pub fn disable(&mut self, idx: OutputIdx) -> Result<DisableOutcome> {
        let output = self.output_mut(idx)?;
        if output.in_flight.is_some() {
            output.disable_pending = true;
            debug!(output = %output.name, "disable deferred until commit completes");
            return Ok(DisableOutcome::Deferred);
        }

        let connector = output.connector;
        let crtc = output.crtc;
        let planes = output.plane_idxs();
        let seq = self.alloc_seq();
        let off = OutputState::off(seq, planes);
        let assignment = OutputAssignment {
            connector,
            crtc,
            state: &off,
            mode_blob: None,
        };
        let (req, _) = build_request(&self.registry, &self.pool, &[assignment], false)?;
        // Blocking commit: once it returns, nothing scans out anymore.
        self.dev.commit(CommitFlags::ALLOW_MODESET, &req)?;

        let output = self.outputs[idx.0].take().ok_or(Error::UnknownOutput)?;
        output.state_cur.release(&mut self.pool, &self.dev)?;
        if let Some(last) = output.state_last {
            last.release(&mut self.pool, &self.dev)?;
        }
        if let Some((_, bufs)) = &output.cursor {
            for buf in bufs {
                self.dev.release_buffer(buf.id)?;
            }
        }
        self.dev.destroy_blob(output.mode_blob)?;
        self.registry.release_claims(idx);
        self.sched.idle(idx);
        info!(output = %output.name, "output disabled");
        Ok(DisableOutcome::Done)
    }

    /// Requests a repaint; repeated requests before the next commit
    /// coalesce into one.
    pub fn schedule_repaint(&mut self, idx: OutputIdx) -> Result<()> {
        let output = self.output_mut(idx)?;
        output.damage = true;
        self.sched.request(idx);
        Ok(())
    }

    /// Replaces the output's view list, bottom to top.
    pub fn set_views(&mut self, idx: OutputIdx, views: Vec<View>) -> Result<()> {
        let output = self.output_mut(idx)?;
        output.views = views;
        output.cursor_dirty = true;
        self.schedule_repaint(idx)
    }

    /// Folds in a hotplug event for `conn` after re-probing it.
    pub fn on_hotplug(&mut self, conn: ConnectorId, now: Nanos) -> Result<HotplugAction> {
        let desc = self.registry.refresh_connector(&self.dev, conn)?;
        let connected = desc.connected;
        Ok(self.hotplug.note(conn, connected, now))
    }

    /// Handles a page-flip completion for `crtc` with the vblank
    /// timestamp `stamp`.
    pub fn on_page_flip(&mut self, crtc: CrtcId, stamp: Nanos, now: Nanos) -> Result<()> {
        let Some(idx) = self.output_by_crtc(crtc) else {
            warn!(crtc = crtc.0, "page flip for unknown crtc");
            return Ok(());
        };
        let Some(output) = self.outputs[idx.0].as_mut() else {
            return Ok(());
        };
        if output.in_flight.take().is_none() {
            warn!(output = %output.name, "page flip without a commit in flight");
            return Ok(());
        }
        output.submitted_at = None;
        output.state_cur.mark_complete();
        if let Some(last) = output.state_last.take() {
            if last.seq == output.state_cur.seq {
                return Err(Error::Invariant("superseded state aliases the current one"));
            }
            last.release(&mut self.pool, &self.dev)?;
        }
        let interval = output.interval();
        let disable_pending = output.disable_pending;
        trace!(output = %output.name, stamp, "commit completed");
        self.sched.finish_frame(idx, stamp, now, interval)?;

        if disable_pending {
            match self.disable(idx)? {
                DisableOutcome::Done => {}
                DisableOutcome::Deferred => {
                    return Err(Error::Invariant("disable deferred twice"));
                }
            }
        }
        Ok(())
    }

    /// Runs everything that is due at `now`: idle hops, expired
    /// hotplug debounces, completion watchdogs and repaints.
    pub fn dispatch(&mut self, renderer: &mut dyn Renderer, now: Nanos) -> Result<DispatchOutcome> {
        profiling::scope!("engine::dispatch");
        let mut outcome = DispatchOutcome::default();

        for idx in self.sched.idle_hops() {
            if self.output(idx).is_err() {
                self.sched.idle(idx);
                continue;
            }
            self.sched.begin_from_idle(idx);
            // No vblank timestamp yet; the first repaint is due now.
            self.sched.finish_frame_now(idx, now)?;
        }

        for conn in self.hotplug.expired(now) {
            if let Some(idx) = self.output_by_connector(conn) {
                self.disable(idx)?;
            }
            outcome.disconnected.push(conn);
        }

        if let Some(timeout) = self.completion_timeout {
            for slot in self.outputs.iter_mut().flatten() {
                if let Some(submitted) = slot.submitted_at {
                    if submitted + timeout <= now {
                        // The superseded state stays alive; only the
                        // real completion event may free it.
                        warn!(
                            output = %slot.name,
                            waited_ms = (now - submitted) / 1_000_000,
                            "commit completion overdue"
                        );
                        slot.submitted_at = None;
                    }
                }
            }
        }

        for idx in self.sched.due_outputs(now) {
            // One output failing must not starve the others of their
            // repaint, and must not take the engine down.
            if let Err(err) = self.repaint_output(renderer, idx, now) {
                match self.output_name(idx) {
                    Ok(name) => error!(output = %name, %err, "repaint failed, output frozen"),
                    Err(_) => error!(%err, "repaint failed on a removed output"),
                }
                self.sched.idle(idx);
                outcome.failed.push(idx);
            }
        }
        Ok(outcome)
    }

    /// Earliest moment the engine needs to run again.
    pub fn next_wake(&self, now: Nanos) -> Option<Nanos> {
        let mut wake: Option<Nanos> = None;
        let mut merge = |deadline: Nanos| {
            let deadline = deadline.max(now);
            wake = Some(wake.map_or(deadline, |w: Nanos| w.min(deadline)));
        };
        if let Some(d) = self.sched.next_deadline() {
            merge(d);
        }
        if let Some(d) = self.hotplug.next_deadline() {
            merge(d);
        }
        if let Some(timeout) = self.completion_timeout {
            for slot in self.outputs.iter().flatten() {
                if let Some(submitted) = slot.submitted_at {
                    merge(submitted + timeout);
                }
            }
        }
        wake
    }

    fn repaint_output(&mut self, renderer: &mut dyn Renderer, idx: OutputIdx, now: Nanos) -> Result<()> {
        profiling::scope!("engine::repaint");
        let Some(output) = self.outputs.get_mut(idx.0).and_then(|o| o.as_mut()) else {
            self.sched.idle(idx);
            return Ok(());
        };
        if !output.damage {
            trace!(output = %output.name, "no damage, repaint loop going idle");
            self.sched.idle(idx);
            return Ok(());
        }

        let seq = StateSeq(self.next_seq);
        self.next_seq += 1;
        let mut pending = output.state_cur.duplicate(seq, &mut self.pool, PlaneCopy::Reset)?;
        pending.power = PowerMode::On;

        // Framebuffer references staged into `pending` must not
        // outlive a failed repaint; every error below releases them.
        if let Err(err) = Self::stage_planes(
            &self.dev,
            &mut self.pool,
            self.release_hook.as_ref(),
            renderer,
            idx,
            output,
            &mut pending,
        ) {
            pending.release(&mut self.pool, &self.dev)?;
            return Err(err);
        }

        let assignment = OutputAssignment {
            connector: output.connector,
            crtc: output.crtc,
            state: &pending,
            mode_blob: output.pending_mode.then_some(output.mode_blob),
        };
        let (req, needs_modeset) =
            match build_request(&self.registry, &self.pool, &[assignment], self.invalidated) {
                Ok(built) => built,
                Err(err) => {
                    pending.release(&mut self.pool, &self.dev)?;
                    return Err(err);
                }
            };
        let mut flags = CommitFlags::PAGE_FLIP_EVENT;
        if needs_modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        } else {
            flags |= CommitFlags::NONBLOCK;
        }

        match self.dev.commit(flags, &req) {
            Ok(()) => {
                let txn = TxnId(self.next_txn);
                self.next_txn += 1;
                self.invalidated = false;
                output.pending_mode = false;
                output.damage = false;
                output.in_flight = Some(txn);
                output.submitted_at = Some(now);
                if output.state_last.is_some() {
                    return Err(Error::Invariant("two commits in flight on one output"));
                }
                output.state_last = Some(std::mem::replace(&mut output.state_cur, pending));
                debug!(output = %output.name, txn = txn.0, ?flags, "commit submitted");
                self.sched.commit_in_flight(idx)?;
            }
            Err(err) if err.is_transient() => {
                let interval = output.interval();
                warn!(output = %output.name, %err, "commit refused, retrying next frame");
                pending.release(&mut self.pool, &self.dev)?;
                self.sched.defer(idx, now + interval);
            }
            Err(err) => {
                pending.release(&mut self.pool, &self.dev)?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Assigns the output's views to its planes, staging framebuffer
    /// references into `pending`.
    fn stage_planes(
        dev: &D,
        pool: &mut FbPool,
        release_hook: Option<&Rc<dyn Fn(BufferId)>>,
        renderer: &mut dyn Renderer,
        idx: OutputIdx,
        output: &mut Output,
        pending: &mut OutputState,
    ) -> Result<()> {
        // Primary plane: rendered scene, or the previous buffer when
        // the renderer had nothing new to draw.
        let rendered = renderer.render(idx, output.render_area, &output.views)?;
        let primary_buf = match rendered {
            Some(desc) => {
                output.last_primary = Some(desc);
                Some(desc)
            }
            None => output.last_primary,
        };
        if let Some(desc) = primary_buf {
            let key = pool.acquire(dev, &FbSource::Dumb(desc.id), desc.size, FbKind::Swapchain)?;
            let area = output.fit.apply(output.area_rect());
            let slot = pending.plane_mut(output.primary);
            slot.fb = Some(key);
            slot.src = FixedRect::from_size(desc.size);
            slot.dst = area;
        }

        // One overlay plane, taken by the topmost eligible view.
        if let Some(plane) = output.overlay {
            let area_rect = output.area_rect();
            let candidate = output.views.iter().rev().find(|v| {
                v.visible
                    && matches!(v.content, ViewContent::Overlay { .. })
                    && v.rect.overlaps(&area_rect)
            });
            if let Some(view) = candidate {
                let ViewContent::Overlay { source } = &view.content else {
                    unreachable!("filtered above");
                };
                if let FbSource::External { size, .. } = *source {
                    let hook = release_hook.cloned().map(|hook| {
                        Box::new(move |buffer| hook(buffer)) as Box<dyn FnMut(BufferId)>
                    });
                    let key = pool.acquire(dev, source, size, FbKind::Import { release: hook })?;
                    let dst = output.fit.apply(view.rect);
                    let slot = pending.plane_mut(plane);
                    slot.fb = Some(key);
                    slot.src = FixedRect::from_size(size);
                    slot.dst = dst;
                    slot.view = Some(view.id);
                }
            }
        }

        // Cursor plane. An offscreen cursor leaves the plane cleared.
        if let Some((plane, bufs)) = output.cursor.clone() {
            let area_rect = output.area_rect();
            let cursor_view = output
                .views
                .iter()
                .rev()
                .find(|v| v.visible && v.is_cursor())
                .filter(|v| v.rect.overlaps(&area_rect));
            if let Some(view) = cursor_view {
                let ViewContent::Cursor { image, hotspot } = &view.content else {
                    unreachable!("filtered above");
                };
                let limit = dev.cursor_size();
                let origin = output.fit.apply_point(Point::new(view.rect.x, view.rect.y));
                let want = Point::new(origin.x - hotspot.x, origin.y - hotspot.y);
                // A hotspot past the output edge would need a negative
                // plane position; clip the image inside the buffer
                // instead and pin the plane to the edge.
                let clip = Point::new((-want.x).max(0), (-want.y).max(0));
                if output.cursor_dirty || output.cursor_clip != Some(clip) {
                    let back = 1 - output.cursor_front;
                    let pixels = compose_cursor(limit, image, clip);
                    dev.write_buffer(
                        bufs[back].id,
                        Point::new(0, 0),
                        ImageRef {
                            size: limit,
                            stride: limit.w * 4,
                            data: &pixels,
                        },
                    )?;
                    output.cursor_front = back;
                    output.cursor_dirty = false;
                    output.cursor_clip = Some(clip);
                }
                let buf = bufs[output.cursor_front];
                let key = pool.acquire(dev, &FbSource::Dumb(buf.id), limit, FbKind::Cursor)?;
                let slot = pending.plane_mut(plane);
                slot.fb = Some(key);
                slot.src = FixedRect::from_size(limit);
                slot.dst = Rect::new(want.x.max(0), want.y.max(0), limit.w, limit.h);
                slot.view = Some(view.id);
            }
        }
        Ok(())
    }

    // Test inspection helpers.
    #[cfg(test)]
    pub(crate) fn repaint_status(&self, idx: OutputIdx) -> crate::scheduler::RepaintStatus {
        self.sched.status(idx)
    }

    #[cfg(test)]
    pub(crate) fn live_framebuffer_keys(&self) -> usize {
        self.pool.live_count()
    }

    #[cfg(test)]
    pub(crate) fn output_crtc(&self, idx: OutputIdx) -> Result<CrtcId> {
        self.output(idx).map(|o| o.crtc)
    }
}

fn select_mode(modes: &[Mode], cfg: &DisplayConfig) -> Option<Mode> {
    if let Some(selector) = cfg.mode.as_deref().and_then(ModeSelector::parse) {
        let found = modes.iter().find(|m| {
            m.width == selector.width
                && m.height == selector.height
                && selector
                    .refresh_hz
                    .is_none_or(|hz| (m.refresh_mhz + 500) / 1000 == hz)
        });
        if let Some(mode) = found {
            return Some(mode.clone());
        }
        warn!(wanted = ?cfg.mode, "configured mode not offered, falling back to preferred");
    }
    modes
        .iter()
        .find(|m| m.preferred)
        .or_else(|| modes.first())
        .cloned()
}

/// Copies `image` into a `limit`-sized ARGB buffer, dropping the
/// `clip` leftmost/topmost pixels so the remainder starts at the
/// buffer origin. Pixels outside the image stay transparent.
fn compose_cursor(limit: Size, image: &CursorImage, clip: Point) -> Vec<u8> {
    let mut out = vec![0u8; (limit.w * limit.h * 4) as usize];
    let src_stride = (image.size.w * 4) as usize;
    let dst_stride = (limit.w * 4) as usize;
    let clip_x = clip.x as u32;
    let clip_y = clip.y as u32;
    if clip_x >= image.size.w || clip_y >= image.size.h {
        return out;
    }
    let copy_w = (image.size.w - clip_x).min(limit.w) as usize * 4;
    let copy_h = (image.size.h - clip_y).min(limit.h) as usize;
    for row in 0..copy_h {
        let src_row = (row + clip_y as usize) * src_stride + clip_x as usize * 4;
        let dst_row = row * dst_stride;
        out[dst_row..dst_row + copy_w].copy_from_slice(&image.data[src_row..src_row + copy_w]);
    }
    out
}
