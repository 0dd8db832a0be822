//! KMS backend over a DRM device node.
//!
//! Typed handles returned by the kernel are kept in per-object maps so
//! the rest of the crate can work with plain ids. Maps are filled during
//! enumeration and on property queries; looking up an id the device
//! never reported is an invariant error, not a kernel round trip.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroU32;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;

use drm::buffer::Buffer;
use drm::control::atomic::AtomicModeReq;
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{
    self, connector, crtc, framebuffer, plane, property, AtomicCommitFlags,
    Device as ControlDevice, ModeTypeFlags, PlaneType, ResourceHandles,
};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use drm_fourcc::DrmFourcc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::geometry::{Point, Size};
use crate::scheduler::Nanos;

use super::{
    BlobId, BufferDesc, BufferId, CommitFlags, ConnectorDesc, ConnectorId, CrtcId,
    DisplayControl, FbId, FbSource, ImageRef, Mode, ObjectId, PlaneDesc, PlaneId,
    PlaneKind, PropValue, PropertyId, PropertyMeta, PropertyRequest, ResourceSnapshot,
};

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Card {}
impl ControlDevice for Card {}

/// A page-flip completion read off the device fd.
#[derive(Debug, Clone, Copy)]
pub struct FlipEvent {
    pub crtc: CrtcId,
    pub frame: u32,
    /// Hardware vblank timestamp in nanoseconds.
    pub stamp: Nanos,
}

#[derive(Default)]
struct Handles {
    connectors: HashMap<u32, connector::Handle>,
    crtcs: HashMap<u32, crtc::Handle>,
    planes: HashMap<u32, plane::Handle>,
    props: HashMap<u32, property::Handle>,
    /// Kernel mode lists per connector, refreshed on every probe.
    modes: HashMap<u32, Vec<control::Mode>>,
    dumb: HashMap<u64, DumbBuffer>,
    fbs: HashMap<u32, framebuffer::Handle>,
}

/// [`DisplayControl`] over a real `/dev/dri/card*` node.
pub struct DrmDevice {
    card: Card,
    cursor: Size,
    state: RefCell<Handles>,
}

impl AsFd for DrmDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }
}

impl DrmDevice {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::access("open drm node", e))?;
        let card = Card(file);
        for cap in [ClientCapability::UniversalPlanes, ClientCapability::Atomic] {
            card.set_client_capability(cap, true)
                .map_err(|e| Error::access("set drm client capability", e))?;
        }
        let cursor = cursor_limits(&card);
        debug!(path = %path.display(), cursor_w = cursor.w, cursor_h = cursor.h, "opened drm node");
        Ok(Self {
            card,
            cursor,
            state: RefCell::new(Handles::default()),
        })
    }

    /// Drains pending device events, keeping the page flips. Callers
    /// poll the fd and invoke this when it turns readable.
    pub fn dispatch_events(&self) -> Result<Vec<FlipEvent>> {
        let events = match self.card.receive_events() {
            Ok(events) => events,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Vec::new()),
            Err(e) => return Err(Error::access("read drm events", e)),
        };
        let mut flips = Vec::new();
        for event in events {
            match event {
                control::Event::PageFlip(flip) => {
                    let crtc: u32 = flip.crtc.into();
                    trace!(crtc, frame = flip.frame, "page flip");
                    flips.push(FlipEvent {
                        crtc: CrtcId(crtc),
                        frame: flip.frame,
                        stamp: flip.duration.as_nanos() as Nanos,
                    });
                }
                _ => {}
            }
        }
        Ok(flips)
    }

    fn connector_handle(&self, conn: ConnectorId) -> Result<connector::Handle> {
        if let Some(&h) = self.state.borrow().connectors.get(&conn.0) {
            return Ok(h);
        }
        // Hotplug uevents can name a connector we have not enumerated.
        let res = self
            .card
            .resource_handles()
            .map_err(|e| Error::access("get drm resources", e))?;
        let mut state = self.state.borrow_mut();
        for &h in res.connectors() {
            state.connectors.insert(h.into(), h);
        }
        state
            .connectors
            .get(&conn.0)
            .copied()
            .ok_or(Error::Invariant("connector id not on this device"))
    }

    fn describe_connector(
        &self,
        res: &ResourceHandles,
        handle: connector::Handle,
        force_probe: bool,
    ) -> Result<ConnectorDesc> {
        let info = self
            .card
            .get_connector(handle, force_probe)
            .map_err(|e| Error::access("get connector info", e))?;
        let name = format!("{}-{}", info.interface().as_str(), info.interface_id());
        let mut crtcs = Vec::new();
        for &enc in info.encoders() {
            let Ok(enc_info) = self.card.get_encoder(enc) else {
                continue;
            };
            for h in res.filter_crtcs(enc_info.possible_crtcs()) {
                let id = CrtcId(h.into());
                if !crtcs.contains(&id) {
                    crtcs.push(id);
                }
            }
        }
        let raw: u32 = handle.into();
        let modes = info.modes().iter().map(convert_mode).collect();
        self.state.borrow_mut().modes.insert(raw, info.modes().to_vec());
        Ok(ConnectorDesc {
            id: ConnectorId(raw),
            name,
            connected: info.state() == connector::State::Connected,
            modes,
            crtcs,
        })
    }

    fn collect_props<H>(&self, obj: ObjectId, handle: H) -> Result<Vec<PropertyMeta>>
    where
        H: control::ResourceHandle,
    {
        let props = self
            .card
            .get_properties(handle)
            .map_err(|e| Error::access("get object properties", e))?;
        let mut out = Vec::new();
        let mut state = self.state.borrow_mut();
        for (&id, &value) in props.iter() {
            let info = self
                .card
                .get_property(id)
                .map_err(|e| Error::access("get property info", e))?;
            let raw: u32 = id.into();
            state.props.insert(raw, id);
            out.push(PropertyMeta {
                id: PropertyId(raw),
                name: info.name().to_string_lossy().into_owned(),
                value,
            });
        }
        trace!(?obj, count = out.len(), "collected properties");
        Ok(out)
    }
}

impl DisplayControl for DrmDevice {
    fn resources(&self) -> Result<ResourceSnapshot> {
        let res = self
            .card
            .resource_handles()
            .map_err(|e| Error::access("get drm resources", e))?;
        {
            let mut state = self.state.borrow_mut();
            state.connectors.clear();
            state.crtcs.clear();
            state.planes.clear();
            for &h in res.connectors() {
                state.connectors.insert(h.into(), h);
            }
            for &h in res.crtcs() {
                state.crtcs.insert(h.into(), h);
            }
        }

        let mut connectors = Vec::new();
        for &h in res.connectors() {
            connectors.push(self.describe_connector(&res, h, false)?);
        }
        let crtcs = res.crtcs().iter().map(|&h| CrtcId(h.into())).collect();

        let plane_handles = self
            .card
            .plane_handles()
            .map_err(|e| Error::access("get plane list", e))?;
        let mut planes = Vec::new();
        for handle in plane_handles {
            let info = self
                .card
                .get_plane(handle)
                .map_err(|e| Error::access("get plane info", e))?;
            let possible_crtcs = res
                .filter_crtcs(info.possible_crtcs())
                .into_iter()
                .map(|h| CrtcId(h.into()))
                .collect();
            let kind = plane_kind(&self.card, handle)?;
            self.state.borrow_mut().planes.insert(handle.into(), handle);
            planes.push(PlaneDesc {
                id: PlaneId(handle.into()),
                kind,
                possible_crtcs,
            });
        }
        debug!(
            connectors = connectors.len(),
            crtcs = res.crtcs().len(),
            planes = planes.len(),
            "enumerated drm resources"
        );
        Ok(ResourceSnapshot {
            connectors,
            crtcs,
            planes,
        })
    }

    fn probe_connector(&self, conn: ConnectorId) -> Result<ConnectorDesc> {
        let handle = self.connector_handle(conn)?;
        let res = self
            .card
            .resource_handles()
            .map_err(|e| Error::access("get drm resources", e))?;
        self.describe_connector(&res, handle, true)
    }

    fn object_properties(&self, obj: ObjectId) -> Result<Vec<PropertyMeta>> {
        match obj {
            ObjectId::Connector(c) => {
                let h = self.connector_handle(c)?;
                self.collect_props(obj, h)
            }
            ObjectId::Crtc(c) => {
                let h = self
                    .state
                    .borrow()
                    .crtcs
                    .get(&c.0)
                    .copied()
                    .ok_or(Error::Invariant("crtc id not on this device"))?;
                self.collect_props(obj, h)
            }
            ObjectId::Plane(p) => {
                let h = self
                    .state
                    .borrow()
                    .planes
                    .get(&p.0)
                    .copied()
                    .ok_or(Error::Invariant("plane id not on this device"))?;
                self.collect_props(obj, h)
            }
        }
    }

    fn create_mode_blob(&self, conn: ConnectorId, mode: &Mode) -> Result<BlobId> {
        let state = self.state.borrow();
        let kmodes = state.modes.get(&conn.0).ok_or(Error::NoMode(conn))?;
        let kmode = kmodes
            .iter()
            .find(|m| {
                m.name().to_string_lossy() == mode.name
                    && m.size() == (mode.width, mode.height)
                    && m.vrefresh() * 1000 == mode.refresh_mhz
            })
            .or_else(|| {
                kmodes.iter().find(|m| {
                    m.size() == (mode.width, mode.height)
                        && m.vrefresh() * 1000 == mode.refresh_mhz
                })
            })
            .copied()
            .ok_or(Error::NoMode(conn))?;
        drop(state);
        let value = self
            .card
            .create_property_blob(&kmode)
            .map_err(|e| Error::access("create mode blob", e))?;
        let raw: u64 = value.into();
        Ok(BlobId(raw))
    }

    fn destroy_blob(&self, blob: BlobId) -> Result<()> {
        self.card
            .destroy_property_blob(blob.0)
            .map_err(|e| Error::access("destroy mode blob", e))
    }

    fn allocate_buffer(&self, size: Size, format: DrmFourcc) -> Result<BufferDesc> {
        let db = self
            .card
            .create_dumb_buffer((size.w, size.h), format, 32)
            .map_err(|e| Error::access("create dumb buffer", e))?;
        let raw: u32 = db.handle().into();
        let desc = BufferDesc {
            id: BufferId(raw as u64),
            size,
            pitch: db.pitch(),
            format,
        };
        self.state.borrow_mut().dumb.insert(desc.id.0, db);
        trace!(buffer = desc.id.0, w = size.w, h = size.h, "allocated dumb buffer");
        Ok(desc)
    }

    fn write_buffer(&self, buffer: BufferId, origin: Point, image: ImageRef<'_>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let db = state
            .dumb
            .get_mut(&buffer.0)
            .ok_or(Error::UnknownBuffer(buffer.0))?;
        if origin.x < 0 || origin.y < 0 {
            return Err(Error::Invariant("buffer write origin is negative"));
        }
        let (buf_w, buf_h) = db.size();
        if origin.x as u32 + image.size.w > buf_w || origin.y as u32 + image.size.h > buf_h {
            return Err(Error::Invariant("buffer write overflows the buffer"));
        }
        let pitch = db.pitch() as usize;
        let mut map = self
            .card
            .map_dumb_buffer(db)
            .map_err(|e| Error::access("map dumb buffer", e))?;
        let bytes: &mut [u8] = map.as_mut();
        let row_bytes = image.size.w as usize * 4;
        for row in 0..image.size.h as usize {
            let src = &image.data[row * image.stride as usize..][..row_bytes];
            let off = (origin.y as usize + row) * pitch + origin.x as usize * 4;
            bytes[off..off + row_bytes].copy_from_slice(src);
        }
        Ok(())
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<()> {
        let db = self
            .state
            .borrow_mut()
            .dumb
            .remove(&buffer.0)
            .ok_or(Error::UnknownBuffer(buffer.0))?;
        self.card
            .destroy_dumb_buffer(db)
            .map_err(|e| Error::access("destroy dumb buffer", e))
    }

    fn create_framebuffer(&self, source: &FbSource) -> Result<FbId> {
        let handle = match *source {
            FbSource::Dumb(id) => {
                let state = self.state.borrow();
                let db = state.dumb.get(&id.0).ok_or(Error::UnknownBuffer(id.0))?;
                self.card
                    .add_framebuffer(db, 24, 32)
                    .map_err(|e| Error::access("add framebuffer", e))?
            }
            FbSource::External {
                handle,
                size,
                pitch,
                bpp,
                depth,
            } => {
                let raw = NonZeroU32::new(handle.0 as u32)
                    .ok_or(Error::UnknownBuffer(handle.0))?;
                let buf = ExternalBuffer {
                    handle: raw.into(),
                    size: (size.w, size.h),
                    pitch,
                };
                self.card
                    .add_framebuffer(&buf, depth, bpp)
                    .map_err(|e| Error::access("add framebuffer", e))?
            }
        };
        let raw: u32 = handle.into();
        self.state.borrow_mut().fbs.insert(raw, handle);
        Ok(FbId(raw))
    }

    fn destroy_framebuffer(&self, fb: FbId) -> Result<()> {
        let handle = self
            .state
            .borrow_mut()
            .fbs
            .remove(&fb.0)
            .ok_or(Error::Invariant("framebuffer id not on this device"))?;
        self.card
            .destroy_framebuffer(handle)
            .map_err(|e| Error::access("destroy framebuffer", e))
    }

    fn commit(&self, flags: CommitFlags, req: &PropertyRequest) -> Result<()> {
        let state = self.state.borrow();
        let mut atomic = AtomicModeReq::new();
        for &(obj, prop, value) in req.entries() {
            let prop_handle = state
                .props
                .get(&prop.0)
                .copied()
                .ok_or(Error::Invariant("property id never queried from device"))?;
            let value = convert_value(&state, value)?;
            match obj {
                ObjectId::Connector(c) => {
                    let h = state
                        .connectors
                        .get(&c.0)
                        .copied()
                        .ok_or(Error::Invariant("connector id not on this device"))?;
                    atomic.add_property(h, prop_handle, value);
                }
                ObjectId::Crtc(c) => {
                    let h = state
                        .crtcs
                        .get(&c.0)
                        .copied()
                        .ok_or(Error::Invariant("crtc id not on this device"))?;
                    atomic.add_property(h, prop_handle, value);
                }
                ObjectId::Plane(p) => {
                    let h = state
                        .planes
                        .get(&p.0)
                        .copied()
                        .ok_or(Error::Invariant("plane id not on this device"))?;
                    atomic.add_property(h, prop_handle, value);
                }
            }
        }
        drop(state);
        self.card
            .atomic_commit(convert_flags(flags), atomic)
            .map_err(classify_commit_error)
    }

    fn cursor_size(&self) -> Size {
        self.cursor
    }
}

/// Wraps an already-imported driver handle so it can back a framebuffer.
struct ExternalBuffer {
    handle: drm::buffer::Handle,
    size: (u32, u32),
    pitch: u32,
}

impl Buffer for ExternalBuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Argb8888
    }

    fn pitch(&self) -> u32 {
        self.pitch
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.handle
    }
}

fn convert_mode(m: &control::Mode) -> Mode {
    Mode {
        width: m.size().0,
        height: m.size().1,
        refresh_mhz: m.vrefresh() * 1000,
        preferred: m.mode_type().contains(ModeTypeFlags::PREFERRED),
        name: m.name().to_string_lossy().into_owned(),
    }
}

fn plane_kind(card: &Card, handle: plane::Handle) -> Result<PlaneKind> {
    let props = card
        .get_properties(handle)
        .map_err(|e| Error::access("get plane properties", e))?;
    for (&id, &value) in props.iter() {
        let info = card
            .get_property(id)
            .map_err(|e| Error::access("get property info", e))?;
        if info.name().to_str() == Ok("type") {
            return Ok(if value == PlaneType::Primary as u64 {
                PlaneKind::Primary
            } else if value == PlaneType::Cursor as u64 {
                PlaneKind::Cursor
            } else {
                PlaneKind::Overlay
            });
        }
    }
    let plane: u32 = handle.into();
    warn!(plane, "plane carries no type property, assuming overlay");
    Ok(PlaneKind::Overlay)
}

fn convert_value(state: &Handles, value: PropValue) -> Result<property::Value<'static>> {
    Ok(match value {
        PropValue::Crtc(None) => property::Value::CRTC(None),
        PropValue::Crtc(Some(id)) => {
            let h = state
                .crtcs
                .get(&id.0)
                .copied()
                .ok_or(Error::Invariant("crtc id not on this device"))?;
            property::Value::CRTC(Some(h))
        }
        PropValue::Framebuffer(None) => property::Value::Framebuffer(None),
        PropValue::Framebuffer(Some(id)) => {
            let h = state
                .fbs
                .get(&id.0)
                .copied()
                .ok_or(Error::Invariant("framebuffer id not on this device"))?;
            property::Value::Framebuffer(Some(h))
        }
        PropValue::Blob(None) => property::Value::Unknown(0),
        PropValue::Blob(Some(blob)) => property::Value::Unknown(blob.0),
        PropValue::Boolean(b) => property::Value::Boolean(b),
        PropValue::Unsigned(v) => property::Value::UnsignedRange(v),
        PropValue::Signed(v) => property::Value::SignedRange(v),
    })
}

fn convert_flags(flags: CommitFlags) -> AtomicCommitFlags {
    let mut out = AtomicCommitFlags::empty();
    if flags.contains(CommitFlags::ALLOW_MODESET) {
        out |= AtomicCommitFlags::ALLOW_MODESET;
    }
    if flags.contains(CommitFlags::NONBLOCK) {
        out |= AtomicCommitFlags::NONBLOCK;
    }
    if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
        out |= AtomicCommitFlags::PAGE_FLIP_EVENT;
    }
    if flags.contains(CommitFlags::TEST_ONLY) {
        out |= AtomicCommitFlags::TEST_ONLY;
    }
    out
}

fn classify_commit_error(err: io::Error) -> Error {
    let busy = rustix::io::Errno::BUSY.raw_os_error();
    let again = rustix::io::Errno::AGAIN.raw_os_error();
    match err.raw_os_error() {
        Some(code) if code == busy || code == again => Error::Busy,
        _ => Error::access("atomic commit failed", err),
    }
}

fn cursor_limits(card: &Card) -> Size {
    let w = card
        .get_driver_capability(DriverCapability::CursorWidth)
        .unwrap_or(64);
    let h = card
        .get_driver_capability(DriverCapability::CursorHeight)
        .unwrap_or(64);
    Size::new(w as u32, h as u32)
}
