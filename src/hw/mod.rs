//! Device abstraction for atomic modesetting.
//!
//! The engine talks to hardware exclusively through [`DisplayControl`]:
//! typed object ids, a flat property request and a handful of buffer
//! operations. `drm.rs` implements it over a real KMS device node;
//! the test backend in `mock.rs` records requests instead.

use std::rc::Rc;
use std::time::Duration;

use drm_fourcc::DrmFourcc;

use crate::error::Result;
use crate::geometry::{Point, Size};

pub mod drm;
#[cfg(test)]
pub mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrtcId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyId(pub u32);

/// A kernel property blob, currently only used for modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub u64);

/// A hardware framebuffer object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FbId(pub u32);

/// Identity of an underlying pixel buffer, stable across framebuffer
/// creations. For dumb buffers this is the driver handle; imported
/// client buffers carry their own id from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Connector(ConnectorId),
    Crtc(CrtcId),
    Plane(PlaneId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    Primary,
    Overlay,
    Cursor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    pub width: u16,
    pub height: u16,
    /// Vertical refresh in millihertz.
    pub refresh_mhz: u32,
    pub preferred: bool,
    pub name: String,
}

impl Mode {
    pub fn size(&self) -> Size {
        Size::new(self.width as u32, self.height as u32)
    }

    /// Nominal frame duration, rounded to the nearest nanosecond.
    pub fn refresh_interval(&self) -> Duration {
        if self.refresh_mhz == 0 {
            // Mode lists from broken EDIDs can carry a zero refresh.
            return Duration::from_nanos(16_666_667);
        }
        let mhz = self.refresh_mhz as u64;
        Duration::from_nanos((1_000_000_000_000 + mhz / 2) / mhz)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorDesc {
    pub id: ConnectorId,
    /// "HDMI-A-1" style name, stable across replug.
    pub name: String,
    pub connected: bool,
    pub modes: Vec<Mode>,
    /// Crtcs reachable through any of the connector's encoders.
    pub crtcs: Vec<CrtcId>,
}

#[derive(Debug, Clone)]
pub struct PlaneDesc {
    pub id: PlaneId,
    pub kind: PlaneKind,
    pub possible_crtcs: Vec<CrtcId>,
}

#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub connectors: Vec<ConnectorDesc>,
    pub crtcs: Vec<CrtcId>,
    pub planes: Vec<PlaneDesc>,
}

#[derive(Debug, Clone)]
pub struct PropertyMeta {
    pub id: PropertyId,
    pub name: String,
    pub value: u64,
}

/// A value for one property slot in an atomic request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropValue {
    Crtc(Option<CrtcId>),
    Framebuffer(Option<FbId>),
    Blob(Option<BlobId>),
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        /// Permit a full modeset; without it the kernel rejects
        /// commits that would retrain the link.
        const ALLOW_MODESET = 1 << 0;
        /// Return instead of blocking until vblank.
        const NONBLOCK = 1 << 1;
        /// Deliver a page-flip event per affected crtc.
        const PAGE_FLIP_EVENT = 1 << 2;
        /// Validate only, commit nothing.
        const TEST_ONLY = 1 << 3;
    }
}

/// A flat list of property assignments, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct PropertyRequest {
    entries: Vec<(ObjectId, PropertyId, PropValue)>,
}

impl PropertyRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, obj: ObjectId, prop: PropertyId, value: PropValue) {
        self.entries.push((obj, prop, value));
    }

    pub fn entries(&self) -> &[(ObjectId, PropertyId, PropValue)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The value assigned to (`obj`, `prop`), if any. Later entries
    /// win, matching kernel semantics.
    pub fn get(&self, obj: ObjectId, prop: PropertyId) -> Option<PropValue> {
        self.entries
            .iter()
            .rev()
            .find(|(o, p, _)| *o == obj && *p == prop)
            .map(|(_, _, v)| *v)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub id: BufferId,
    pub size: Size,
    pub pitch: u32,
    pub format: DrmFourcc,
}

/// What a framebuffer object is created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbSource {
    /// A dumb buffer previously allocated on this device.
    Dumb(BufferId),
    /// A buffer owned elsewhere, attached zero-copy.
    External {
        handle: BufferId,
        size: Size,
        pitch: u32,
        bpp: u32,
        depth: u32,
    },
}

impl FbSource {
    pub fn buffer(&self) -> BufferId {
        match *self {
            FbSource::Dumb(id) => id,
            FbSource::External { handle, .. } => handle,
        }
    }
}

/// Borrowed ARGB8888 pixels for buffer uploads.
#[derive(Debug, Clone, Copy)]
pub struct ImageRef<'a> {
    pub size: Size,
    /// Row stride in bytes.
    pub stride: u32,
    pub data: &'a [u8],
}

/// Everything the commit engine needs from a display device.
pub trait DisplayControl {
    fn resources(&self) -> Result<ResourceSnapshot>;

    /// Re-probes a single connector, forcing a fresh EDID read.
    fn probe_connector(&self, conn: ConnectorId) -> Result<ConnectorDesc>;

    fn object_properties(&self, obj: ObjectId) -> Result<Vec<PropertyMeta>>;

    fn create_mode_blob(&self, conn: ConnectorId, mode: &Mode) -> Result<BlobId>;

    fn destroy_blob(&self, blob: BlobId) -> Result<()>;

    fn allocate_buffer(&self, size: Size, format: DrmFourcc) -> Result<BufferDesc>;

    fn write_buffer(&self, buffer: BufferId, origin: Point, image: ImageRef<'_>) -> Result<()>;

    fn release_buffer(&self, buffer: BufferId) -> Result<()>;

    fn create_framebuffer(&self, source: &FbSource) -> Result<FbId>;

    fn destroy_framebuffer(&self, fb: FbId) -> Result<()>;

    fn commit(&self, flags: CommitFlags, req: &PropertyRequest) -> Result<()>;

    /// Maximum cursor plane buffer size supported by the driver.
    fn cursor_size(&self) -> Size;
}

impl<D: DisplayControl + ?Sized> DisplayControl for Rc<D> {
    fn resources(&self) -> Result<ResourceSnapshot> {
        (**self).resources()
    }

    fn probe_connector(&self, conn: ConnectorId) -> Result<ConnectorDesc> {
        (**self).probe_connector(conn)
    }

    fn object_properties(&self, obj: ObjectId) -> Result<Vec<PropertyMeta>> {
        (**self).object_properties(obj)
    }

    fn create_mode_blob(&self, conn: ConnectorId, mode: &Mode) -> Result<BlobId> {
        (**self).create_mode_blob(conn, mode)
    }

    fn destroy_blob(&self, blob: BlobId) -> Result<()> {
        (**self).destroy_blob(blob)
    }

    fn allocate_buffer(&self, size: Size, format: DrmFourcc) -> Result<BufferDesc> {
        (**self).allocate_buffer(size, format)
    }

    fn write_buffer(&self, buffer: BufferId, origin: Point, image: ImageRef<'_>) -> Result<()> {
        (**self).write_buffer(buffer, origin, image)
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<()> {
        (**self).release_buffer(buffer)
    }

    fn create_framebuffer(&self, source: &FbSource) -> Result<FbId> {
        (**self).create_framebuffer(source)
    }

    fn destroy_framebuffer(&self, fb: FbId) -> Result<()> {
        (**self).destroy_framebuffer(fb)
    }

    fn commit(&self, flags: CommitFlags, req: &PropertyRequest) -> Result<()> {
        (**self).commit(flags, req)
    }

    fn cursor_size(&self) -> Size {
        (**self).cursor_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(mhz: u32) -> Mode {
        Mode {
            width: 1920,
            height: 1080,
            refresh_mhz: mhz,
            preferred: true,
            name: "1920x1080".into(),
        }
    }

    #[test]
    fn refresh_interval_rounds_to_nearest_ns() {
        assert_eq!(mode(60_000).refresh_interval(), Duration::from_nanos(16_666_667));
        assert_eq!(mode(144_000).refresh_interval(), Duration::from_nanos(6_944_444));
        assert_eq!(mode(59_940).refresh_interval(), Duration::from_nanos(16_683_350));
    }

    #[test]
    fn zero_refresh_falls_back_to_60hz() {
        assert_eq!(mode(0).refresh_interval(), Duration::from_nanos(16_666_667));
    }

    #[test]
    fn later_request_entries_win() {
        let obj = ObjectId::Crtc(CrtcId(7));
        let prop = PropertyId(3);
        let mut req = PropertyRequest::new();
        req.add(obj, prop, PropValue::Boolean(true));
        req.add(obj, prop, PropValue::Boolean(false));
        assert_eq!(req.get(obj, prop), Some(PropValue::Boolean(false)));
        assert_eq!(req.get(obj, PropertyId(4)), None);
    }
}
