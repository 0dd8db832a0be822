//! In-memory display device for tests.
//!
//! Presents a fixed layout of n pipelines (connector, crtc and a
//! primary/overlay/cursor plane triple each), records every commit and
//! buffer operation, and can be programmed to fail commits.

use std::cell::RefCell;
use std::collections::HashMap;

use drm_fourcc::DrmFourcc;

use crate::error::{Error, Result};
use crate::geometry::{Point, Size};
use crate::hw::{
    BlobId, BufferDesc, BufferId, CommitFlags, ConnectorDesc, ConnectorId, CrtcId, DisplayControl,
    FbId, FbSource, ImageRef, Mode, ObjectId, PlaneDesc, PlaneId, PlaneKind, PropertyMeta,
    PropertyRequest, ResourceSnapshot,
};

#[derive(Debug, Clone)]
pub struct Upload {
    pub buffer: BufferId,
    pub origin: Point,
    pub size: Size,
}

#[derive(Default)]
struct Inner {
    connected: HashMap<ConnectorId, bool>,
    commits: Vec<(CommitFlags, PropertyRequest)>,
    commit_failures: Vec<Error>,
    fb_failures: Vec<Error>,
    next_fb: u32,
    live_fbs: Vec<FbId>,
    fbs_created: usize,
    fbs_destroyed: usize,
    next_blob: u64,
    live_blobs: Vec<BlobId>,
    next_buffer: u64,
    live_buffers: Vec<BufferId>,
    uploads: Vec<Upload>,
}

pub struct MockDevice {
    pipelines: usize,
    props: HashMap<ObjectId, Vec<PropertyMeta>>,
    inner: RefCell<Inner>,
}

const CONN_BASE: u32 = 30;
const CRTC_BASE: u32 = 40;
const PLANE_BASE: u32 = 50;

fn modes() -> Vec<Mode> {
    vec![
        Mode {
            width: 1920,
            height: 1080,
            refresh_mhz: 60_000,
            preferred: true,
            name: "1920x1080".into(),
        },
        Mode {
            width: 1280,
            height: 720,
            refresh_mhz: 60_000,
            preferred: false,
            name: "1280x720".into(),
        },
    ]
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_outputs(1)
    }

    pub fn with_outputs(pipelines: usize) -> Self {
        let mut props = HashMap::new();
        let mut next_prop = 1u32;
        let mut table = |obj: ObjectId, names: &[&str]| {
            let metas = names
                .iter()
                .map(|name| {
                    let meta = PropertyMeta {
                        id: crate::hw::PropertyId(next_prop),
                        name: (*name).to_string(),
                        value: 0,
                    };
                    next_prop += 1;
                    meta
                })
                .collect();
            props.insert(obj, metas);
        };

        for i in 0..pipelines {
            table(
                ObjectId::Connector(ConnectorId(CONN_BASE + i as u32)),
                &["CRTC_ID"],
            );
            table(
                ObjectId::Crtc(CrtcId(CRTC_BASE + i as u32)),
                &["ACTIVE", "MODE_ID"],
            );
            for p in 0..3 {
                table(
                    ObjectId::Plane(PlaneId(PLANE_BASE + (3 * i + p) as u32)),
                    &[
                        "type", "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H",
                        "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H",
                    ],
                );
            }
        }

        let mut inner = Inner {
            next_fb: 100,
            next_blob: 1,
            next_buffer: 0x1000,
            ..Inner::default()
        };
        for i in 0..pipelines {
            inner.connected.insert(ConnectorId(CONN_BASE + i as u32), true);
        }

        Self {
            pipelines,
            props,
            inner: RefCell::new(inner),
        }
    }

    pub fn connector(&self, pipeline: usize) -> ConnectorId {
        ConnectorId(CONN_BASE + pipeline as u32)
    }

    pub fn crtc(&self, pipeline: usize) -> CrtcId {
        CrtcId(CRTC_BASE + pipeline as u32)
    }

    pub fn set_connected(&self, conn: ConnectorId, connected: bool) {
        self.inner.borrow_mut().connected.insert(conn, connected);
    }

    /// Queues an error for the next commit; queued errors are consumed
    /// in order before commits succeed again.
    pub fn fail_next_commit(&self, err: Error) {
        self.inner.borrow_mut().commit_failures.push(err);
    }

    /// Queues an error for the next framebuffer creation.
    pub fn fail_next_framebuffer(&self, err: Error) {
        self.inner.borrow_mut().fb_failures.push(err);
    }

    pub fn commits(&self) -> usize {
        self.inner.borrow().commits.len()
    }

    pub fn last_commit(&self) -> Option<(CommitFlags, PropertyRequest)> {
        self.inner.borrow().commits.last().cloned()
    }

    pub fn framebuffers_created(&self) -> usize {
        self.inner.borrow().fbs_created
    }

    pub fn framebuffers_destroyed(&self) -> usize {
        self.inner.borrow().fbs_destroyed
    }

    pub fn live_framebuffers(&self) -> usize {
        self.inner.borrow().live_fbs.len()
    }

    pub fn live_blobs(&self) -> usize {
        self.inner.borrow().live_blobs.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.inner.borrow().live_buffers.len()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.inner.borrow().uploads.clone()
    }

    fn connector_desc(&self, pipeline: usize) -> ConnectorDesc {
        let id = self.connector(pipeline);
        ConnectorDesc {
            id,
            name: format!("HDMI-A-{}", pipeline + 1),
            connected: *self.inner.borrow().connected.get(&id).unwrap_or(&false),
            modes: modes(),
            crtcs: (0..self.pipelines).map(|i| self.crtc(i)).collect(),
        }
    }
}

impl DisplayControl for MockDevice {
    fn resources(&self) -> Result<ResourceSnapshot> {
        let connectors = (0..self.pipelines).map(|i| self.connector_desc(i)).collect();
        let crtcs = (0..self.pipelines).map(|i| self.crtc(i)).collect();
        let mut planes = Vec::new();
        for i in 0..self.pipelines {
            for (p, kind) in [PlaneKind::Primary, PlaneKind::Overlay, PlaneKind::Cursor]
                .into_iter()
                .enumerate()
            {
                planes.push(PlaneDesc {
                    id: PlaneId(PLANE_BASE + (3 * i + p) as u32),
                    kind,
                    possible_crtcs: vec![self.crtc(i)],
                });
            }
        }
        Ok(ResourceSnapshot {
            connectors,
            crtcs,
            planes,
        })
    }

    fn probe_connector(&self, conn: ConnectorId) -> Result<ConnectorDesc> {
        let pipeline = conn
            .0
            .checked_sub(CONN_BASE)
            .filter(|i| (*i as usize) < self.pipelines)
            .ok_or(Error::UnknownOutput)? as usize;
        Ok(self.connector_desc(pipeline))
    }

    fn object_properties(&self, obj: ObjectId) -> Result<Vec<PropertyMeta>> {
        self.props.get(&obj).cloned().ok_or(Error::UnknownOutput)
    }

    fn create_mode_blob(&self, _conn: ConnectorId, _mode: &Mode) -> Result<BlobId> {
        let mut inner = self.inner.borrow_mut();
        let blob = BlobId(inner.next_blob);
        inner.next_blob += 1;
        inner.live_blobs.push(blob);
        Ok(blob)
    }

    fn destroy_blob(&self, blob: BlobId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner
            .live_blobs
            .iter()
            .position(|b| *b == blob)
            .ok_or(Error::Invariant("destroying unknown blob"))?;
        inner.live_blobs.remove(pos);
        Ok(())
    }

    fn allocate_buffer(&self, size: Size, format: DrmFourcc) -> Result<BufferDesc> {
        let mut inner = self.inner.borrow_mut();
        let id = BufferId(inner.next_buffer);
        inner.next_buffer += 1;
        inner.live_buffers.push(id);
        Ok(BufferDesc {
            id,
            size,
            pitch: size.w * 4,
            format,
        })
    }

    fn write_buffer(&self, buffer: BufferId, origin: Point, image: ImageRef<'_>) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.live_buffers.contains(&buffer) {
            return Err(Error::UnknownBuffer(buffer.0));
        }
        inner.uploads.push(Upload {
            buffer,
            origin,
            size: image.size,
        });
        Ok(())
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner
            .live_buffers
            .iter()
            .position(|b| *b == buffer)
            .ok_or(Error::UnknownBuffer(buffer.0))?;
        inner.live_buffers.remove(pos);
        Ok(())
    }

    fn create_framebuffer(&self, _source: &FbSource) -> Result<FbId> {
        let mut inner = self.inner.borrow_mut();
        if !inner.fb_failures.is_empty() {
            return Err(inner.fb_failures.remove(0));
        }
        let fb = FbId(inner.next_fb);
        inner.next_fb += 1;
        inner.live_fbs.push(fb);
        inner.fbs_created += 1;
        Ok(fb)
    }

    fn destroy_framebuffer(&self, fb: FbId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner
            .live_fbs
            .iter()
            .position(|f| *f == fb)
            .ok_or(Error::Invariant("destroying unknown framebuffer"))?;
        inner.live_fbs.remove(pos);
        inner.fbs_destroyed += 1;
        Ok(())
    }

    fn commit(&self, flags: CommitFlags, req: &PropertyRequest) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if !inner.commit_failures.is_empty() {
            return Err(inner.commit_failures.remove(0));
        }
        inner.commits.push((flags, req.clone()));
        Ok(())
    }

    fn cursor_size(&self) -> Size {
        Size::new(64, 64)
    }
}
