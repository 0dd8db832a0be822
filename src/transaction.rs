//! Atomic transaction building.
//!
//! Serializes pending output states into one flat property request.
//! Routine page flips only touch the planes of the outputs being
//! committed; a modeset additionally programs the mode blob and link
//! routing, and an invalidated commit (first commit after taking over
//! the device, or after session resume) zeroes every object the
//! request does not claim, so stale state from a previous master
//! cannot linger.

use tracing::trace;

use crate::error::Result;
use crate::framebuffer::FbPool;
use crate::hw::{BlobId, ConnectorId, CrtcId, ObjectId, PropValue, PropertyRequest};
use crate::registry::Registry;
use crate::state::{OutputState, PowerMode};

/// Identity of a commit, shared by every output state the commit
/// carries. Completion events resolve back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

/// One output's contribution to a commit.
pub struct OutputAssignment<'a> {
    pub connector: ConnectorId,
    pub crtc: CrtcId,
    pub state: &'a OutputState,
    /// Present exactly when this commit programs a new mode.
    pub mode_blob: Option<BlobId>,
}

/// Serializes `outputs` into a property request. Returns the request
/// and whether it needs `ALLOW_MODESET`.
pub fn build_request(
    registry: &Registry,
    pool: &FbPool,
    outputs: &[OutputAssignment<'_>],
    invalidated: bool,
) -> Result<(PropertyRequest, bool)> {
    let mut req = PropertyRequest::new();
    let mut needs_modeset = invalidated;

    for out in outputs {
        let conn = ObjectId::Connector(out.connector);
        let crtc = ObjectId::Crtc(out.crtc);
        let on = out.state.power == PowerMode::On;
        if out.mode_blob.is_some() || !on {
            needs_modeset = true;
        }

        req.add(
            conn,
            registry.prop(conn, "CRTC_ID")?,
            PropValue::Crtc(on.then_some(out.crtc)),
        );
        req.add(crtc, registry.prop(crtc, "ACTIVE")?, PropValue::Boolean(on));
        if let Some(blob) = out.mode_blob {
            req.add(crtc, registry.prop(crtc, "MODE_ID")?, PropValue::Blob(Some(blob)));
        } else if !on {
            req.add(crtc, registry.prop(crtc, "MODE_ID")?, PropValue::Blob(None));
        }

        for plane in out.state.planes() {
            let obj = ObjectId::Plane(registry.plane_id(plane.plane));
            match plane.fb {
                Some(key) => {
                    let fb = pool.fb(key)?;
                    req.add(obj, registry.prop(obj, "FB_ID")?, PropValue::Framebuffer(Some(fb)));
                    req.add(obj, registry.prop(obj, "CRTC_ID")?, PropValue::Crtc(Some(out.crtc)));
                    req.add(obj, registry.prop(obj, "SRC_X")?, PropValue::Unsigned(plane.src.x));
                    req.add(obj, registry.prop(obj, "SRC_Y")?, PropValue::Unsigned(plane.src.y));
                    req.add(obj, registry.prop(obj, "SRC_W")?, PropValue::Unsigned(plane.src.w));
                    req.add(obj, registry.prop(obj, "SRC_H")?, PropValue::Unsigned(plane.src.h));
                    req.add(obj, registry.prop(obj, "CRTC_X")?, PropValue::Signed(plane.dst.x as i64));
                    req.add(obj, registry.prop(obj, "CRTC_Y")?, PropValue::Signed(plane.dst.y as i64));
                    req.add(obj, registry.prop(obj, "CRTC_W")?, PropValue::Unsigned(plane.dst.w as u64));
                    req.add(obj, registry.prop(obj, "CRTC_H")?, PropValue::Unsigned(plane.dst.h as u64));
                }
                None => append_plane_reset(registry, &mut req, obj)?,
            }
        }
    }

    if invalidated {
        append_unclaimed_resets(registry, &mut req, outputs)?;
    }

    trace!(
        entries = req.entries().len(),
        needs_modeset,
        invalidated,
        "built atomic request"
    );
    Ok((req, needs_modeset))
}

/// Detaches a plane and zeroes its scanout rectangles.
fn append_plane_reset(registry: &Registry, req: &mut PropertyRequest, obj: ObjectId) -> Result<()> {
    req.add(obj, registry.prop(obj, "FB_ID")?, PropValue::Framebuffer(None));
    req.add(obj, registry.prop(obj, "CRTC_ID")?, PropValue::Crtc(None));
    req.add(obj, registry.prop(obj, "SRC_X")?, PropValue::Unsigned(0));
    req.add(obj, registry.prop(obj, "SRC_Y")?, PropValue::Unsigned(0));
    req.add(obj, registry.prop(obj, "SRC_W")?, PropValue::Unsigned(0));
    req.add(obj, registry.prop(obj, "SRC_H")?, PropValue::Unsigned(0));
    req.add(obj, registry.prop(obj, "CRTC_X")?, PropValue::Signed(0));
    req.add(obj, registry.prop(obj, "CRTC_Y")?, PropValue::Signed(0));
    req.add(obj, registry.prop(obj, "CRTC_W")?, PropValue::Unsigned(0));
    req.add(obj, registry.prop(obj, "CRTC_H")?, PropValue::Unsigned(0));
    Ok(())
}

/// Resets every object the commit does not cover.
fn append_unclaimed_resets(
    registry: &Registry,
    req: &mut PropertyRequest,
    outputs: &[OutputAssignment<'_>],
) -> Result<()> {
    let covered_conn: Vec<ConnectorId> = outputs.iter().map(|o| o.connector).collect();
    let covered_crtc: Vec<CrtcId> = outputs.iter().map(|o| o.crtc).collect();
    let covered_planes: Vec<_> = outputs
        .iter()
        .flat_map(|o| o.state.planes().iter().map(|p| p.plane))
        .collect();

    for entry in registry.connectors() {
        if !covered_conn.contains(&entry.desc.id) {
            let obj = ObjectId::Connector(entry.desc.id);
            req.add(obj, registry.prop(obj, "CRTC_ID")?, PropValue::Crtc(None));
        }
    }
    for entry in registry.crtcs() {
        if !covered_crtc.contains(&entry.id) {
            let obj = ObjectId::Crtc(entry.id);
            req.add(obj, registry.prop(obj, "ACTIVE")?, PropValue::Boolean(false));
            req.add(obj, registry.prop(obj, "MODE_ID")?, PropValue::Blob(None));
        }
    }
    for (idx, entry) in registry.planes() {
        if !covered_planes.contains(&idx) {
            append_plane_reset(registry, req, ObjectId::Plane(entry.desc.id))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::FbKind;
    use crate::geometry::{FixedRect, Rect, Size, to_fixed};
    use crate::hw::mock::MockDevice;
    use crate::hw::{BufferId, FbSource, PlaneKind};
    use crate::registry::OutputIdx;
    use crate::state::StateSeq;

    struct Fixture {
        dev: MockDevice,
        registry: Registry,
        pool: FbPool,
        conn: ConnectorId,
        crtc: CrtcId,
        primary: crate::registry::PlaneIdx,
    }

    fn fixture() -> Fixture {
        let dev = MockDevice::with_outputs(2);
        let mut registry = Registry::enumerate(&dev).unwrap();
        let conn = dev.connector(0);
        let crtc = registry.claim_pipeline(conn, OutputIdx(0)).unwrap();
        let primary = registry.claim_plane(PlaneKind::Primary, crtc, OutputIdx(0)).unwrap();
        Fixture {
            dev,
            registry,
            pool: FbPool::new(),
            conn,
            crtc,
            primary,
        }
    }

    fn on_state(f: &mut Fixture) -> OutputState {
        let source = FbSource::External {
            handle: BufferId(1),
            size: Size::new(1920, 1080),
            pitch: 1920 * 4,
            bpp: 32,
            depth: 24,
        };
        let key = f
            .pool
            .acquire(&f.dev, &source, Size::new(1920, 1080), FbKind::Swapchain)
            .unwrap();
        let mut state = OutputState::off(StateSeq(1), [f.primary]);
        state.power = PowerMode::On;
        let plane = state.plane_mut(f.primary);
        plane.fb = Some(key);
        plane.src = FixedRect::from_size(Size::new(1920, 1080));
        plane.dst = Rect::new(0, 0, 1920, 1080);
        state
    }

    #[test]
    fn page_flip_request_programs_the_plane() {
        let mut f = fixture();
        let state = on_state(&mut f);
        let (req, modeset) = build_request(
            &f.registry,
            &f.pool,
            &[OutputAssignment {
                connector: f.conn,
                crtc: f.crtc,
                state: &state,
                mode_blob: None,
            }],
            false,
        )
        .unwrap();
        assert!(!modeset);

        let conn = ObjectId::Connector(f.conn);
        let crtc = ObjectId::Crtc(f.crtc);
        let plane = ObjectId::Plane(f.registry.plane_id(f.primary));
        let prop = |obj, name| f.registry.prop(obj, name).unwrap();
        assert_eq!(req.get(conn, prop(conn, "CRTC_ID")), Some(PropValue::Crtc(Some(f.crtc))));
        assert_eq!(req.get(crtc, prop(crtc, "ACTIVE")), Some(PropValue::Boolean(true)));
        assert_eq!(req.get(crtc, prop(crtc, "MODE_ID")), None);
        assert_eq!(
            req.get(plane, prop(plane, "SRC_W")),
            Some(PropValue::Unsigned(to_fixed(1920)))
        );
        assert_eq!(
            req.get(plane, prop(plane, "CRTC_H")),
            Some(PropValue::Unsigned(1080))
        );
    }

    #[test]
    fn mode_blob_and_power_off_force_modeset() {
        let mut f = fixture();
        let state = on_state(&mut f);
        let (_, modeset) = build_request(
            &f.registry,
            &f.pool,
            &[OutputAssignment {
                connector: f.conn,
                crtc: f.crtc,
                state: &state,
                mode_blob: Some(BlobId(5)),
            }],
            false,
        )
        .unwrap();
        assert!(modeset);

        let off = OutputState::off(StateSeq(2), [f.primary]);
        let (req, modeset) = build_request(
            &f.registry,
            &f.pool,
            &[OutputAssignment {
                connector: f.conn,
                crtc: f.crtc,
                state: &off,
                mode_blob: None,
            }],
            false,
        )
        .unwrap();
        assert!(modeset);
        let conn = ObjectId::Connector(f.conn);
        let crtc = ObjectId::Crtc(f.crtc);
        assert_eq!(
            req.get(conn, f.registry.prop(conn, "CRTC_ID").unwrap()),
            Some(PropValue::Crtc(None))
        );
        assert_eq!(
            req.get(crtc, f.registry.prop(crtc, "MODE_ID").unwrap()),
            Some(PropValue::Blob(None))
        );
        let plane = ObjectId::Plane(f.registry.plane_id(f.primary));
        assert_eq!(
            req.get(plane, f.registry.prop(plane, "FB_ID").unwrap()),
            Some(PropValue::Framebuffer(None))
        );
    }

    #[test]
    fn invalidated_commit_resets_uncovered_objects() {
        let mut f = fixture();
        let state = on_state(&mut f);
        let (req, modeset) = build_request(
            &f.registry,
            &f.pool,
            &[OutputAssignment {
                connector: f.conn,
                crtc: f.crtc,
                state: &state,
                mode_blob: Some(BlobId(5)),
            }],
            true,
        )
        .unwrap();
        assert!(modeset);

        // The second pipeline's objects get zeroed.
        let other_conn = f.dev.connector(1);
        let conn = ObjectId::Connector(other_conn);
        assert_eq!(
            req.get(conn, f.registry.prop(conn, "CRTC_ID").unwrap()),
            Some(PropValue::Crtc(None))
        );
        let other_crtc = f
            .registry
            .crtcs()
            .map(|c| c.id)
            .find(|id| *id != f.crtc)
            .unwrap();
        let crtc = ObjectId::Crtc(other_crtc);
        assert_eq!(
            req.get(crtc, f.registry.prop(crtc, "ACTIVE").unwrap()),
            Some(PropValue::Boolean(false))
        );
        // The committed pipeline keeps its programming.
        let plane = ObjectId::Plane(f.registry.plane_id(f.primary));
        assert!(matches!(
            req.get(plane, f.registry.prop(plane, "FB_ID").unwrap()),
            Some(PropValue::Framebuffer(Some(_)))
        ));
    }
}
