//! Display resource registry.
//!
//! Enumerates connectors, crtcs and planes once at startup, caches the
//! property-name to property-id tables the atomic requests need, and
//! tracks which output owns which crtc and planes. Claims are
//! exclusive; an object is never shared between outputs.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::hw::{
    ConnectorDesc, ConnectorId, CrtcId, DisplayControl, ObjectId, PlaneDesc, PlaneId, PlaneKind,
    PropertyId,
};

/// Index of an output slot in the engine. Plane and crtc claims point
/// back at outputs through these instead of references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputIdx(pub usize);

/// Index into the registry's plane table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneIdx(pub usize);

#[derive(Debug, Default)]
struct Props {
    by_name: HashMap<String, PropertyId>,
}

impl Props {
    fn require(&self, obj: ObjectId, name: &'static str) -> Result<PropertyId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or(Error::UnknownProperty { obj, name })
    }
}

#[derive(Debug)]
pub struct ConnectorEntry {
    pub desc: ConnectorDesc,
    props: Props,
    pub claimed_by: Option<OutputIdx>,
}

#[derive(Debug)]
pub struct CrtcEntry {
    pub id: CrtcId,
    props: Props,
    pub claimed_by: Option<OutputIdx>,
}

#[derive(Debug)]
pub struct PlaneEntry {
    pub desc: PlaneDesc,
    props: Props,
    pub claimed_by: Option<OutputIdx>,
}

#[derive(Debug, Default)]
pub struct Registry {
    connectors: Vec<ConnectorEntry>,
    crtcs: Vec<CrtcEntry>,
    planes: Vec<PlaneEntry>,
}

impl Registry {
    pub fn enumerate<D: DisplayControl>(dev: &D) -> Result<Self> {
        let snapshot = dev.resources()?;

        let mut connectors = Vec::with_capacity(snapshot.connectors.len());
        for desc in snapshot.connectors {
            let props = load_props(dev, ObjectId::Connector(desc.id))?;
            connectors.push(ConnectorEntry {
                desc,
                props,
                claimed_by: None,
            });
        }

        let mut crtcs = Vec::with_capacity(snapshot.crtcs.len());
        for id in snapshot.crtcs {
            let props = load_props(dev, ObjectId::Crtc(id))?;
            crtcs.push(CrtcEntry {
                id,
                props,
                claimed_by: None,
            });
        }

        let mut planes = Vec::with_capacity(snapshot.planes.len());
        for desc in snapshot.planes {
            let props = load_props(dev, ObjectId::Plane(desc.id))?;
            planes.push(PlaneEntry {
                desc,
                props,
                claimed_by: None,
            });
        }

        debug!(
            connectors = connectors.len(),
            crtcs = crtcs.len(),
            planes = planes.len(),
            "enumerated display resources"
        );
        Ok(Self {
            connectors,
            crtcs,
            planes,
        })
    }

    /// Re-probes one connector after a hotplug event and stores the
    /// fresh description. The claim, if any, is untouched.
    pub fn refresh_connector<D: DisplayControl>(
        &mut self,
        dev: &D,
        conn: ConnectorId,
    ) -> Result<&ConnectorDesc> {
        let desc = dev.probe_connector(conn)?;
        let entry = self
            .connectors
            .iter_mut()
            .find(|c| c.desc.id == conn)
            .ok_or(Error::UnknownOutput)?;
        entry.desc = desc;
        Ok(&entry.desc)
    }

    pub fn connector(&self, conn: ConnectorId) -> Result<&ConnectorEntry> {
        self.connectors
            .iter()
            .find(|c| c.desc.id == conn)
            .ok_or(Error::UnknownOutput)
    }

    pub fn connector_by_name(&self, name: &str) -> Option<&ConnectorEntry> {
        self.connectors.iter().find(|c| c.desc.name == name)
    }

    pub fn connectors(&self) -> impl Iterator<Item = &ConnectorEntry> {
        self.connectors.iter()
    }

    pub fn crtcs(&self) -> impl Iterator<Item = &CrtcEntry> {
        self.crtcs.iter()
    }

    pub fn planes(&self) -> impl Iterator<Item = (PlaneIdx, &PlaneEntry)> {
        self.planes.iter().enumerate().map(|(i, p)| (PlaneIdx(i), p))
    }

    pub fn plane(&self, idx: PlaneIdx) -> &PlaneEntry {
        &self.planes[idx.0]
    }

    /// Claims the connector and a free compatible crtc for `out`.
    pub fn claim_pipeline(&mut self, conn: ConnectorId, out: OutputIdx) -> Result<CrtcId> {
        let entry = self
            .connectors
            .iter_mut()
            .find(|c| c.desc.id == conn)
            .ok_or(Error::UnknownOutput)?;
        if entry.claimed_by.is_some() {
            return Err(Error::Invariant("connector is already claimed"));
        }
        let compatible = entry.desc.crtcs.clone();
        let crtc = self
            .crtcs
            .iter_mut()
            .find(|c| c.claimed_by.is_none() && compatible.contains(&c.id))
            .ok_or(Error::NoCrtc(conn))?;
        crtc.claimed_by = Some(out);
        let crtc_id = crtc.id;
        // Borrow of self.crtcs ended; claim the connector now.
        self.connectors
            .iter_mut()
            .find(|c| c.desc.id == conn)
            .expect("looked up above")
            .claimed_by = Some(out);
        debug!(?conn, crtc = crtc_id.0, output = out.0, "claimed pipeline");
        Ok(crtc_id)
    }

    /// Claims a free plane of `kind` that can scan out on `crtc`.
    pub fn claim_plane(&mut self, kind: PlaneKind, crtc: CrtcId, out: OutputIdx) -> Result<PlaneIdx> {
        let (idx, entry) = self
            .planes
            .iter_mut()
            .enumerate()
            .find(|(_, p)| {
                p.claimed_by.is_none()
                    && p.desc.kind == kind
                    && p.desc.possible_crtcs.contains(&crtc)
            })
            .ok_or(Error::NoPlane { kind, crtc })?;
        entry.claimed_by = Some(out);
        debug!(plane = entry.desc.id.0, ?kind, crtc = crtc.0, output = out.0, "claimed plane");
        Ok(PlaneIdx(idx))
    }

    /// Releases every claim held by `out`.
    pub fn release_claims(&mut self, out: OutputIdx) {
        for c in &mut self.connectors {
            if c.claimed_by == Some(out) {
                c.claimed_by = None;
            }
        }
        for c in &mut self.crtcs {
            if c.claimed_by == Some(out) {
                c.claimed_by = None;
            }
        }
        for p in &mut self.planes {
            if p.claimed_by == Some(out) {
                p.claimed_by = None;
            }
        }
    }

    /// Cached property id for (`obj`, `name`).
    pub fn prop(&self, obj: ObjectId, name: &'static str) -> Result<PropertyId> {
        let props = match obj {
            ObjectId::Connector(id) => {
                &self
                    .connectors
                    .iter()
                    .find(|c| c.desc.id == id)
                    .ok_or(Error::UnknownOutput)?
                    .props
            }
            ObjectId::Crtc(id) => {
                &self
                    .crtcs
                    .iter()
                    .find(|c| c.id == id)
                    .ok_or(Error::UnknownOutput)?
                    .props
            }
            ObjectId::Plane(id) => {
                &self
                    .planes
                    .iter()
                    .find(|p| p.desc.id == id)
                    .ok_or(Error::UnknownOutput)?
                    .props
            }
        };
        props.require(obj, name)
    }

    pub fn plane_id(&self, idx: PlaneIdx) -> PlaneId {
        self.planes[idx.0].desc.id
    }

    pub fn plane_kind(&self, idx: PlaneIdx) -> PlaneKind {
        self.planes[idx.0].desc.kind
    }
}

fn load_props<D: DisplayControl>(dev: &D, obj: ObjectId) -> Result<Props> {
    let mut by_name = HashMap::new();
    for meta in dev.object_properties(obj)? {
        by_name.insert(meta.name, meta.id);
    }
    Ok(Props { by_name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockDevice;

    #[test]
    fn pipeline_claims_are_exclusive() {
        let dev = MockDevice::with_outputs(2);
        let mut reg = Registry::enumerate(&dev).unwrap();
        let conn = dev.connector(0);
        let crtc = reg.claim_pipeline(conn, OutputIdx(0)).unwrap();
        assert!(matches!(
            reg.claim_pipeline(conn, OutputIdx(1)),
            Err(Error::Invariant(_))
        ));
        // The second connector cannot take the claimed crtc.
        let other = reg.claim_pipeline(dev.connector(1), OutputIdx(1)).unwrap();
        assert_ne!(crtc, other);
    }

    #[test]
    fn plane_claims_respect_kind_and_crtc() {
        let dev = MockDevice::with_outputs(1);
        let mut reg = Registry::enumerate(&dev).unwrap();
        let crtc = reg.claim_pipeline(dev.connector(0), OutputIdx(0)).unwrap();
        let primary = reg.claim_plane(PlaneKind::Primary, crtc, OutputIdx(0)).unwrap();
        assert_eq!(reg.plane_kind(primary), PlaneKind::Primary);
        // Only one primary per crtc in the mock layout.
        assert!(matches!(
            reg.claim_plane(PlaneKind::Primary, crtc, OutputIdx(0)),
            Err(Error::NoPlane { .. })
        ));
        let cursor = reg.claim_plane(PlaneKind::Cursor, crtc, OutputIdx(0)).unwrap();
        assert_ne!(primary, cursor);
    }

    #[test]
    fn release_frees_every_claim() {
        let dev = MockDevice::with_outputs(1);
        let mut reg = Registry::enumerate(&dev).unwrap();
        let conn = dev.connector(0);
        let crtc = reg.claim_pipeline(conn, OutputIdx(0)).unwrap();
        reg.claim_plane(PlaneKind::Primary, crtc, OutputIdx(0)).unwrap();
        reg.release_claims(OutputIdx(0));
        assert!(reg.connector(conn).unwrap().claimed_by.is_none());
        assert_eq!(reg.claim_pipeline(conn, OutputIdx(1)).unwrap(), crtc);
        reg.claim_plane(PlaneKind::Primary, crtc, OutputIdx(1)).unwrap();
    }

    #[test]
    fn property_lookup_reports_missing_names() {
        let dev = MockDevice::with_outputs(1);
        let reg = Registry::enumerate(&dev).unwrap();
        let crtc = reg.crtcs().next().unwrap().id;
        assert!(reg.prop(ObjectId::Crtc(crtc), "ACTIVE").is_ok());
        assert!(matches!(
            reg.prop(ObjectId::Crtc(crtc), "GAMMA_LUT"),
            Err(Error::UnknownProperty { .. })
        ));
    }
}
