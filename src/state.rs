//! Copy-on-write output state.
//!
//! An [`OutputState`] is an immutable-once-committed snapshot of what
//! one output's planes scan out. Mutation always goes through
//! [`OutputState::duplicate`]: the pending copy is edited and
//! committed, and the previously committed snapshot is kept alive
//! until the hardware confirms the flip away from it. Framebuffer
//! references are counted per snapshot, so a buffer lives exactly as
//! long as some snapshot can still be on screen with it.

use crate::error::Result;
use crate::framebuffer::{FbKey, FbPool};
use crate::geometry::{FixedRect, Rect};
use crate::hw::DisplayControl;
use crate::registry::PlaneIdx;
use crate::scene::ViewId;

/// Monotonic identity of a state snapshot. Lets the engine tell "same
/// snapshot" from "equal-looking copy" when enforcing release rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateSeq(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    On,
    Off,
}

/// How plane assignments carry over into a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneCopy {
    /// Start from cleared planes; repaint reassigns them.
    Reset,
    /// Keep the assignments and take a reference on each framebuffer.
    Carry,
}

#[derive(Debug)]
pub struct PlaneState {
    pub plane: PlaneIdx,
    pub fb: Option<FbKey>,
    pub src: FixedRect,
    pub dst: Rect,
    /// Scene view this assignment came from, for damage attribution.
    pub view: Option<ViewId>,
    /// Set once the commit carrying this assignment has completed.
    pub complete: bool,
}

impl PlaneState {
    pub fn cleared(plane: PlaneIdx) -> Self {
        Self {
            plane,
            fb: None,
            src: FixedRect::default(),
            dst: Rect::default(),
            view: None,
            complete: false,
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.fb.is_none()
    }
}

#[derive(Debug)]
pub struct OutputState {
    pub seq: StateSeq,
    pub power: PowerMode,
    planes: Vec<PlaneState>,
}

impl OutputState {
    /// A powered-off state with a cleared slot per claimed plane.
    pub fn off(seq: StateSeq, planes: impl IntoIterator<Item = PlaneIdx>) -> Self {
        Self {
            seq,
            power: PowerMode::Off,
            planes: planes.into_iter().map(PlaneState::cleared).collect(),
        }
    }

    pub fn planes(&self) -> &[PlaneState] {
        &self.planes
    }

    pub fn plane(&self, idx: PlaneIdx) -> Option<&PlaneState> {
        self.planes.iter().find(|p| p.plane == idx)
    }

    /// Mutable slot for `idx`, allocated on first touch.
    pub fn plane_mut(&mut self, idx: PlaneIdx) -> &mut PlaneState {
        if let Some(pos) = self.planes.iter().position(|p| p.plane == idx) {
            return &mut self.planes[pos];
        }
        self.planes.push(PlaneState::cleared(idx));
        self.planes.last_mut().expect("just pushed")
    }

    /// Copies this snapshot under a fresh identity. With
    /// [`PlaneCopy::Carry`] each assigned framebuffer gains a
    /// reference; with [`PlaneCopy::Reset`] the copy starts cleared.
    /// `complete` never carries over.
    pub fn duplicate(&self, seq: StateSeq, pool: &mut FbPool, copy: PlaneCopy) -> Result<Self> {
        let mut planes = Vec::with_capacity(self.planes.len());
        for p in &self.planes {
            let fb = match (copy, p.fb) {
                (PlaneCopy::Carry, Some(key)) => {
                    pool.retain(key)?;
                    Some(key)
                }
                _ => None,
            };
            planes.push(match copy {
                PlaneCopy::Reset => PlaneState::cleared(p.plane),
                PlaneCopy::Carry => PlaneState {
                    plane: p.plane,
                    fb,
                    src: p.src,
                    dst: p.dst,
                    view: p.view,
                    complete: false,
                },
            });
        }
        Ok(Self {
            seq,
            power: self.power,
            planes,
        })
    }

    /// Drops the snapshot's framebuffer references. The caller is
    /// responsible for only releasing snapshots the hardware can no
    /// longer be scanning out.
    pub fn release<D: DisplayControl>(self, pool: &mut FbPool, dev: &D) -> Result<()> {
        for p in self.planes {
            if let Some(key) = p.fb {
                pool.release(dev, key)?;
            }
        }
        Ok(())
    }

    pub fn mark_complete(&mut self) {
        for p in &mut self.planes {
            p.complete = true;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.planes.iter().all(|p| p.complete)
    }

    pub fn references(&self, key: FbKey) -> bool {
        self.planes.iter().any(|p| p.fb == Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::FbKind;
    use crate::geometry::Size;
    use crate::hw::mock::MockDevice;
    use crate::hw::{BufferId, FbSource};

    fn assigned_state(dev: &MockDevice, pool: &mut FbPool) -> (OutputState, FbKey) {
        let source = FbSource::External {
            handle: BufferId(1),
            size: Size::new(800, 600),
            pitch: 800 * 4,
            bpp: 32,
            depth: 24,
        };
        let key = pool
            .acquire(dev, &source, Size::new(800, 600), FbKind::Swapchain)
            .unwrap();
        let mut state = OutputState::off(StateSeq(0), [PlaneIdx(0), PlaneIdx(1)]);
        state.power = PowerMode::On;
        let plane = state.plane_mut(PlaneIdx(0));
        plane.fb = Some(key);
        plane.dst = Rect::new(0, 0, 800, 600);
        (state, key)
    }

    #[test]
    fn carry_duplicate_takes_references() {
        let dev = MockDevice::new();
        let mut pool = FbPool::new();
        let (state, key) = assigned_state(&dev, &mut pool);
        let copy = state.duplicate(StateSeq(1), &mut pool, PlaneCopy::Carry).unwrap();
        assert_eq!(pool.refs(key).unwrap(), 2);
        assert!(copy.references(key));
        assert_eq!(copy.power, PowerMode::On);
        assert!(!copy.plane(PlaneIdx(0)).unwrap().complete);
        copy.release(&mut pool, &dev).unwrap();
        assert_eq!(pool.refs(key).unwrap(), 1);
    }

    #[test]
    fn reset_duplicate_starts_cleared() {
        let dev = MockDevice::new();
        let mut pool = FbPool::new();
        let (state, key) = assigned_state(&dev, &mut pool);
        let copy = state.duplicate(StateSeq(1), &mut pool, PlaneCopy::Reset).unwrap();
        assert_eq!(pool.refs(key).unwrap(), 1);
        assert!(copy.plane(PlaneIdx(0)).unwrap().is_cleared());
        assert_eq!(copy.planes().len(), 2);
        assert_eq!(copy.power, PowerMode::On);
    }

    #[test]
    fn release_frees_the_last_reference() {
        let dev = MockDevice::new();
        let mut pool = FbPool::new();
        let (state, _key) = assigned_state(&dev, &mut pool);
        state.release(&mut pool, &dev).unwrap();
        assert_eq!(pool.live_count(), 0);
        assert_eq!(dev.framebuffers_destroyed(), 1);
    }

    #[test]
    fn completion_marks_every_plane() {
        let mut state = OutputState::off(StateSeq(0), [PlaneIdx(0), PlaneIdx(1)]);
        assert!(!state.is_complete());
        state.mark_complete();
        assert!(state.is_complete());
    }
}
