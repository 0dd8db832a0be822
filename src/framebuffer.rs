//! Refcounted framebuffer objects.
//!
//! Every hardware framebuffer the engine creates lives in an [`FbPool`]
//! slot. Plane states hold [`FbKey`]s and bump the refcount when they
//! are duplicated; the framebuffer object is destroyed exactly when the
//! last reference goes away. Creation is idempotent per underlying
//! buffer, so attaching the same client buffer to two outputs yields
//! one framebuffer with a refcount of two.

use std::collections::HashMap;
use std::fmt;

use tracing::trace;

use crate::error::{Error, Result};
use crate::geometry::Size;
use crate::hw::{BufferId, DisplayControl, FbId, FbSource};

/// Stable handle to a pool slot. Generation-checked, so a key held
/// past the slot's death fails with [`Error::StaleFbKey`] instead of
/// touching an unrelated framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FbKey {
    index: u32,
    gen: u32,
}

/// Lifecycle class of the underlying buffer.
pub enum FbKind {
    /// Renderer-owned swapchain buffer. The renderer frees the pixels.
    Swapchain,
    /// Zero-copy client buffer. The hook fires once the hardware can
    /// no longer be holding the buffer, releasing it to its owner.
    Import { release: Option<Box<dyn FnMut(BufferId)>> },
    /// Engine-owned cursor buffer.
    Cursor,
}

impl fmt::Debug for FbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FbKind::Swapchain => f.write_str("Swapchain"),
            FbKind::Import { .. } => f.write_str("Import"),
            FbKind::Cursor => f.write_str("Cursor"),
        }
    }
}

struct FbEntry {
    fb: FbId,
    buffer: BufferId,
    size: Size,
    refs: u32,
    kind: FbKind,
}

struct Slot {
    gen: u32,
    entry: Option<FbEntry>,
}

#[derive(Default)]
pub struct FbPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_buffer: HashMap<BufferId, FbKey>,
}

impl FbPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a referenced key for `source`, creating the hardware
    /// framebuffer on first sight of the underlying buffer. On a hit
    /// the existing slot is re-referenced and `kind` is discarded.
    pub fn acquire<D: DisplayControl>(
        &mut self,
        dev: &D,
        source: &FbSource,
        size: Size,
        kind: FbKind,
    ) -> Result<FbKey> {
        if let Some(&key) = self.by_buffer.get(&source.buffer()) {
            self.retain(key)?;
            return Ok(key);
        }

        let fb = dev.create_framebuffer(source)?;
        let entry = FbEntry {
            fb,
            buffer: source.buffer(),
            size,
            refs: 1,
            kind,
        };
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                FbKey {
                    index,
                    gen: slot.gen,
                }
            }
            None => {
                self.slots.push(Slot {
                    gen: 0,
                    entry: Some(entry),
                });
                FbKey {
                    index: self.slots.len() as u32 - 1,
                    gen: 0,
                }
            }
        };
        self.by_buffer.insert(source.buffer(), key);
        trace!(?key, fb = fb.0, buffer = source.buffer().0, "created framebuffer");
        Ok(key)
    }

    fn entry(&self, key: FbKey) -> Result<&FbEntry> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.gen == key.gen)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(Error::StaleFbKey)
    }

    fn entry_mut(&mut self, key: FbKey) -> Result<&mut FbEntry> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.gen == key.gen)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(Error::StaleFbKey)
    }

    /// Adds a reference, for a duplicated plane state that now also
    /// points at this framebuffer.
    pub fn retain(&mut self, key: FbKey) -> Result<()> {
        let entry = self.entry_mut(key)?;
        entry.refs += 1;
        Ok(())
    }

    /// Drops one reference. At zero the framebuffer object is
    /// destroyed, an import hook (if any) fires, and the slot is
    /// recycled under a new generation.
    pub fn release<D: DisplayControl>(&mut self, dev: &D, key: FbKey) -> Result<()> {
        let entry = self.entry_mut(key)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(());
        }

        let slot = &mut self.slots[key.index as usize];
        let mut entry = slot.entry.take().expect("checked above");
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(key.index);
        self.by_buffer.remove(&entry.buffer);

        trace!(?key, fb = entry.fb.0, "destroying framebuffer");
        dev.destroy_framebuffer(entry.fb)?;
        if let FbKind::Import { release: Some(hook) } = &mut entry.kind {
            hook(entry.buffer);
        }
        Ok(())
    }

    pub fn fb(&self, key: FbKey) -> Result<FbId> {
        Ok(self.entry(key)?.fb)
    }

    pub fn size(&self, key: FbKey) -> Result<Size> {
        Ok(self.entry(key)?.size)
    }

    pub fn buffer(&self, key: FbKey) -> Result<BufferId> {
        Ok(self.entry(key)?.buffer)
    }

    pub fn refs(&self, key: FbKey) -> Result<u32> {
        Ok(self.entry(key)?.refs)
    }

    /// Live key for a buffer, if one exists. Does not add a reference.
    pub fn lookup(&self, buffer: BufferId) -> Option<FbKey> {
        self.by_buffer.get(&buffer).copied()
    }

    pub fn live_count(&self) -> usize {
        self.by_buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::hw::mock::MockDevice;

    fn ext(handle: u64) -> FbSource {
        FbSource::External {
            handle: BufferId(handle),
            size: Size::new(640, 480),
            pitch: 640 * 4,
            bpp: 32,
            depth: 24,
        }
    }

    #[test]
    fn same_buffer_yields_same_key_and_one_framebuffer() {
        let dev = MockDevice::new();
        let mut pool = FbPool::new();
        let a = pool.acquire(&dev, &ext(7), Size::new(640, 480), FbKind::Swapchain).unwrap();
        let b = pool.acquire(&dev, &ext(7), Size::new(640, 480), FbKind::Swapchain).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.refs(a).unwrap(), 2);
        assert_eq!(dev.framebuffers_created(), 1);
    }

    #[test]
    fn destroyed_exactly_once_at_zero() {
        let dev = MockDevice::new();
        let mut pool = FbPool::new();
        let key = pool.acquire(&dev, &ext(1), Size::new(640, 480), FbKind::Swapchain).unwrap();
        pool.retain(key).unwrap();
        pool.release(&dev, key).unwrap();
        assert_eq!(dev.framebuffers_destroyed(), 0);
        pool.release(&dev, key).unwrap();
        assert_eq!(dev.framebuffers_destroyed(), 1);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn stale_key_is_rejected_after_slot_reuse() {
        let dev = MockDevice::new();
        let mut pool = FbPool::new();
        let old = pool.acquire(&dev, &ext(1), Size::new(640, 480), FbKind::Swapchain).unwrap();
        pool.release(&dev, old).unwrap();
        let new = pool.acquire(&dev, &ext(2), Size::new(640, 480), FbKind::Swapchain).unwrap();
        assert_eq!(new.index, old.index);
        assert_ne!(new, old);
        assert!(matches!(pool.fb(old), Err(Error::StaleFbKey)));
        assert!(matches!(pool.release(&dev, old), Err(Error::StaleFbKey)));
        assert!(pool.fb(new).is_ok());
    }

    #[test]
    fn import_hook_fires_once_on_last_release() {
        let dev = MockDevice::new();
        let mut pool = FbPool::new();
        let released: Rc<RefCell<Vec<BufferId>>> = Rc::default();
        let hook = {
            let released = released.clone();
            Box::new(move |buffer| released.borrow_mut().push(buffer))
        };
        let key = pool
            .acquire(
                &dev,
                &ext(9),
                Size::new(640, 480),
                FbKind::Import { release: Some(hook) },
            )
            .unwrap();
        pool.retain(key).unwrap();
        pool.release(&dev, key).unwrap();
        assert!(released.borrow().is_empty());
        pool.release(&dev, key).unwrap();
        assert_eq!(*released.borrow(), vec![BufferId(9)]);
    }
}
