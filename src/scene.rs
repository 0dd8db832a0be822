//! Scene views, the input to plane assignment.
//!
//! A view is a rectangle in the output's logical render area plus its
//! content. Views are ordered bottom to top; the engine decides per
//! repaint which views ride dedicated planes and which fall back to
//! the rendered primary.

use crate::geometry::{Point, Rect, Size};
use crate::hw::FbSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

/// ARGB8888 pixels, tightly packed (`stride == size.w * 4`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub size: Size,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewContent {
    /// Composited by the renderer into the primary plane.
    Primary,
    /// Client buffer eligible for zero-copy scanout on an overlay
    /// plane.
    Overlay { source: FbSource },
    /// Cursor image; `hotspot` is the point inside the image that the
    /// view rectangle's origin refers to.
    Cursor { image: CursorImage, hotspot: Point },
}

#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub id: ViewId,
    /// Position in the output's logical render area.
    pub rect: Rect,
    pub visible: bool,
    pub content: ViewContent,
}

impl View {
    pub fn is_cursor(&self) -> bool {
        matches!(self.content, ViewContent::Cursor { .. })
    }
}
