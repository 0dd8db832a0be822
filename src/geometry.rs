//! Integer geometry used for plane placement.
//!
//! Destination rectangles are in device pixels, source rectangles in
//! 16.16 fixed point as the kernel expects them.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub w: u32,
    pub h: u32,
}

impl Size {
    pub fn new(w: u32, h: u32) -> Self {
        Self { w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.w, size.h)
    }

    pub fn size(&self) -> Size {
        Size::new(self.w, self.h)
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.w as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h as i32
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

/// A source rectangle in 16.16 fixed point, ready to be written into
/// `SRC_X`/`SRC_Y`/`SRC_W`/`SRC_H` plane properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FixedRect {
    pub x: u64,
    pub y: u64,
    pub w: u64,
    pub h: u64,
}

pub fn to_fixed(v: u32) -> u64 {
    (v as u64) << 16
}

impl FixedRect {
    pub fn from_size(size: Size) -> Self {
        Self {
            x: 0,
            y: 0,
            w: to_fixed(size.w),
            h: to_fixed(size.h),
        }
    }
}

/// Maps a logical render area onto a mode, preserving aspect ratio.
///
/// The same fit is applied to every non-primary plane of an output so
/// that overlays and the cursor land where the scaled scene puts them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayFit {
    pub scale: f64,
    pub dx: i32,
    pub dy: i32,
}

impl DisplayFit {
    /// Computes the letterbox/pillarbox fit of `area` into `mode`.
    ///
    /// `scaled_h = mode.w * area.h / area.w`; when that fits the mode
    /// height we scale by width and center vertically (letterbox),
    /// otherwise we scale by height and center horizontally
    /// (pillarbox). An exact fit takes the letterbox branch with zero
    /// margins.
    pub fn compute(mode: Size, area: Size) -> Self {
        if area.is_empty() || mode.is_empty() {
            return Self {
                scale: 1.0,
                dx: 0,
                dy: 0,
            };
        }
        let scaled_h = (mode.w as u64 * area.h as u64 / area.w as u64) as u32;
        if scaled_h <= mode.h {
            Self {
                scale: mode.w as f64 / area.w as f64,
                dx: 0,
                dy: ((mode.h - scaled_h) / 2) as i32,
            }
        } else {
            let scaled_w = (mode.h as u64 * area.w as u64 / area.h as u64) as u32;
            Self {
                scale: mode.h as f64 / area.h as f64,
                dx: ((mode.w - scaled_w) / 2) as i32,
                dy: 0,
            }
        }
    }

    pub fn apply_point(&self, p: Point) -> Point {
        Point::new(
            self.dx + (p.x as f64 * self.scale).round() as i32,
            self.dy + (p.y as f64 * self.scale).round() as i32,
        )
    }

    /// Maps a logical rectangle into device pixels.
    pub fn apply(&self, r: Rect) -> Rect {
        let p = self.apply_point(Point::new(r.x, r.y));
        Rect::new(
            p.x,
            p.y,
            (r.w as f64 * self.scale).round() as u32,
            (r.h as f64 * self.scale).round() as u32,
        )
    }
}
