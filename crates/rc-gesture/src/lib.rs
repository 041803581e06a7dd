//! Viewport -> device coordinate mapping for remote gesture input.
//!
//! The sender describes gestures in its own viewport's coordinate space;
//! this module translates them onto the local display, accounting for
//! aspect mismatch and display rotation. See [`GestureMapper`] for the
//! transform itself and [`GestureCommand`] for the normalized
//! descriptors the session controller hands to a platform input
//! injector.

use thiserror::Error;

/// Display rotation, as reported by the host OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// Sender-side viewport dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// Local display dimensions and current rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Display {
    pub width: f64,
    pub height: f64,
    pub rotation: Rotation,
}

impl Display {
    /// Effective `(width, height)` after accounting for rotation: a
    /// quarter/three-quarter turn swaps which physical axis is "width".
    fn effective_dims(self) -> (f64, f64) {
        if self.rotation.swaps_axes() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

/// A point was outside the legal coordinate range for a mapping stage.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum MapError {
    #[error("point ({0}, {1}) is outside the viewport")]
    OutsideViewport(f64, f64),
    #[error("point ({0}, {1}) is outside the display")]
    OutsideDisplay(f64, f64),
    #[error("mapper has not been initialized with a viewport and display")]
    Uninitialized,
}

/// Viewport -> device coordinate transform.
///
/// Uses a single uniform scale (the smaller of the two per-axis
/// scales), centering the residual on both axes. This is the min-scale
/// strategy; the mapper does not implement a separate letterbox/
/// pillarbox branch, and there is no bypass path for an uninitialized
/// mapper — `map`/`map_multi` return [`MapError::Uninitialized`]
/// instead.
#[derive(Debug, Clone, Copy)]
pub struct GestureMapper {
    state: Option<Transform>,
}

#[derive(Debug, Clone, Copy)]
struct Transform {
    viewport: Viewport,
    display: Display,
    scale: f64,
    offset_x: f64,
    offset_y: f64,
}

impl GestureMapper {
    /// Create an uninitialized mapper. Call [`Self::update`] before
    /// mapping any points.
    #[must_use]
    pub fn new() -> Self {
        Self { state: None }
    }

    /// Create a mapper already initialized for the given viewport and
    /// display.
    #[must_use]
    pub fn with_geometry(viewport: Viewport, display: Display) -> Self {
        let mut mapper = Self::new();
        mapper.update(viewport, display);
        mapper
    }

    /// (Re)compute the transform for a viewport/display pair. Called
    /// again whenever the display rotates.
    pub fn update(&mut self, viewport: Viewport, display: Display) {
        let (dw, dh) = display.effective_dims();
        let scale = (dw / viewport.width).min(dh / viewport.height);
        let offset_x = (dw - viewport.width * scale) / 2.0;
        let offset_y = (dh - viewport.height * scale) / 2.0;

        self.state = Some(Transform {
            viewport,
            display,
            scale,
            offset_x,
            offset_y,
        });
    }

    /// Map one viewport point onto the display. Rejects points outside
    /// `[0, vw) x [0, vh)` on input or outside `[0, dw) x [0, dh)` on
    /// output (half-open intervals on both ends).
    ///
    /// # Errors
    ///
    /// Returns [`MapError::Uninitialized`] if `update` has not been
    /// called, [`MapError::OutsideViewport`] or
    /// [`MapError::OutsideDisplay`] if the point falls outside the
    /// respective half-open range.
    pub fn map(&self, x: f64, y: f64) -> Result<(f64, f64), MapError> {
        let t = self.state.as_ref().ok_or(MapError::Uninitialized)?;

        if x < 0.0 || x >= t.viewport.width || y < 0.0 || y >= t.viewport.height {
            return Err(MapError::OutsideViewport(x, y));
        }

        let mapped_x = x * t.scale + t.offset_x;
        let mapped_y = y * t.scale + t.offset_y;
        let (dw, dh) = t.display.effective_dims();

        if mapped_x < 0.0 || mapped_x >= dw || mapped_y < 0.0 || mapped_y >= dh {
            return Err(MapError::OutsideDisplay(mapped_x, mapped_y));
        }

        Ok((mapped_x, mapped_y))
    }

    /// Map every point in a multi-point gesture. Fails atomically: if
    /// any point is rejected, the whole gesture is rejected and no
    /// partial result is returned.
    ///
    /// # Errors
    ///
    /// The first [`MapError`] encountered, in input order.
    pub fn map_multi(&self, points: &[(f64, f64)]) -> Result<Vec<(f64, f64)>, MapError> {
        points.iter().map(|&(x, y)| self.map(x, y)).collect()
    }

    /// Inverse of [`Self::map`]: device coordinates back to viewport
    /// coordinates. Used by round-trip tests; not used on the hot path.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::Uninitialized`] if `update` has not been
    /// called.
    pub fn unmap(&self, device_x: f64, device_y: f64) -> Result<(f64, f64), MapError> {
        let t = self.state.as_ref().ok_or(MapError::Uninitialized)?;
        Ok((
            (device_x - t.offset_x) / t.scale,
            (device_y - t.offset_y) / t.scale,
        ))
    }
}

impl Default for GestureMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// A key down/up event, with the modifier keys held at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
}

/// Normalized gesture/input descriptor emitted by the session controller
/// after mapping. A platform adapter outside this crate performs the
/// actual injection.
#[derive(Debug, Clone, PartialEq)]
pub enum GestureCommand {
    Tap {
        x: f64,
        y: f64,
        duration_ms: u32,
    },
    LongPress {
        x: f64,
        y: f64,
        duration_ms: u32,
    },
    Swipe {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        duration_ms: u32,
    },
    MultiStep {
        points: Vec<(f64, f64)>,
        duration_ms: u32,
    },
    Key {
        action: KeyAction,
        code: u32,
        shift: bool,
        ctrl: bool,
        alt: bool,
        meta: bool,
    },
    GlobalAction {
        kind: String,
    },
}

impl GestureCommand {
    #[must_use]
    pub fn tap(x: f64, y: f64) -> Self {
        Self::Tap {
            x,
            y,
            duration_ms: 100,
        }
    }

    #[must_use]
    pub fn long_press(x: f64, y: f64) -> Self {
        Self::LongPress {
            x,
            y,
            duration_ms: 600,
        }
    }

    #[must_use]
    pub fn swipe(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self::Swipe {
            x1,
            y1,
            x2,
            y2,
            duration_ms: 300,
        }
    }
}

/// Performs a mapped [`GestureCommand`] on the host OS. Implemented
/// outside this crate by a platform adapter (tap/swipe/key dispatch is
/// explicitly out of scope for the core; see `rc-agent`'s wiring).
pub trait InputInjector: Send + Sync {
    fn inject(&self, command: GestureCommand);
}
