//! Multiple-render-target channel packing.
//!
//! A device pixel holds four channel values, so a tensor with `C` channels
//! is stored as `ceil(C / 4)` planes. A rasterization pass writes up to
//! `planes_per_pass` planes at once, which fixes how many passes a layer
//! needs and which planes each of them produces. The compiler that emits
//! kernels and the engine that sequences them must agree on these numbers
//! exactly, otherwise existing golden dumps stop matching.

use crate::error::GraphError;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Number of channel values stored per pixel of one plane.
pub const CHANNELS_PER_PLANE: u32 = 4;

/// How many render targets one rasterization pass writes simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MrtMode {
    /// One target, four channels per pass.
    #[default]
    SinglePlane,
    /// Two targets, eight channels per pass.
    DoublePlane,
    /// Four targets, sixteen channels per pass.
    QuadPlane,
}

impl MrtMode {
    /// Planes written by one pass.
    pub const fn planes_per_pass(self) -> u32 {
        match self {
            MrtMode::SinglePlane => 1,
            MrtMode::DoublePlane => 2,
            MrtMode::QuadPlane => 4,
        }
    }

    /// Channels written by one pass.
    pub const fn channels_per_pass(self) -> u32 {
        CHANNELS_PER_PLANE * self.planes_per_pass()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MrtMode::SinglePlane => "SINGLE_PLANE",
            MrtMode::DoublePlane => "DOUBLE_PLANE",
            MrtMode::QuadPlane => "QUAD_PLANE",
        }
    }
}

impl fmt::Display for MrtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MrtMode {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SINGLE_PLANE" | "SINGLE" => Ok(MrtMode::SinglePlane),
            "DOUBLE_PLANE" | "DOUBLE" => Ok(MrtMode::DoublePlane),
            "QUAD_PLANE" | "QUAD" => Ok(MrtMode::QuadPlane),
            other => Err(GraphError::InvalidOption(format!("unknown MRT mode '{other}'"))),
        }
    }
}

/// Number of 4-channel planes needed for `channels` values.
pub fn plane_count(channels: u32) -> u32 {
    channels.div_ceil(CHANNELS_PER_PLANE)
}

/// Number of rasterization passes a layer with `channels` outputs needs.
///
/// `pass_count(32, SinglePlane) == 8`, `pass_count(32, DoublePlane) == 4`,
/// `pass_count(32, QuadPlane) == 2`.
pub fn pass_count(channels: u32, mode: MrtMode) -> u32 {
    channels.div_ceil(mode.channels_per_pass())
}

/// Index of the pass that produces 4-channel group `group`.
///
/// Computed as `ceil((group + 1) * 4 / (4 * planes_per_pass)) - 1`.
pub fn pass_index(group: u32, mode: MrtMode) -> u32 {
    ((group + 1) * CHANNELS_PER_PLANE).div_ceil(mode.channels_per_pass()) - 1
}

/// Planes written by pass `pass` of a layer with `channels` outputs.
///
/// The last pass may write fewer planes than `planes_per_pass`. Returns an
/// empty range for passes past the end.
pub fn pass_planes(pass: u32, channels: u32, mode: MrtMode) -> Range<u32> {
    let planes = plane_count(channels);
    let start = (pass * mode.planes_per_pass()).min(planes);
    let end = ((pass + 1) * mode.planes_per_pass()).min(planes);
    start..end
}
