//! Content generation for a worker's universe range.
//!
//! A pattern must assign every node of its range on every frame. Slots are
//! reused `queue_len` frames later without being cleared, so leaving a node
//! untouched would show whatever that slot held before.

pub mod color;

use clap::ValueEnum;
use color::{BLACK, BLUE, GREEN, PALETTE, RED};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Built-in patterns selectable from the command line.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    /// Marching dots with a per-universe color and spacing, for wiring checks.
    #[default]
    PinFinder,
    /// Whole frame in one palette color, cycling per frame.
    Palette,
    /// Checkerboard of black and a per-universe palette color.
    Checker,
    /// Repeat the previous frame unchanged.
    Hold,
}

impl PatternKind {
    pub fn build(self) -> Box<dyn Pattern> {
        match self {
            Self::PinFinder => Box::new(PinFinder),
            Self::Palette => Box::new(PaletteCycle),
            Self::Checker => Box::new(Checker),
            Self::Hold => Box::new(Hold),
        }
    }
}

/// The part of one frame a worker is responsible for.
pub struct RenderTarget<'a> {
    /// Frame being produced.
    pub frame: u32,
    /// Universes covered by `pixels`.
    pub universes: Range<u32>,
    /// Nodes per universe.
    pub nodes: u32,
    /// Universe-major pixels for `universes`; every element must be written.
    pub pixels: &'a mut [u32],
    /// Same range as it was in the previous frame, if there is one.
    pub previous: Option<&'a [u32]>,
}

impl RenderTarget<'_> {
    /// Pixels of one universe.
    pub fn universe_mut(&mut self, universe: u32) -> &mut [u32] {
        let nodes = self.nodes as usize;
        let start = (universe - self.universes.start) as usize * nodes;
        &mut self.pixels[start..start + nodes]
    }
}

pub trait Pattern: Send {
    fn name(&self) -> &'static str;
    fn render(&mut self, target: &mut RenderTarget<'_>);
}

pub struct PinFinder;

impl PinFinder {
    /// Color group per block of 8 universes.
    fn color(universe: u32) -> u32 {
        [RED, GREEN, BLUE][(universe >> 3) as usize % 3]
    }

    /// Dot spacing: 9 nodes for the first universe of a block down to 2.
    fn repeat(universe: u32) -> i64 {
        9 - (universe & 7) as i64
    }
}

impl Pattern for PinFinder {
    fn name(&self) -> &'static str {
        "pin-finder"
    }

    fn render(&mut self, target: &mut RenderTarget<'_>) {
        let frame = target.frame as i64;
        for u in target.universes.clone() {
            let color = Self::color(u);
            let repeat = Self::repeat(u);
            for (n, px) in target.universe_mut(u).iter_mut().enumerate() {
                *px = if (n as i64 - frame).rem_euclid(repeat) == 0 {
                    color
                } else {
                    BLACK
                };
            }
        }
    }
}

pub struct PaletteCycle;

impl Pattern for PaletteCycle {
    fn name(&self) -> &'static str {
        "palette"
    }

    fn render(&mut self, target: &mut RenderTarget<'_>) {
        target
            .pixels
            .fill(PALETTE[target.frame as usize % PALETTE.len()]);
    }
}

pub struct Checker;

impl Pattern for Checker {
    fn name(&self) -> &'static str {
        "checker"
    }

    fn render(&mut self, target: &mut RenderTarget<'_>) {
        for u in target.universes.clone() {
            let color = PALETTE[1 + u as usize % (PALETTE.len() - 1)];
            for (n, px) in target.universe_mut(u).iter_mut().enumerate() {
                *px = if (u as usize + n) & 1 == 1 { color } else { BLACK };
            }
        }
    }
}

/// "No change" frame: copies the previous frame forward explicitly.
pub struct Hold;

impl Pattern for Hold {
    fn name(&self) -> &'static str {
        "hold"
    }

    fn render(&mut self, target: &mut RenderTarget<'_>) {
        match target.previous {
            Some(prev) if prev.len() == target.pixels.len() => {
                target.pixels.copy_from_slice(prev);
            }
            _ => target.pixels.fill(BLACK),
        }
    }
}
