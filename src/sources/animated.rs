//! Animated color source
//!
//! Publishes a 1x1 image whose color drifts on every tick. Each channel
//! bounces between a floor and a ceiling that are re-drawn at random every
//! time the channel changes direction.

use std::time::Duration;

use image::Rgb;
use rand::Rng;
use tokio::time::MissedTickBehavior;

use crate::broker::{Context, Handler};
use crate::error::Result;
use crate::frame::{draw, ImageFrame, Metadata};

const FLOOR: u8 = 50;
const CEILING: u8 = 200;
const MIN_FLOOR: u8 = 50;
const MAX_FLOOR: u8 = 150;
const MAX_CEILING: u8 = 250;

/// Channel change per tick
pub const STEP: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AnimatedValue {
    value: u8,
    increasing: bool,
    reversed: bool,
    floor: u8,
    ceiling: u8,
}

impl AnimatedValue {
    fn new(value: u8) -> Self {
        Self {
            value,
            increasing: true,
            reversed: false,
            floor: FLOOR,
            ceiling: CEILING,
        }
    }

    fn step(mut self, size: u8) -> Self {
        let (value, size) = (i32::from(self.value), i32::from(size));
        if self.increasing && value + size >= i32::from(self.ceiling) {
            self.increasing = false;
            self.reversed = true;
        } else if !self.increasing && value - size < i32::from(self.floor) {
            self.increasing = true;
            self.reversed = true;
        } else {
            self.reversed = false;
        }

        let size = size as u8;
        self.value = if self.increasing {
            self.value.saturating_add(size)
        } else {
            self.value.saturating_sub(size)
        };
        self
    }

    fn update_bounds(mut self, rng: &mut impl Rng, min_ceiling: u8) -> Self {
        if self.reversed {
            if self.increasing {
                self.floor = rng.gen_range(MIN_FLOOR..MAX_FLOOR);
            } else {
                self.ceiling = rng.gen_range(min_ceiling..MAX_CEILING);
            }
        }
        self
    }
}

/// A slowly drifting RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimatedColor {
    r: AnimatedValue,
    g: AnimatedValue,
    b: AnimatedValue,
}

impl AnimatedColor {
    pub fn new(initial: Rgb<u8>) -> Self {
        let [r, g, b] = initial.0;
        Self {
            r: AnimatedValue::new(r),
            g: AnimatedValue::new(g),
            b: AnimatedValue::new(b),
        }
    }

    /// Start from a random color
    pub fn random() -> Self {
        Self::new(Rgb(rand::thread_rng().gen()))
    }

    /// The current color
    pub fn color(&self) -> Rgb<u8> {
        Rgb([self.r.value, self.g.value, self.b.value])
    }

    /// Advance every channel by `size`
    pub fn step(self, size: u8, rng: &mut impl Rng) -> Self {
        let min_ceiling = MAX_FLOOR.saturating_add(size);
        Self {
            r: self.r.step(size).update_bounds(rng, min_ceiling),
            g: self.g.step(size).update_bounds(rng, min_ceiling),
            b: self.b.step(size).update_bounds(rng, min_ceiling),
        }
    }
}

/// PUB handler publishing an animated 1x1 color every `interval`
pub fn animated_color_source(interval: Duration) -> impl Handler {
    move |ctx: Context| publish_animation(ctx, interval)
}

async fn publish_animation(ctx: Context, interval: Duration) -> Result<()> {
    let mut color = AnimatedColor::random();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                // ThreadRng is not Send, so it must not live across an await
                color = color.step(STEP, &mut rand::thread_rng());
                let image = draw::uniform(1, 1, color.color());
                ctx.publish(ImageFrame::new(image, Metadata::new("generate animated color")).into());
            }
        }
    }
}
