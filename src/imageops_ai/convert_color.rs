use image::Rgb;
use ndarray::prelude::*;
use num_traits::{AsPrimitive, Bounded, NumCast};

use crate::imageops_ai::{get_max_value, is_floating_point};

/// Sample types accepted on ingestion (`u8`, `u16`, `f32`, ...).
pub trait Sample: Copy + Bounded + NumCast + AsPrimitive<f32> + 'static {}

impl<T> Sample for T where T: Copy + Bounded + NumCast + AsPrimitive<f32> + 'static {}

/// Sample scaled to `[0, 1]`. Floats are clamped.
pub fn to_unit<S: Sample>(value: S) -> f32 {
    if is_floating_point::<S>() {
        value.as_().clamp(0.0, 1.0)
    } else {
        value.as_() / get_max_value::<S>().as_()
    }
}

/// 8-bit value of a sample.
///
/// Integers keep their top 8 bits (`u8` is unchanged, `u16` is divided by
/// 256); floats go through [`unit_to_ubyte`].
pub fn to_ubyte<S: Sample>(value: S) -> u8 {
    if is_floating_point::<S>() {
        unit_to_ubyte(value.as_())
    } else {
        let levels = get_max_value::<S>().as_() + 1.0;
        (value.as_() * 256.0 / levels).floor().min(255.0) as u8
    }
}

pub fn unit_to_ubyte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Collapse one `(channels)` lane of an `(H, W, C)` array to an RGB pixel.
///
/// Gray is replicated; alpha is composited over a white background.
/// `channels` must be 1..=4.
pub fn to_rgb<S: Sample>(lane: ArrayView1<'_, S>) -> Rgb<u8> {
    match lane.len() {
        1 => {
            let v = to_ubyte(lane[0]);
            Rgb([v, v, v])
        }
        2 => {
            let v = over_white(to_unit(lane[0]), to_unit(lane[1]));
            Rgb([v, v, v])
        }
        3 => Rgb([to_ubyte(lane[0]), to_ubyte(lane[1]), to_ubyte(lane[2])]),
        _ => {
            let alpha = to_unit(lane[3]);
            Rgb([
                over_white(to_unit(lane[0]), alpha),
                over_white(to_unit(lane[1]), alpha),
                over_white(to_unit(lane[2]), alpha),
            ])
        }
    }
}

fn over_white(channel: f32, alpha: f32) -> u8 {
    unit_to_ubyte(channel * alpha + (1.0 - alpha))
}
