//! Discard level and rational expansion derivation.
//!
//! A wavelet codestream can be decoded at any of its resolution tiers by
//! discarding the finest `d` levels; each tier halves the image. To produce
//! an arbitrary output size the decoder picks the coarsest tier that is still
//! at least as large as the target and resamples it by an exact rational
//! factor `numerator / denominator` per axis.

use crate::engine::ExpansionLimits;
use crate::{Coords, Region};

/// How the discard level is chosen when shrinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscardHeuristic {
    /// Guess from the difference in bit length between native and target
    /// sizes, then correct against the rounded-up tier sizes. Always picks
    /// the coarsest tier that covers the target.
    #[default]
    BitLength,
    /// Double a floating-point scale until it would exceed 1. Ignores the
    /// rounding up of tier sizes, so it may stop one tier finer than
    /// [`DiscardHeuristic::BitLength`].
    ScaleDoubling,
}

/// The parameters one region decode is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeParameters {
    pub discard_level: u32,
    pub expand_numerator: Coords,
    pub expand_denominator: Coords,
    /// Requested region at the discarded tier, before resampling.
    pub render_dims: Region,
    /// Size of the decoded output.
    pub output_size: Coords,
}

impl DecodeParameters {
    /// Full-resolution decode with no resampling.
    pub fn native(region: Region) -> Self {
        Self {
            discard_level: 0,
            expand_numerator: Coords::new(1, 1),
            expand_denominator: Coords::new(1, 1),
            render_dims: region,
            output_size: Coords::new(region.width, region.height),
        }
    }

    /// Derives parameters for decoding `region` to `scaled_width` by
    /// `scaled_height` pixels. Zero target sizes are treated as 1.
    pub fn derive(
        region: Region,
        scaled_width: u32,
        scaled_height: u32,
        dwt_levels: u32,
        heuristic: DiscardHeuristic,
        limits: ExpansionLimits,
    ) -> Self {
        Self::derive_with(region, scaled_width, scaled_height, dwt_levels, heuristic, |_| limits)
    }

    /// As [`DecodeParameters::derive`], asking `limits` for the expansion
    /// bounds at the chosen discard level.
    pub fn derive_with<F>(
        region: Region,
        scaled_width: u32,
        scaled_height: u32,
        dwt_levels: u32,
        heuristic: DiscardHeuristic,
        limits: F,
    ) -> Self
    where
        F: FnOnce(u32) -> ExpansionLimits,
    {
        if region.is_empty() {
            return Self::native(region);
        }
        let target = Coords::new(scaled_width.max(1), scaled_height.max(1));

        let discard_level = if target.x >= region.width || target.y >= region.height {
            0
        } else {
            discard_level(
                Coords::new(region.width, region.height),
                target,
                dwt_levels,
                heuristic,
            )
        };

        let denominator = Coords::new(
            tier_size(region.width, discard_level),
            tier_size(region.height, discard_level),
        );
        let numerator = adjust_expansion(target, denominator, &limits(discard_level));
        let (num_x, den_x) = reduce(numerator.x, denominator.x);
        let (num_y, den_y) = reduce(numerator.y, denominator.y);

        let render_dims = Region::new(
            tier_size(region.x, discard_level),
            tier_size(region.y, discard_level),
            denominator.x,
            denominator.y,
        );
        let output_size = Coords::new(
            scale_ceil(render_dims.width, num_x, den_x),
            scale_ceil(render_dims.height, num_y, den_y),
        );

        Self {
            discard_level,
            expand_numerator: Coords::new(num_x, num_y),
            expand_denominator: Coords::new(den_x, den_y),
            render_dims,
            output_size,
        }
    }

    pub fn ratio_x(&self) -> f64 {
        self.expand_numerator.x as f64 / self.expand_denominator.x as f64
    }

    pub fn ratio_y(&self) -> f64 {
        self.expand_numerator.y as f64 / self.expand_denominator.y as f64
    }
}

/// Coarsest tier at which `native` still covers `target` on both axes,
/// capped at `dwt_levels`. `target` must not exceed `native`.
pub fn discard_level(native: Coords, target: Coords, dwt_levels: u32, heuristic: DiscardHeuristic) -> u32 {
    let covers = |level: u32| {
        tier_size(native.x, level) >= target.x && tier_size(native.y, level) >= target.y
    };

    match heuristic {
        DiscardHeuristic::BitLength => {
            let x = bit_length(native.x).saturating_sub(bit_length(target.x));
            let y = bit_length(native.y).saturating_sub(bit_length(target.y));
            let mut level = x.min(y).min(dwt_levels);
            while level > 0 && !covers(level) {
                level -= 1;
            }
            while level < dwt_levels && covers(level + 1) {
                level += 1;
            }
            level
        }
        DiscardHeuristic::ScaleDoubling => {
            let mut scale_x = target.x as f64 / native.x as f64;
            let mut scale_y = target.y as f64 / native.y as f64;
            let mut level = 0;
            while level < dwt_levels && scale_x * 2.0 <= 1.0 && scale_y * 2.0 <= 1.0 {
                scale_x *= 2.0;
                scale_y *= 2.0;
                level += 1;
            }
            level
        }
    }
}

/// `ceil(size / 2^level)`.
pub fn tier_size(size: u32, level: u32) -> u32 {
    let divisor = 1u64 << level.min(63);
    (size as u64).div_ceil(divisor) as u32
}

fn bit_length(value: u32) -> u32 {
    u32::BITS - value.leading_zeros()
}

/// Brings `numerator / denominator` inside the engine's bounds: the area
/// product is raised to `min_product`, then each axis is clamped to its
/// maximum.
fn adjust_expansion(numerator: Coords, denominator: Coords, limits: &ExpansionLimits) -> Coords {
    let mut x = numerator.x as f64;
    let mut y = numerator.y as f64;
    let den_x = denominator.x as f64;
    let den_y = denominator.y as f64;

    let product = (x / den_x) * (y / den_y);
    if product < limits.min_product {
        let factor = (limits.min_product / product).sqrt();
        x = (x * factor).ceil();
        y = (y * factor).ceil();
    }
    if x / den_x > limits.max_x {
        x = (limits.max_x * den_x).floor().max(1.0);
    }
    if y / den_y > limits.max_y {
        y = (limits.max_y * den_y).floor().max(1.0);
    }

    // Float to int casts saturate.
    Coords::new(x as u32, y as u32)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn reduce(numerator: u32, denominator: u32) -> (u32, u32) {
    match gcd(numerator, denominator) {
        0 => (numerator, denominator),
        g => (numerator / g, denominator / g),
    }
}

fn scale_ceil(size: u32, numerator: u32, denominator: u32) -> u32 {
    let scaled = (size as u64 * numerator as u64).div_ceil(denominator.max(1) as u64);
    scaled.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derive(region: Region, w: u32, h: u32, levels: u32) -> DecodeParameters {
        DecodeParameters::derive(region, w, h, levels, DiscardHeuristic::BitLength, ExpansionLimits::default())
    }

    #[test]
    fn test_power_of_two_reduction() {
        let params = derive(Region::new(0, 0, 4096, 4096), 512, 512, 5);
        assert_eq!(params.discard_level, 3);
        assert_eq!(params.expand_numerator, Coords::new(1, 1));
        assert_eq!(params.expand_denominator, Coords::new(1, 1));
        assert_eq!(params.render_dims, Region::new(0, 0, 512, 512));
        assert_eq!(params.output_size, Coords::new(512, 512));
    }

    #[test]
    fn test_upscale_uses_direct_ratio() {
        let params = derive(Region::new(0, 0, 100, 80), 150, 80, 5);
        assert_eq!(params.discard_level, 0);
        assert_eq!(params.expand_numerator, Coords::new(3, 1));
        assert_eq!(params.expand_denominator, Coords::new(2, 1));
        assert_eq!(params.output_size, Coords::new(150, 80));
    }

    #[test]
    fn test_one_axis_at_full_size_disables_discard() {
        let params = derive(Region::new(0, 0, 400, 400), 400, 100, 5);
        assert_eq!(params.discard_level, 0);
        assert_eq!(params.ratio_x(), 1.0);
        assert_eq!(params.ratio_y(), 0.25);
    }

    #[test]
    fn test_discard_clamped_to_dwt_levels() {
        let params = derive(Region::new(0, 0, 4096, 4096), 16, 16, 5);
        assert_eq!(params.discard_level, 5);
        assert_eq!(params.expand_numerator, Coords::new(1, 1));
        assert_eq!(params.expand_denominator, Coords::new(8, 8));
        assert_eq!(params.output_size, Coords::new(16, 16));
    }

    #[test]
    fn test_backs_off_when_tier_undershoots() {
        let params = derive(Region::new(0, 0, 1000, 1000), 501, 501, 5);
        assert_eq!(params.discard_level, 0);
        assert_eq!(params.expand_numerator, Coords::new(501, 501));
        assert_eq!(params.expand_denominator, Coords::new(1000, 1000));
    }

    #[test]
    fn test_heuristics_differ_on_rounded_tiers() {
        let native = Coords::new(1023, 1023);
        let target = Coords::new(256, 256);
        assert_eq!(discard_level(native, target, 5, DiscardHeuristic::BitLength), 2);
        assert_eq!(discard_level(native, target, 5, DiscardHeuristic::ScaleDoubling), 1);
    }

    #[test]
    fn test_zero_target_treated_as_one() {
        let params = derive(Region::new(0, 0, 64, 64), 0, 0, 5);
        assert_eq!(params.discard_level, 5);
        assert_eq!(params.expand_numerator, Coords::new(1, 1));
        assert_eq!(params.expand_denominator, Coords::new(2, 2));
        assert_eq!(params.output_size, Coords::new(1, 1));
    }

    #[test]
    fn test_render_dims_follow_region_origin() {
        let params = derive(Region::new(3, 5, 100, 50), 50, 25, 5);
        assert_eq!(params.discard_level, 1);
        assert_eq!(params.render_dims, Region::new(2, 3, 50, 25));
    }

    #[test]
    fn test_empty_region_is_native() {
        let params = derive(Region::new(10, 10, 0, 5), 4, 4, 5);
        assert_eq!(params.discard_level, 0);
        assert_eq!(params.output_size, Coords::new(0, 5));
    }

    #[test]
    fn test_min_product_scales_both_axes() {
        let limits = ExpansionLimits {
            min_product: 0.012,
            ..Default::default()
        };
        let params = DecodeParameters::derive(
            Region::new(0, 0, 1000, 1000),
            10,
            10,
            2,
            DiscardHeuristic::BitLength,
            limits,
        );
        assert_eq!(params.discard_level, 2);
        assert!(params.ratio_x() * params.ratio_y() >= 0.012);
        assert_eq!(params.expand_numerator, Coords::new(14, 14));
        assert_eq!(params.expand_denominator, Coords::new(125, 125));
    }

    #[test]
    fn test_axis_maximum_clamps_numerator() {
        let limits = ExpansionLimits {
            max_x: 4.0,
            ..Default::default()
        };
        let params = DecodeParameters::derive(
            Region::new(0, 0, 100, 100),
            1000,
            300,
            5,
            DiscardHeuristic::BitLength,
            limits,
        );
        assert_eq!(params.expand_numerator, Coords::new(4, 3));
        assert_eq!(params.expand_denominator, Coords::new(1, 1));
        assert_eq!(params.output_size, Coords::new(400, 300));
    }

    #[test]
    fn test_limits_queried_at_chosen_level() {
        let mut queried = None;
        DecodeParameters::derive_with(
            Region::new(0, 0, 4096, 2048),
            1000,
            500,
            6,
            DiscardHeuristic::BitLength,
            |level| {
                queried = Some(level);
                ExpansionLimits::default()
            },
        );
        assert_eq!(queried, Some(2));
    }

    #[test]
    fn test_chosen_tier_never_undershoots() {
        let sizes = [1u32, 2, 3, 7, 64, 100, 255, 256, 257, 1000, 1023, 1024, 4095, 4097];
        for heuristic in [DiscardHeuristic::BitLength, DiscardHeuristic::ScaleDoubling] {
            for &w in &sizes {
                for &h in &sizes {
                    for &tw in sizes.iter().filter(|&&t| t < w) {
                        for &th in sizes.iter().filter(|&&t| t < h) {
                            let levels = 8;
                            let level = discard_level(Coords::new(w, h), Coords::new(tw, th), levels, heuristic);
                            assert!(level <= levels);
                            assert!(tier_size(w, level) >= tw, "{w}x{h} -> {tw}x{th} at {level}");
                            assert!(tier_size(h, level) >= th, "{w}x{h} -> {tw}x{th} at {level}");
                            if heuristic == DiscardHeuristic::BitLength && level < levels {
                                let next = level + 1;
                                assert!(
                                    tier_size(w, next) < tw || tier_size(h, next) < th,
                                    "{w}x{h} -> {tw}x{th}: level {level} is not the coarsest"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_adjusted_ratios_respect_limits() {
        let limits = ExpansionLimits {
            min_product: 0.05,
            max_x: 3.0,
            max_y: 2.0,
        };
        for (w, h, sw, sh) in [(1000, 1000, 10, 10), (500, 300, 2000, 2000), (640, 480, 1, 479), (90, 60, 91, 1)] {
            let params = DecodeParameters::derive(
                Region::new(0, 0, w, h),
                sw,
                sh,
                3,
                DiscardHeuristic::BitLength,
                limits,
            );
            assert!(params.ratio_x() <= limits.max_x, "{params:?}");
            assert!(params.ratio_y() <= limits.max_y, "{params:?}");
            assert!(params.expand_numerator.x >= 1 && params.expand_numerator.y >= 1);
        }
    }
}
