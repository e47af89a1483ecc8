use crate::capture::config::{Resolution, Rotation};

/// Rotates a packed image of `src_res` and `channels` bytes per pixel into `dst`.
///
/// `dst` must be the same length as `src`. For `Rotation::None` this is a copy.
pub fn rotate_into(src: &[u8], dst: &mut [u8], src_res: Resolution, channels: usize, rotation: Rotation) {
    debug_assert_eq!(src.len(), dst.len());
    let (w, h) = (src_res.width as usize, src_res.height as usize);

    if rotation == Rotation::None {
        dst.copy_from_slice(src);
        return;
    }

    for y in 0..h {
        for x in 0..w {
            let (dx, dy, dst_w) = match rotation {
                Rotation::Clockwise90 => (h - 1 - y, x, h),
                Rotation::CounterClockwise90 => (y, w - 1 - x, h),
                Rotation::Rotate180 => (w - 1 - x, h - 1 - y, w),
                Rotation::None => (x, y, w),
            };
            let s = (y * w + x) * channels;
            let d = (dy * dst_w + dx) * channels;
            dst[d..d + channels].copy_from_slice(&src[s..s + channels]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 3x2 single channel:
    // 1 2 3
    // 4 5 6
    const SRC: [u8; 6] = [1, 2, 3, 4, 5, 6];
    const RES: Resolution = Resolution::new(3, 2);

    fn rotated(rotation: Rotation) -> [u8; 6] {
        let mut dst = [0u8; 6];
        rotate_into(&SRC, &mut dst, RES, 1, rotation);
        dst
    }

    #[test]
    fn clockwise() {
        // 4 1
        // 5 2
        // 6 3
        assert_eq!(rotated(Rotation::Clockwise90), [4, 1, 5, 2, 6, 3]);
    }

    #[test]
    fn counter_clockwise() {
        // 3 6
        // 2 5
        // 1 4
        assert_eq!(rotated(Rotation::CounterClockwise90), [3, 6, 2, 5, 1, 4]);
    }

    #[test]
    fn half_turn_and_identity() {
        assert_eq!(rotated(Rotation::Rotate180), [6, 5, 4, 3, 2, 1]);
        assert_eq!(rotated(Rotation::None), SRC);
    }

    #[test]
    fn keeps_pixels_together() {
        let src = [1, 1, 2, 2];
        let mut dst = [0u8; 4];
        rotate_into(&src, &mut dst, Resolution::new(2, 1), 2, Rotation::Rotate180);
        assert_eq!(dst, [2, 2, 1, 1]);
    }
}
