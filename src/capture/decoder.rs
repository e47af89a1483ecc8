use jpeg_decoder::Decoder;
use thiserror::Error;

use super::frame::PixelFormat;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("jpeg decode failed: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("decoded image is {actual} bytes, expected {expected}")]
    Size { expected: usize, actual: usize },

    #[error("cannot convert {from:?} to {channels} channels")]
    Unsupported { from: PixelFormat, channels: usize },
}

/// Decodes a raw device buffer into `out`, which holds `channels` bytes per pixel.
pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    channels: usize,
    out: &mut [u8],
) -> Result<(), DecodeError> {
    match format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder.decode()?;
            let info_channels = match decoder.info().map(|info| info.pixel_format) {
                Some(jpeg_decoder::PixelFormat::L8) => 1,
                Some(jpeg_decoder::PixelFormat::CMYK32) => 4,
                _ => 3,
            };
            convert_packed(&pixels, info_channels, false, channels, out)
        }
        PixelFormat::Rgb24 => convert_packed(data, 3, false, channels, out),
        PixelFormat::Bgr24 => convert_packed(data, 3, true, channels, out),
        PixelFormat::Gray8 => convert_packed(data, 1, false, channels, out),
        PixelFormat::Yuyv4 => yuyv_to_rgb(data, channels, out),
    }
}

fn convert_packed(
    src: &[u8],
    src_channels: usize,
    swap_rb: bool,
    channels: usize,
    out: &mut [u8],
) -> Result<(), DecodeError> {
    let pixels = out.len() / channels;
    if src.len() != pixels * src_channels {
        return Err(DecodeError::Size {
            expected: pixels * src_channels,
            actual: src.len(),
        });
    }

    if src_channels == channels && !swap_rb {
        out.copy_from_slice(src);
        return Ok(());
    }

    for (px, dst) in src.chunks_exact(src_channels).zip(out.chunks_exact_mut(channels)) {
        let (r, g, b) = match src_channels {
            1 => (px[0], px[0], px[0]),
            _ if swap_rb => (px[2], px[1], px[0]),
            _ => (px[0], px[1], px[2]),
        };
        write_pixel(dst, r, g, b);
    }
    Ok(())
}

fn write_pixel(dst: &mut [u8], r: u8, g: u8, b: u8) {
    match dst.len() {
        1 => dst[0] = ((r as u16 * 77 + g as u16 * 150 + b as u16 * 29) >> 8) as u8,
        3 => dst.copy_from_slice(&[r, g, b]),
        _ => {
            dst[..3].copy_from_slice(&[r, g, b]);
            dst[3] = u8::MAX;
        }
    }
}

/// YUYV 4:2:2 to RGB, BT.601 integer approximation.
fn yuyv_to_rgb(src: &[u8], channels: usize, out: &mut [u8]) -> Result<(), DecodeError> {
    if channels != 3 && channels != 4 && channels != 1 {
        return Err(DecodeError::Unsupported {
            from: PixelFormat::Yuyv4,
            channels,
        });
    }
    let pixels = out.len() / channels;
    if src.len() != pixels * 2 {
        return Err(DecodeError::Size {
            expected: pixels * 2,
            actual: src.len(),
        });
    }

    let mut dst = out.chunks_exact_mut(channels);
    for quad in src.chunks_exact(4) {
        let (u, v) = (quad[1] as i32 - 128, quad[3] as i32 - 128);
        for y in [quad[0], quad[2]] {
            let c = y as i32 - 16;
            let r = clamp((298 * c + 409 * v + 128) >> 8);
            let g = clamp((298 * c - 100 * u - 208 * v + 128) >> 8);
            let b = clamp((298 * c + 516 * u + 128) >> 8);
            if let Some(px) = dst.next() {
                if channels == 1 {
                    px[0] = y;
                } else {
                    write_pixel(px, r, g, b);
                }
            }
        }
    }
    Ok(())
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_swaps_to_rgb() {
        let src = [1, 2, 3, 4, 5, 6];
        let mut out = [0u8; 6];
        decode_frame(&src, PixelFormat::Bgr24, 3, &mut out).unwrap();
        assert_eq!(out, [3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn gray_expands_to_rgba() {
        let src = [9, 200];
        let mut out = [0u8; 8];
        decode_frame(&src, PixelFormat::Gray8, 4, &mut out).unwrap();
        assert_eq!(out, [9, 9, 9, 255, 200, 200, 200, 255]);
    }

    #[test]
    fn yuyv_white_and_black() {
        // Y=235 is white, Y=16 is black, neutral chroma
        let src = [235, 128, 16, 128];
        let mut out = [0u8; 6];
        decode_frame(&src, PixelFormat::Yuyv4, 3, &mut out).unwrap();
        assert_eq!(&out[..3], &[255, 255, 255]);
        assert_eq!(&out[3..], &[0, 0, 0]);
    }

    #[test]
    fn size_mismatch_is_reported() {
        let mut out = [0u8; 12];
        let err = decode_frame(&[0u8; 5], PixelFormat::Rgb24, 3, &mut out).unwrap_err();
        assert!(matches!(err, DecodeError::Size { expected: 12, actual: 5 }));
    }

    #[test]
    fn corrupt_jpeg_fails() {
        let mut out = [0u8; 12];
        assert!(decode_frame(&[0xff, 0x00, 0x12], PixelFormat::Mjpeg, 3, &mut out).is_err());
    }
}
