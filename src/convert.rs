use yuv::{
    bgra_to_yuv420, BufferStoreMut, YuvConversionMode, YuvPlanarImageMut, YuvRange,
    YuvStandardMatrix,
};

use crate::{
    error::{Error, MediaErrorKind},
    frame::I420Buffer,
};

const BYTES_PER_PIXEL: usize = 4;

/// Converts a BGRA desktop image (B, G, R, A byte order) into a packed [`I420Buffer`].
///
/// BT.601 limited range. Odd widths and heights round the chroma planes up.
pub fn bgra_to_i420(
    src: &[u8],
    src_stride: usize,
    width: u32,
    height: u32,
) -> Result<I420Buffer, Error> {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 {
        return Err(Error::new_media(
            format!("cannot convert empty frame {}x{}", width, height),
            MediaErrorKind::ConvertError,
        ));
    }
    if src_stride < w * BYTES_PER_PIXEL {
        return Err(Error::new_media(
            format!("stride {} is shorter than a row of {} pixels", src_stride, w),
            MediaErrorKind::ConvertError,
        ));
    }
    let required = src_stride * h;
    if src.len() < required {
        return Err(Error::new_media(
            format!("frame holds {} bytes, {} required", src.len(), required),
            MediaErrorKind::ConvertError,
        ));
    }

    let (cw, ch) = I420Buffer::chroma_dimensions(width, height);
    let mut data = vec![0u8; I420Buffer::buffer_size(width, height)];
    {
        let (y_plane, uv_planes) = data.split_at_mut(w * h);
        let (u_plane, v_plane) = uv_planes.split_at_mut(cw * ch);
        let mut planar = YuvPlanarImageMut {
            y_plane: BufferStoreMut::Borrowed(y_plane),
            y_stride: width,
            u_plane: BufferStoreMut::Borrowed(u_plane),
            u_stride: cw as u32,
            v_plane: BufferStoreMut::Borrowed(v_plane),
            v_stride: cw as u32,
            width,
            height,
        };
        bgra_to_yuv420(
            &mut planar,
            &src[..required],
            src_stride as u32,
            YuvRange::Limited,
            YuvStandardMatrix::Bt601,
            YuvConversionMode::Balanced,
        )
        .map_err(|e| {
            Error::new_media(
                format!("failed to convert {}x{} frame: {}", width, height, e),
                MediaErrorKind::ConvertError,
            )
        })?;
    }

    Ok(I420Buffer::from_planes(width, height, data))
}
