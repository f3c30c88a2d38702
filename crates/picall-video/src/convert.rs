//! I420 → packed RGB24 conversion (BT.601).

use picall_core::{PicallError, VideoFrame};

/// Borrowed planes of one I420 frame.
pub struct I420Planes<'a> {
    pub width: u32,
    pub height: u32,
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub stride_y: u32,
    pub stride_u: u32,
    pub stride_v: u32,
}

impl I420Planes<'_> {
    fn check(&self) -> Result<(), PicallError> {
        let (w, h) = (self.width as usize, self.height as usize);
        let chroma_w = w.div_ceil(2);
        let chroma_h = h.div_ceil(2);

        let fits = |plane: &[u8], stride: u32, cols: usize, rows: usize| {
            let stride = stride as usize;
            rows == 0 || (stride >= cols && plane.len() >= (rows - 1) * stride + cols)
        };

        if !fits(self.y, self.stride_y, w, h)
            || !fits(self.u, self.stride_u, chroma_w, chroma_h)
            || !fits(self.v, self.stride_v, chroma_w, chroma_h)
        {
            return Err(PicallError::Media(format!(
                "i420 planes too small for {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn to_rgb(&self) -> Result<VideoFrame, PicallError> {
        self.check()?;

        let w = self.width as usize;
        let h = self.height as usize;
        let mut rgb = vec![0u8; w * h * 3];

        for row in 0..h {
            for col in 0..w {
                let y_idx = row * self.stride_y as usize + col;
                let u_idx = (row / 2) * self.stride_u as usize + (col / 2);
                let v_idx = (row / 2) * self.stride_v as usize + (col / 2);

                let y = self.y[y_idx] as f32;
                let u = self.u[u_idx] as f32 - 128.0;
                let v = self.v[v_idx] as f32 - 128.0;

                let out_idx = (row * w + col) * 3;
                rgb[out_idx] = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
                rgb[out_idx + 1] = (y - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8;
                rgb[out_idx + 2] = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
            }
        }

        Ok(VideoFrame {
            width: self.width,
            height: self.height,
            rgb,
        })
    }
}
