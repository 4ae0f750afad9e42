//! Pixel readback with alpha compositing.
//!
//! Copies a rectangle of RGBA pixels from a rendering surface onto a locked
//! destination image. Surfaces store rows bottom-up and images top-down, so
//! rows are flipped on the way. Each source pixel is blended source-over onto
//! what the destination already holds, and the result is left opaque.

/// Errors reported by [`BlitContext::blit`].
#[derive(Debug, thiserror::Error)]
pub enum BlitError {
    #[error("failed to lock destination pixels: {0}")]
    Lock(String),

    #[error("failed to read surface pixels: {0}")]
    ReadPixels(String),

    #[error("failed to unlock destination pixels: {0}")]
    Unlock(String),

    #[error("region {width}x{height} at ({x}, {y}) exceeds the {image_width}x{image_height} destination")]
    OutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        image_width: usize,
        image_height: usize,
    },
}

/// Geometry of a destination image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: usize,
    pub height: usize,
    /// Bytes per row, at least `width * 4`.
    pub stride: usize,
}

/// A surface that can read back a rectangle of pixels.
pub trait PixelReader {
    /// Fills `out` with `width * height` RGBA pixels, bottom row first.
    fn read_pixels(
        &mut self,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        out: &mut [u8],
    ) -> Result<(), String>;
}

/// An RGBA image whose pixels must be locked before writing.
pub trait LockableImage {
    fn info(&self) -> ImageInfo;

    fn lock_pixels(&mut self) -> Result<(), String>;

    /// The pixel rows. Only valid between lock and unlock.
    fn pixels_mut(&mut self) -> &mut [u8];

    fn unlock_pixels(&mut self) -> Result<(), String>;
}

/// In-memory RGBA image.
#[derive(Debug, Clone)]
pub struct RgbaImage {
    info: ImageInfo,
    pixels: Vec<u8>,
    locked: bool,
}

impl RgbaImage {
    /// Creates a transparent black image with tightly packed rows.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            info: ImageInfo {
                width,
                height,
                stride: width * 4,
            },
            pixels: vec![0; width * height * 4],
            locked: false,
        }
    }

    /// Fills every pixel with `rgba`.
    pub fn fill(&mut self, rgba: [u8; 4]) {
        for pixel in self.pixels.chunks_exact_mut(4) {
            pixel.copy_from_slice(&rgba);
        }
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let at = y * self.info.stride + x * 4;
        [
            self.pixels[at],
            self.pixels[at + 1],
            self.pixels[at + 2],
            self.pixels[at + 3],
        ]
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl LockableImage for RgbaImage {
    fn info(&self) -> ImageInfo {
        self.info
    }

    fn lock_pixels(&mut self) -> Result<(), String> {
        if self.locked {
            return Err("already locked".into());
        }
        self.locked = true;
        Ok(())
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    fn unlock_pixels(&mut self) -> Result<(), String> {
        if !self.locked {
            return Err("not locked".into());
        }
        self.locked = false;
        Ok(())
    }
}

/// Blends one channel source-over.
fn composite(src: u8, dst: u8, alpha: u8) -> u8 {
    let a = alpha as u32;
    let blended = (a * src as u32 + (255 - a) * dst as u32) / 255;
    blended.min(255) as u8
}

/// Reusable readback state; one per caller thread.
#[derive(Debug, Default)]
pub struct BlitContext {
    scratch: Vec<u8>,
}

impl BlitContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Composites the `width x height` region at `(x, y)` of `reader` onto
    /// the same region of `dest`.
    ///
    /// `dest` is unlocked again even if the read fails, in which case its
    /// pixels are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`BlitError::OutOfBounds`] before locking if the region does
    /// not fit or `dest` reports a stride shorter than its rows, otherwise the first lock, read or unlock failure.
    pub fn blit(
        &mut self,
        reader: &mut dyn PixelReader,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        dest: &mut dyn LockableImage,
    ) -> Result<(), BlitError> {
        let info = dest.info();
        let fits = |start: usize, extent: usize, limit: usize| {
            start.checked_add(extent).is_some_and(|end| end <= limit)
        };
        let rows_fit = info.width.checked_mul(4).is_some_and(|row| row <= info.stride);
        if !rows_fit || !fits(x, width, info.width) || !fits(y, height, info.height) {
            return Err(BlitError::OutOfBounds {
                x,
                y,
                width,
                height,
                image_width: info.width,
                image_height: info.height,
            });
        }

        if width == 0 || height == 0 {
            return Ok(());
        }

        dest.lock_pixels().map_err(BlitError::Lock)?;

        let row_bytes = width * 4;
        let len = row_bytes * height;
        if self.scratch.len() < len {
            self.scratch.resize(len, 0);
        }
        let data = &mut self.scratch[..len];

        let read = reader.read_pixels(x, y, width, height, data);
        match &read {
            Ok(()) => {
                let pixels = dest.pixels_mut();
                for (row, src_row) in data.chunks_exact(row_bytes).rev().enumerate() {
                    let start = (y + row) * info.stride + x * 4;
                    let dst_row = &mut pixels[start..start + row_bytes];
                    for (dst, src) in dst_row.chunks_exact_mut(4).zip(src_row.chunks_exact(4)) {
                        let alpha = src[3];
                        dst[0] = composite(src[0], dst[0], alpha);
                        dst[1] = composite(src[1], dst[1], alpha);
                        dst[2] = composite(src[2], dst[2], alpha);
                        dst[3] = 255;
                    }
                }
            }
            Err(reason) => tracing::warn!(%reason, "pixel readback failed"),
        }

        let unlocked = dest.unlock_pixels().map_err(BlitError::Unlock);
        read.map_err(BlitError::ReadPixels)?;
        unlocked
    }
}
