// Identity token encoding
// A scannable QR code carrying the identity key, so a dog can be looked up
// again without retyping its name

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use std::io::Cursor;
use std::sync::Arc;

use crate::config::TokenConfig;
use crate::identity::IdentityKey;

/// Renders a payload as a 2D barcode image (PNG bytes)
pub trait BarcodeRenderer: Send + Sync {
    fn render_barcode(&self, payload: &str) -> Result<Vec<u8>>;
}

/// QR renderer: error correction L, smallest version that fits
pub struct QrCodeRenderer {
    module_size: u32,
    quiet_zone: bool,
}

impl QrCodeRenderer {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            module_size: config.module_size.max(1),
            quiet_zone: config.quiet_zone,
        }
    }
}

impl Default for QrCodeRenderer {
    fn default() -> Self {
        Self::new(&TokenConfig::default())
    }
}

impl BarcodeRenderer for QrCodeRenderer {
    fn render_barcode(&self, payload: &str) -> Result<Vec<u8>> {
        let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::L)
            .map_err(|e| anyhow!("Failed to encode QR payload: {}", e))?;

        let image = code
            .render::<Luma<u8>>()
            .module_dimensions(self.module_size, self.module_size)
            .quiet_zone(self.quiet_zone)
            .build();

        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("Failed to encode QR image")?;
        Ok(bytes)
    }
}

/// Chooses the token payload and artifact name; rendering is delegated
#[derive(Clone)]
pub struct TokenEncoder {
    renderer: Arc<dyn BarcodeRenderer>,
}

impl TokenEncoder {
    pub fn new(renderer: Arc<dyn BarcodeRenderer>) -> Self {
        Self { renderer }
    }

    /// Render the token for a key. The payload is the raw key string.
    pub fn encode(&self, key: &IdentityKey) -> Result<Vec<u8>> {
        self.renderer.render_barcode(key.as_str())
    }

    /// Artifact name for the token of an uploaded file
    pub fn artifact_name(upload_name: &str) -> String {
        format!("qr_{}.png", upload_name)
    }
}
