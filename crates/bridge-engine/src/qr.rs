//! Pairing challenge rendering.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use qrcode::render::svg;
use qrcode::QrCode;

use crate::error::SessionError;

const MIN_DIMENSION: u32 = 256;

/// Render a pairing code as a scannable SVG, returned as a `data:` URL that a
/// browser can drop straight into an `<img src>`.
pub fn render_data_url(code: &str) -> Result<String, SessionError> {
    let qr = QrCode::new(code.as_bytes())
        .map_err(|e| SessionError::Internal(format!("qr encode failed: {e}")))?;
    let image = qr
        .render::<svg::Color<'_>>()
        .min_dimensions(MIN_DIMENSION, MIN_DIMENSION)
        .quiet_zone(true)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}
