//! Rendering pairing QR codes for operators.

use image::{ImageBuffer, Luma};
use qrcode::{Color, QrCode};
use std::path::{Path, PathBuf};
use wagate_core::error::GatewayError;

/// Unicode rendering for terminals.
pub fn render_terminal(qr_data: &str) -> Result<String, GatewayError> {
    let code = QrCode::new(qr_data.as_bytes())
        .map_err(|e| GatewayError::Protocol(format!("QR generation failed: {e}")))?;

    Ok(code
        .render::<char>()
        .quiet_zone(false)
        .module_dimensions(2, 1)
        .build())
}

/// PNG bytes.
pub fn render_png(qr_data: &str) -> Result<Vec<u8>, GatewayError> {
    let code = QrCode::new(qr_data.as_bytes())
        .map_err(|e| GatewayError::Protocol(format!("QR generation failed: {e}")))?;

    let module_size: u32 = 10;
    let quiet_zone: u32 = 2;
    let modules = code.width() as u32;
    let img_size = (modules + quiet_zone * 2) * module_size;

    let img = ImageBuffer::from_fn(img_size, img_size, |x, y| {
        let (cx, cy) = (x / module_size, y / module_size);
        if cx < quiet_zone || cy < quiet_zone {
            return Luma([255u8]);
        }
        let (mx, my) = (cx - quiet_zone, cy - quiet_zone);
        if mx >= modules || my >= modules {
            return Luma([255u8]);
        }
        match code[(mx as usize, my as usize)] {
            Color::Dark => Luma([0u8]),
            Color::Light => Luma([255u8]),
        }
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| GatewayError::Protocol(format!("PNG encoding failed: {e}")))?;

    Ok(buf.into_inner())
}

/// Path of a session's QR image under the data directory.
pub fn png_path(data_dir: &Path, session_id: &str) -> PathBuf {
    data_dir.join("qr").join(format!("{session_id}.png"))
}

/// Write the session's current QR image, replacing the previous one.
pub async fn write_png(
    data_dir: &Path,
    session_id: &str,
    qr_data: &str,
) -> Result<PathBuf, GatewayError> {
    let png = render_png(qr_data)?;
    let path = png_path(data_dir, session_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, png).await?;
    Ok(path)
}
