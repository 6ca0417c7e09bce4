//! Images attached to notifications: gcode thumbnails at print start and
//! camera snapshots while printing, with retry and optional vertical flip.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};

use crate::config::PrinterConfig;
use crate::config::constants::{IMAGE_REQUEST_TIMEOUT, IMAGE_RETRY_DELAY, MAX_IMAGE_RETRIES};
use crate::error::ImageError;
use crate::moonraker::{self, PrinterRpc};

/// Source of the images attached to notifications.
///
/// Both methods return `None` when no image is available; a missing image
/// never blocks a notification.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Largest thumbnail embedded in the gcode file `filename`.
    async fn thumbnail(&self, filename: &str) -> Option<Vec<u8>>;

    /// Live snapshot from the printer camera.
    async fn snapshot(&self) -> Option<Vec<u8>>;
}

/// Fetches thumbnails and camera snapshots from the printer host.
pub struct PrinterImages {
    http: reqwest::Client,
    rpc: Arc<dyn PrinterRpc>,
    base_url: String,
    cam_url: String,
    flip_camera: bool,
    max_retries: u32,
    retry_delay: Duration,
}

impl PrinterImages {
    /// Create an image source for one printer.
    ///
    /// # Arguments
    ///
    /// * `printer` - Backend base URL, camera URL and flip setting
    /// * `rpc` - Backend connection, used to list a file's thumbnails
    pub fn new(printer: &PrinterConfig, rpc: Arc<dyn PrinterRpc>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(IMAGE_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to a client without timeout: {}", e);
                reqwest::Client::new()
            });
        Self {
            http,
            rpc,
            base_url: printer.base_url().to_string(),
            cam_url: printer.cam_url.clone(),
            flip_camera: printer.flip_camera,
            max_retries: MAX_IMAGE_RETRIES,
            retry_delay: IMAGE_RETRY_DELAY,
        }
    }

    /// URL under which the backend serves a thumbnail path.
    pub fn thumbnail_url(&self, thumbnail_path: &str) -> String {
        format!(
            "{}/server/files/gcodes/{}",
            self.base_url,
            thumbnail_path.trim_start_matches('/')
        )
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ImageError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| ImageError::Download {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ImageError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let data = response
            .bytes()
            .await
            .map_err(|source| ImageError::Download {
                url: url.to_string(),
                source,
            })?;
        Ok(data.to_vec())
    }

    /// Download the camera snapshot, retrying up to `max_retries` times.
    ///
    /// # Errors
    ///
    /// Returns the last download error once every attempt has failed.
    async fn fetch_snapshot_with_retry(&self) -> Result<Vec<u8>, ImageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download(&self.cam_url).await {
                Ok(data) => return Ok(data),
                Err(e) if attempt < self.max_retries => {
                    warn!("Failed to fetch camera snapshot (attempt {}): {}", attempt, e);
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ImageSource for PrinterImages {
    async fn thumbnail(&self, filename: &str) -> Option<Vec<u8>> {
        let largest = moonraker::thumbnails(self.rpc.as_ref(), filename)
            .await
            .into_iter()
            .next()?;

        let url = self.thumbnail_url(&largest.thumbnail_path);
        match self.download(&url).await {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Failed to fetch thumbnail for '{}': {}", filename, e);
                None
            }
        }
    }

    async fn snapshot(&self) -> Option<Vec<u8>> {
        let data = match self.fetch_snapshot_with_retry().await {
            Ok(data) => data,
            Err(e) => {
                warn!("Giving up on camera snapshot: {}", e);
                return None;
            }
        };

        match apply_image_transformations(&data, self.flip_camera) {
            Ok(processed) => Some(processed),
            Err(e) => {
                info!("Sending camera snapshot untransformed: {}", e);
                Some(data)
            }
        }
    }
}

/// Flip an image vertically when `flip_vertical` is set, keeping its format.
///
/// # Arguments
///
/// * `image_data` - Encoded image bytes (JPEG, PNG, ...)
/// * `flip_vertical` - Mirror top to bottom, for upside-down cameras
///
/// # Errors
///
/// Returns an error if the image cannot be decoded or re-encoded.
pub fn apply_image_transformations(
    image_data: &[u8],
    flip_vertical: bool,
) -> Result<Vec<u8>, ImageError> {
    if !flip_vertical {
        return Ok(image_data.to_vec());
    }

    let flipped = image::load_from_memory(image_data)?.flipv();

    let mut buffer = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buffer);
    let format = image::guess_format(image_data).unwrap_or(image::ImageFormat::Jpeg);
    flipped.write_to(&mut cursor, format)?;

    Ok(buffer)
}
