use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use lumen_contracts::providers::NamedProvider;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{JobRequest, MediaBytes, MediaProvider};

const IMAGE_PREFIX: &str = "dryrun://image/";
const VIDEO_PREFIX: &str = "dryrun://video/";
const UPLOAD_PREFIX: &str = "dryrun://upload/";
const DRYRUN_SIZE: u32 = 64;

/// Offline provider. Images are solid colors derived from the prompt; videos
/// are a small placeholder payload.
#[derive(Debug, Default, Clone)]
pub struct DryrunProvider;

impl DryrunProvider {
    pub fn new() -> Self {
        Self
    }
}

impl NamedProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }
}

impl MediaProvider for DryrunProvider {
    fn upload(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(&hasher.finalize()[..6]);
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("upload.png");
        Ok(format!("{UPLOAD_PREFIX}{digest}/{name}"))
    }

    fn submit(&self, job: &JobRequest) -> Result<Value> {
        let seed = job.sources.join("|");
        if job.kind.produces_video() {
            let id = short_id(&job.prompt, &seed, 0);
            return Ok(json!({
                "status": "succeeded",
                "video": {"url": format!("{VIDEO_PREFIX}{id}.mp4")},
            }));
        }
        let images: Vec<Value> = (0..job.count.max(1))
            .map(|idx| {
                let id = short_id(&job.prompt, &seed, u64::from(idx));
                json!({"url": format!("{IMAGE_PREFIX}{id}.png")})
            })
            .collect();
        Ok(json!({
            "status": "succeeded",
            "output": {"images": images},
        }))
    }

    fn download(&self, url: &str) -> Result<MediaBytes> {
        if let Some(name) = url.strip_prefix(IMAGE_PREFIX) {
            let (r, g, b) = color_from_id(name);
            let mut image = RgbImage::new(DRYRUN_SIZE, DRYRUN_SIZE);
            for pixel in image.pixels_mut() {
                *pixel = Rgb([r, g, b]);
            }
            let mut bytes = Vec::new();
            DynamicImage::ImageRgb8(image)
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
                .context("failed to encode dryrun image")?;
            return Ok(MediaBytes {
                bytes,
                mime_type: Some("image/png".to_string()),
            });
        }
        if let Some(name) = url.strip_prefix(VIDEO_PREFIX) {
            return Ok(MediaBytes {
                bytes: format!("LUMEN-DRYRUN-VIDEO {name}\n").into_bytes(),
                mime_type: Some("video/mp4".to_string()),
            });
        }
        bail!("dryrun provider cannot download {url}")
    }
}

fn short_id(prompt: &str, seed: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.as_bytes());
    hasher.update(idx.to_be_bytes());
    hex::encode(&hasher.finalize()[..4])
}

fn color_from_id(id: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(id.as_bytes());
    (digest[0], digest[1], digest[2])
}
