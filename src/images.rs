//! Image pipeline: identity, fetch, metadata, storage.
//!
//! Every image URL maps to a stable id (md5 of the URL, or of the basename
//! for local files) and a target file name. [`ImagePipeline::download`]
//! reuses an already stored file unless overwriting, otherwise fetches the
//! bytes (local read or HTTP GET with the session cookies), converts them to
//! the configured format, stores them, and returns the `downloads` row.
//!
//! Deduplication by database row happens one level up, in the extraction
//! engine; this module only guards against re-fetching a file that was
//! stored by a run that crashed before committing.

use anyhow::{anyhow, bail, Context, Result};
use image::metadata::Orientation;
use image::{ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use playscrape_core::identity::content_hash;
use playscrape_core::models::Download;

use crate::object_store::Storage;

// ═══════════════════════════════════════════════════════════════════════
// Output format
// ═══════════════════════════════════════════════════════════════════════

/// Format images are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Keep the source bytes and the source file name.
    Original,
    Encoded {
        extension: &'static str,
        format: ImageFormat,
    },
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Encoded {
            extension: "jpg",
            format: ImageFormat::Jpeg,
        }
    }
}

impl OutputFormat {
    pub fn parse(s: &str) -> Result<Self> {
        let (extension, format) = match s.trim().to_ascii_lowercase().as_str() {
            "original" => return Ok(OutputFormat::Original),
            "jpg" | "jpeg" => ("jpg", ImageFormat::Jpeg),
            "png" => ("png", ImageFormat::Png),
            "webp" => ("webp", ImageFormat::WebP),
            "gif" => ("gif", ImageFormat::Gif),
            "bmp" => ("bmp", ImageFormat::Bmp),
            other => bail!(
                "Unknown image format '{}'. Expected jpg, png, webp, gif, bmp, or original.",
                other
            ),
        };
        Ok(OutputFormat::Encoded { extension, format })
    }

    /// File extension of stored images; `None` for `original`.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            OutputFormat::Original => None,
            OutputFormat::Encoded { extension, .. } => Some(extension),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Identity
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Local(PathBuf),
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTarget {
    pub id: String,
    pub file_name: String,
    pub source: ImageSource,
}

/// Resolve the id, stored file name, and source of an image URL.
pub fn image_target(url: &str, format: &OutputFormat) -> Result<ImageTarget> {
    let (id, name, source) = if url.starts_with("file://") || url.starts_with('/') {
        let path = if url.starts_with("file://") {
            url::Url::parse(url)
                .ok()
                .and_then(|u| u.to_file_path().ok())
                .ok_or_else(|| anyhow!("Invalid file URL: {}", url))?
        } else {
            PathBuf::from(url)
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Local image has no file name: {}", url))?;
        (content_hash(&name), name, ImageSource::Local(path))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let parsed = url::Url::parse(url).with_context(|| format!("Invalid image URL: {}", url))?;
        let name = parsed
            .path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("image")
            .to_string();
        (content_hash(url), name, ImageSource::Remote(url.to_string()))
    } else {
        bail!("Local file must be an absolute path. ({})", url);
    };

    let name = if name.contains('.') {
        name
    } else {
        format!("{}.jpg", name)
    };
    let file_name = match format.extension() {
        None => name,
        Some(ext) => format!("{}.{}", id, ext),
    };

    Ok(ImageTarget {
        id,
        file_name,
        source,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Metadata
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub format: Option<ImageFormat>,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    /// EXIF orientation, 1 through 8.
    pub orientation: u8,
}

impl ImageMeta {
    /// Width and height as displayed.
    pub fn normal_size(&self) -> (u32, u32) {
        normal_size(self.width, self.height, self.orientation)
    }
}

/// Orientations 5 through 8 are rotated a quarter turn.
pub fn normal_size(width: u32, height: u32, orientation: u8) -> (u32, u32) {
    if orientation >= 5 {
        (height, width)
    } else {
        (width, height)
    }
}

fn exif_number(o: Orientation) -> u8 {
    match o {
        Orientation::NoTransforms => 1,
        Orientation::FlipHorizontal => 2,
        Orientation::Rotate180 => 3,
        Orientation::FlipVertical => 4,
        Orientation::Rotate90FlipH => 5,
        Orientation::Rotate90 => 6,
        Orientation::Rotate270FlipH => 7,
        Orientation::Rotate270 => 8,
    }
}

pub fn read_metadata(bytes: &[u8]) -> Result<ImageMeta> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("Failed to read image")?;
    let format = reader.format();
    let mut decoder = reader
        .into_decoder()
        .context("Unsupported or corrupt image")?;
    let (width, height) = decoder.dimensions();
    let orientation = decoder.orientation().map(exif_number).unwrap_or(1);
    Ok(ImageMeta {
        format,
        size: bytes.len() as u64,
        width,
        height,
        orientation,
    })
}

fn format_name(format: ImageFormat) -> String {
    format!("{:?}", format).to_lowercase()
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════

pub struct ImagePipeline {
    client: reqwest::Client,
    storage: Storage,
    format: OutputFormat,
    overwrite: bool,
    timeout: Duration,
}

impl ImagePipeline {
    pub fn new(
        client: reqwest::Client,
        storage: Storage,
        format: OutputFormat,
        overwrite: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            storage,
            format,
            overwrite,
            timeout,
        }
    }

    pub fn target(&self, url: &str) -> Result<ImageTarget> {
        image_target(url, &self.format)
    }

    /// Fetch or reuse one image and describe it as a `downloads` row.
    ///
    /// `cookies` is a ready `Cookie` header value.
    pub async fn download(&self, record_id: &str, url: &str, cookies: &str) -> Result<Download> {
        let target = self.target(url)?;

        let stored = if self.overwrite {
            None
        } else {
            match self.storage.get(&target.file_name).await {
                Ok(bytes) => bytes,
                Err(e) if self.storage.is_remote() => {
                    tracing::warn!(error = %e, key = %target.file_name, "Could not check stored image");
                    None
                }
                Err(e) => return Err(e),
            }
        };

        let meta = match stored {
            Some(bytes) => {
                tracing::debug!(file = %self.storage.describe(&target.file_name), "Image already stored");
                read_metadata(&bytes)?
            }
            None => {
                let bytes = self.fetch(&target.source, cookies).await?;
                let meta = read_metadata(&bytes)
                    .with_context(|| format!("Failed to decode image {}", url))?;
                let encoded = self.encode(bytes, &meta)?;
                let content_type = mime_guess::from_path(&target.file_name)
                    .first_raw()
                    .unwrap_or("image/jpeg");
                match self.storage.put(&target.file_name, encoded, content_type).await {
                    Ok(()) => {
                        tracing::debug!(file = %self.storage.describe(&target.file_name), "Stored image")
                    }
                    Err(e) if self.storage.is_remote() => {
                        tracing::error!(error = %e, key = %target.file_name, "Image upload failed")
                    }
                    Err(e) => return Err(e),
                }
                meta
            }
        };

        let (width, height) = meta.normal_size();
        let now = chrono::Utc::now().timestamp();
        Ok(Download {
            id: target.id,
            record_id: record_id.to_string(),
            width,
            height,
            file_size: Some(meta.size),
            file_name: target.file_name,
            orig_format: meta.format.map(format_name),
            orig_url: url.to_string(),
            orig_cookies: (!cookies.is_empty()).then(|| cookies.to_string()),
            created_at: now,
            updated_at: now,
        })
    }

    async fn fetch(&self, source: &ImageSource, cookies: &str) -> Result<Vec<u8>> {
        match source {
            ImageSource::Local(path) => read_local(path).await,
            ImageSource::Remote(url) => {
                let mut req = self.client.get(url).timeout(self.timeout);
                if !cookies.is_empty() {
                    req = req.header(reqwest::header::COOKIE, cookies);
                }
                let resp = req
                    .send()
                    .await
                    .with_context(|| format!("Failed to fetch image {}", url))?;
                if !resp.status().is_success() {
                    bail!("Failed to download image. Status: {}", resp.status().as_u16());
                }
                let header = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let bytes = resp.bytes().await?.to_vec();
                let content_type = header
                    .or_else(|| infer::get(&bytes).map(|k| k.mime_type().to_string()))
                    .unwrap_or_default();
                if !content_type.contains("image/") {
                    bail!("Failed to download image. Content-Type: {}", content_type);
                }
                Ok(bytes)
            }
        }
    }

    fn encode(&self, bytes: Vec<u8>, meta: &ImageMeta) -> Result<Vec<u8>> {
        let OutputFormat::Encoded { format, .. } = self.format else {
            return Ok(bytes);
        };
        if meta.format == Some(format) {
            return Ok(bytes);
        }
        let img = image::load_from_memory(&bytes).context("Failed to decode image")?;
        let img = match format {
            ImageFormat::Jpeg => image::DynamicImage::ImageRgb8(img.to_rgb8()),
            _ => img,
        };
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format)
            .with_context(|| format!("Failed to encode image as {}", format_name(format)))?;
        Ok(out.into_inner())
    }
}

async fn read_local(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read local image {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn remote_targets_hash_the_url() {
        let url = "https://example.com/media/starry-night";
        let t = image_target(url, &OutputFormat::default()).unwrap();
        assert_eq!(t.id, content_hash(url));
        assert_eq!(t.file_name, format!("{}.jpg", t.id));
        assert_eq!(t.source, ImageSource::Remote(url.to_string()));

        let original = image_target(url, &OutputFormat::Original).unwrap();
        assert_eq!(original.file_name, "starry-night.jpg");
    }

    #[test]
    fn local_targets_hash_the_basename() {
        let a = image_target("/data/a/cat.png", &OutputFormat::Original).unwrap();
        let b = image_target("file:///data/b/cat.png", &OutputFormat::Original).unwrap();
        assert_eq!(a.id, content_hash("cat.png"));
        assert_eq!(a.id, b.id);
        assert_eq!(a.file_name, "cat.png");
        assert_eq!(b.source, ImageSource::Local(PathBuf::from("/data/b/cat.png")));

        let err = image_target("images/cat.png", &OutputFormat::default()).unwrap_err();
        assert!(err.to_string().contains("Local file must be an absolute path."));
    }

    #[test]
    fn orientation_swaps_from_five() {
        assert_eq!(normal_size(100, 200, 6), (200, 100));
        assert_eq!(normal_size(100, 200, 5), (200, 100));
        assert_eq!(normal_size(100, 200, 1), (100, 200));
        assert_eq!(normal_size(100, 200, 4), (100, 200));
    }

    #[test]
    fn metadata_of_plain_png() {
        let meta = read_metadata(&png(3, 5)).unwrap();
        assert_eq!(meta.format, Some(ImageFormat::Png));
        assert_eq!((meta.width, meta.height), (3, 5));
        assert_eq!(meta.orientation, 1);
        assert!(read_metadata(b"not an image").is_err());
    }

    #[test]
    fn format_parsing() {
        assert_eq!(OutputFormat::parse("JPEG").unwrap().extension(), Some("jpg"));
        assert_eq!(OutputFormat::parse("webp").unwrap().extension(), Some("webp"));
        assert_eq!(OutputFormat::parse("original").unwrap(), OutputFormat::Original);
        assert!(OutputFormat::parse("tiff").is_err());
    }

    #[tokio::test]
    async fn local_download_converts_and_stores() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = tmp.path().join("cat.png");
        std::fs::write(&src, png(4, 2)).unwrap();

        let pipeline = ImagePipeline::new(
            reqwest::Client::new(),
            Storage::Local {
                dir: tmp.path().join("images"),
            },
            OutputFormat::default(),
            false,
            Duration::from_secs(5),
        );
        let url = src.to_string_lossy().into_owned();
        let dl = pipeline.download("rec", &url, "").await.unwrap();
        assert_eq!(dl.id, content_hash("cat.png"));
        assert_eq!((dl.width, dl.height), (4, 2));
        assert_eq!(dl.orig_format.as_deref(), Some("png"));
        assert_eq!(dl.orig_cookies, None);

        let stored = std::fs::read(tmp.path().join("images").join(&dl.file_name)).unwrap();
        assert_eq!(
            read_metadata(&stored).unwrap().format,
            Some(ImageFormat::Jpeg)
        );

        // A second pass reuses the stored file even if the source is gone.
        std::fs::remove_file(&src).unwrap();
        let again = pipeline.download("rec", &url, "").await.unwrap();
        assert_eq!(again.file_name, dl.file_name);
    }
}
