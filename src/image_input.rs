use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use image::{DynamicImage, ImageError, ImageFormat, ImageReader, Limits, RgbImage};
use reqwest::header::CONTENT_TYPE;
use std::{
    io::{Cursor, Read},
    path::{Path, PathBuf},
};

use crate::{config::ImageSettings, error::ValidationError};

/// Where the room photo comes from. Exactly one source per request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    FilePath(PathBuf),
    /// Base64 text, optionally wrapped in a `data:` URI.
    EncodedPayload(String),
}

impl ImageSource {
    /// Picks the single non-empty source out of the optional request fields.
    pub fn from_parts(
        url: Option<String>,
        path: Option<PathBuf>,
        payload: Option<String>,
    ) -> Result<Self, ValidationError> {
        let url = url.filter(|u| !u.trim().is_empty());
        let path = path.filter(|p| !p.as_os_str().is_empty());
        let payload = payload.filter(|p| !p.trim().is_empty());

        let provided = [url.is_some(), path.is_some(), payload.is_some()]
            .into_iter()
            .filter(|present| *present)
            .count();

        match (url, path, payload) {
            _ if provided > 1 => Err(ValidationError::AmbiguousInput(provided)),
            (Some(url), None, None) => Ok(ImageSource::Url(url)),
            (None, Some(path), None) => Ok(ImageSource::FilePath(path)),
            (None, None, Some(payload)) => Ok(ImageSource::EncodedPayload(payload)),
            _ => Err(ValidationError::NoInputProvided),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImageSource::Url(_) => "url",
            ImageSource::FilePath(_) => "file",
            ImageSource::EncodedPayload(_) => "base64",
        }
    }
}

/// A decoded RGB image that passed every validation check.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedImage {
    pixels: RgbImage,
}

impl ValidatedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }
}

/// Acquires room photos and rejects anything unusable before model work.
///
/// Holds no mutable state; one resolver can serve concurrent requests.
#[derive(Clone, Debug, Default)]
pub struct ImageResolver {
    settings: ImageSettings,
}

impl ImageResolver {
    pub fn new(settings: ImageSettings) -> Self {
        Self { settings }
    }

    pub fn resolve(&self, source: &ImageSource) -> Result<ValidatedImage, ValidationError> {
        log::debug!("Resolving image from {} source", source.kind());
        let bytes = match source {
            ImageSource::Url(url) => self.fetch(url)?,
            ImageSource::FilePath(path) => read_file(path)?,
            ImageSource::EncodedPayload(payload) => decode_payload(payload)?,
        };
        let image = self.decode(&bytes)?;
        self.validate(image)
    }

    /// Normalizes to 3-channel color and enforces the minimum resolution.
    pub fn validate(&self, image: DynamicImage) -> Result<ValidatedImage, ValidationError> {
        let pixels = image.into_rgb8();
        let (width, height) = pixels.dimensions();
        if width < self.settings.min_width || height < self.settings.min_height {
            return Err(ValidationError::TooSmall {
                width,
                height,
                min_width: self.settings.min_width,
                min_height: self.settings.min_height,
            });
        }
        log::debug!("Validated {width}x{height} image");
        Ok(ValidatedImage { pixels })
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>, ValidationError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.settings.fetch_timeout())
            .build()
            .map_err(|e| ValidationError::NetworkError(e.to_string()))?;

        let response = client
            .get(url)
            .send()
            .map_err(|e| ValidationError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ValidationError::NetworkError(format!(
                "{url} responded with {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if !content_type.to_ascii_lowercase().starts_with("image/") {
            return Err(ValidationError::NotAnImage {
                content_type: if content_type.is_empty() {
                    "missing".to_string()
                } else {
                    content_type
                },
            });
        }

        let limit = self.settings.max_alloc;
        if let Some(length) = response.content_length().filter(|length| *length > limit) {
            return Err(body_too_large(length, limit));
        }

        // Content-Length may be absent or wrong, so the read itself is capped too.
        let mut bytes = Vec::new();
        response
            .take(limit.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|e| ValidationError::NetworkError(e.to_string()))?;
        let read = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        if read > limit {
            return Err(body_too_large(read, limit));
        }
        Ok(bytes)
    }

    // Two decoder instances: the first only reads the header against the
    // safety limits, the second decodes the full body for pixel access and
    // fails on truncated or corrupt data.
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, ValidationError> {
        if bytes.is_empty() {
            return Err(ValidationError::Corrupt(
                "no image data in the provided source".to_string(),
            ));
        }

        let (width, height) = self
            .reader(bytes)?
            .into_dimensions()
            .map_err(classify_decode_error)?;
        if width > self.settings.max_dimension || height > self.settings.max_dimension {
            return Err(ValidationError::UnsafeImage(format!(
                "{width}x{height} exceeds the {} pixel limit per side",
                self.settings.max_dimension
            )));
        }

        let reader = self.reader(bytes)?;
        if let Some(format) = reader.format() {
            check_complete(format, bytes)?;
        }
        reader.decode().map_err(classify_decode_error)
    }

    fn reader<'a>(
        &self,
        bytes: &'a [u8],
    ) -> Result<ImageReader<Cursor<&'a [u8]>>, ValidationError> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ValidationError::Corrupt(e.to_string()))?;
        if reader.format().is_none() {
            return Err(ValidationError::Corrupt(
                "unrecognized image format".to_string(),
            ));
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.settings.max_dimension);
        limits.max_image_height = Some(self.settings.max_dimension);
        limits.max_alloc = Some(self.settings.max_alloc);
        reader.limits(limits);

        Ok(reader)
    }
}

fn body_too_large(length: u64, limit: u64) -> ValidationError {
    ValidationError::UnsafeImage(format!(
        "response body of {length} bytes exceeds the {limit} byte limit"
    ))
}

/// The JPEG decoder pads missing scan data instead of failing, so a cut-off
/// JPEG is caught by its missing end-of-image marker. Zero padding after the
/// marker is tolerated.
fn check_complete(format: ImageFormat, bytes: &[u8]) -> Result<(), ValidationError> {
    const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

    if format != ImageFormat::Jpeg {
        return Ok(());
    }
    let end = bytes
        .iter()
        .rposition(|byte| *byte != 0)
        .map_or(0, |last| last + 1);
    if bytes[..end].ends_with(&JPEG_EOI) {
        Ok(())
    } else {
        Err(ValidationError::Corrupt(
            "truncated JPEG data: missing end-of-image marker".to_string(),
        ))
    }
}

fn classify_decode_error(err: ImageError) -> ValidationError {
    match err {
        ImageError::Limits(limit) => ValidationError::UnsafeImage(limit.to_string()),
        other => ValidationError::Corrupt(other.to_string()),
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ValidationError> {
    std::fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ValidationError::NotFound(path.to_path_buf())
        } else {
            ValidationError::ReadError {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Decodes base64 text, stripping any URI prefix up to the first comma and
/// restoring missing `=` padding first. Commas never occur in base64.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, ValidationError> {
    let payload = payload.trim();
    let data = payload
        .split_once(',')
        .map_or(payload, |(_prefix, data)| data);

    let mut data: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let remainder = data.len() % 4;
    if remainder != 0 {
        data.extend(std::iter::repeat_n('=', 4 - remainder));
    }

    BASE64
        .decode(data.as_bytes())
        .map_err(|e| ValidationError::InvalidEncoding(e.to_string()))
}
