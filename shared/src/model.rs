use base64::Engine as _;
use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::capabilities::kv::BACKUP_INFIX;
use crate::preview::PreviewUrl;
use crate::{
    AppError, ErrorKind, UnixTimeMs, PLACEHOLDER_HOST_IMAGE_URL, PLACEHOLDER_HOST_NAME,
    PLACEHOLDER_IMAGE_URL,
};

const BLOB_PREFIX: &str = "blob:";
const DATA_IMAGE_PREFIX: &str = "data:image/";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DraftError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("title cannot be empty")]
    EmptyTitle,

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("invalid listing id: {0}")]
    InvalidId(String),

    #[error("malformed data URL: {0}")]
    InvalidDataUrl(String),
}

impl From<DraftError> for AppError {
    fn from(e: DraftError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

/// Client-generated listing identifier, immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct ListingId(String);

impl TryFrom<String> for ListingId {
    type Error = DraftError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl ListingId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, DraftError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(DraftError::InvalidId("id cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(DraftError::InvalidId(format!(
                "id exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DraftError::InvalidId(
                "id contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        if id.contains(BACKUP_INFIX) {
            return Err(DraftError::InvalidId(format!(
                "id cannot contain the reserved sequence '{BACKUP_INFIX}'"
            )));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub image: String,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            name: PLACEHOLDER_HOST_NAME.to_string(),
            image: PLACEHOLDER_HOST_IMAGE_URL.to_string(),
        }
    }
}

/// A persisted rentable property. `image` and `images` only ever hold
/// durable URLs once a listing has gone through [`Listing::normalize`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub neighborhood: String,
    #[serde(default)]
    pub map_location: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub dates: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub host: Host,
}

impl Listing {
    /// Builds a fresh listing from a validated draft whose images have
    /// already been made durable.
    #[must_use]
    pub fn from_draft(
        id: ListingId,
        draft: &ListingDraft,
        image: Option<String>,
        images: Vec<String>,
        now: UnixTimeMs,
    ) -> Self {
        let mut listing = Self {
            id,
            title: draft.title.clone(),
            description: draft.description.clone(),
            location: draft.location.clone(),
            neighborhood: draft.neighborhood.clone(),
            map_location: draft.map_location.clone(),
            price: draft.price,
            rating: 0.0,
            dates: draft
                .dates
                .clone()
                .unwrap_or_else(|| now.to_display_date()),
            image: image.unwrap_or_default(),
            images,
            host: draft.host.clone(),
        };
        listing.normalize();
        listing
    }

    /// Enforces the persistence invariants: no transient references survive,
    /// `images` never contains blanks, and `image` falls back to `images[0]`
    /// (or the placeholder when there are no images at all).
    pub fn normalize(&mut self) {
        self.images
            .retain(|url| !url.trim().is_empty() && !is_transient_reference(url));

        if self.image.trim().is_empty() || is_transient_reference(&self.image) {
            self.image = self
                .images
                .first()
                .cloned()
                .unwrap_or_else(|| PLACEHOLDER_IMAGE_URL.to_string());
        }

        if !self.price.is_finite() || self.price < 0.0 {
            self.price = 0.0;
        }
    }

    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }
}

#[must_use]
pub fn is_transient_reference(url: &str) -> bool {
    url.starts_with(BLOB_PREFIX)
}

/// Image bytes that are not yet durable.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingImage {
    /// A preview handed out by the image processor.
    Preview(PreviewUrl),
    /// Bytes carried inline, e.g. a pasted `data:` URL.
    Inline { mime: String, bytes: Bytes },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum ImageRef {
    Ready(String),
    Pending(PendingImage),
    #[default]
    None,
}

impl ImageRef {
    /// Classifies a raw image string coming from the UI. This is the only
    /// place string prefixes are inspected; everything downstream matches on
    /// the variant.
    pub fn parse(raw: &str) -> Result<Self, DraftError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::None);
        }
        if raw.starts_with(BLOB_PREFIX) {
            return Ok(Self::Pending(PendingImage::Preview(PreviewUrl::from_raw(raw))));
        }
        if raw.starts_with(DATA_IMAGE_PREFIX) {
            return parse_data_url(raw).map(Self::Pending);
        }
        Ok(Self::Ready(raw.to_string()))
    }

    /// Like [`ImageRef::parse`], but an unreadable image is dropped with a
    /// warning instead of failing the whole form.
    #[must_use]
    pub fn parse_or_drop(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|e| {
            counter!("listing.image.malformed").increment(1);
            warn!(error = %e, "dropping unreadable image");
            Self::None
        })
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    #[must_use]
    pub fn preview(&self) -> Option<&PreviewUrl> {
        match self {
            Self::Pending(PendingImage::Preview(url)) => Some(url),
            _ => None,
        }
    }
}

fn parse_data_url(raw: &str) -> Result<PendingImage, DraftError> {
    let rest = &raw["data:".len()..];
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| DraftError::InvalidDataUrl("missing ',' separator".into()))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| DraftError::InvalidDataUrl("only base64 payloads are supported".into()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| DraftError::InvalidDataUrl(e.to_string()))?;
    if bytes.is_empty() {
        return Err(DraftError::InvalidDataUrl("empty payload".into()));
    }
    Ok(PendingImage::Inline {
        mime: mime.to_string(),
        bytes: Bytes::from(bytes),
    })
}

/// Loosely-typed payload as submitted by a listing form.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingForm {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub neighborhood: Option<String>,
    pub map_location: Option<String>,
    pub price: Option<serde_json::Value>,
    pub dates: Option<String>,
    pub image: Option<String>,
    pub images: Option<Vec<String>>,
    pub host: Option<Host>,
}

/// Validated input for creating a listing.
#[derive(Clone, Debug, PartialEq)]
pub struct ListingDraft {
    pub title: String,
    pub description: String,
    pub location: String,
    pub neighborhood: String,
    pub map_location: String,
    pub price: f64,
    pub dates: Option<String>,
    pub image: ImageRef,
    pub images: Vec<ImageRef>,
    pub host: Host,
}

impl ListingDraft {
    pub fn previews(&self) -> impl Iterator<Item = &PreviewUrl> {
        std::iter::once(&self.image)
            .chain(self.images.iter())
            .filter_map(ImageRef::preview)
    }
}

impl TryFrom<ListingForm> for ListingDraft {
    type Error = DraftError;

    fn try_from(form: ListingForm) -> Result<Self, Self::Error> {
        let title = parse_title(form.title.as_deref())?.ok_or(DraftError::MissingField("title"))?;
        let price = form
            .price
            .as_ref()
            .map(parse_price)
            .transpose()?
            .ok_or(DraftError::MissingField("price"))?;

        Ok(Self {
            title,
            description: trimmed(form.description),
            location: trimmed(form.location),
            neighborhood: trimmed(form.neighborhood),
            map_location: trimmed(form.map_location),
            price,
            dates: form.dates.filter(|d| !d.trim().is_empty()),
            image: form
                .image
                .as_deref()
                .map(ImageRef::parse_or_drop)
                .unwrap_or_default(),
            images: parse_images(form.images.unwrap_or_default()),
            host: form.host.unwrap_or_default(),
        })
    }
}

/// Validated partial update; `None` leaves the stored value untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListingPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub neighborhood: Option<String>,
    pub map_location: Option<String>,
    pub price: Option<f64>,
    pub dates: Option<String>,
    pub image: Option<ImageRef>,
    pub images: Option<Vec<ImageRef>>,
    pub host: Option<Host>,
}

impl ListingPatch {
    pub fn previews(&self) -> impl Iterator<Item = &PreviewUrl> {
        self.image
            .iter()
            .chain(self.images.iter().flatten())
            .filter_map(ImageRef::preview)
    }

    #[must_use]
    pub fn touches_images(&self) -> bool {
        self.image.is_some() || self.images.is_some()
    }

    /// Applies the scalar fields and the already-resolved image fields to
    /// `base`. `image`/`images` are `None` when the patch did not carry them.
    #[must_use]
    pub fn apply(
        &self,
        base: &Listing,
        image: Option<String>,
        images: Option<Vec<String>>,
    ) -> Listing {
        let mut next = base.clone();
        if let Some(title) = &self.title {
            next.title.clone_from(title);
        }
        if let Some(description) = &self.description {
            next.description.clone_from(description);
        }
        if let Some(location) = &self.location {
            next.location.clone_from(location);
        }
        if let Some(neighborhood) = &self.neighborhood {
            next.neighborhood.clone_from(neighborhood);
        }
        if let Some(map_location) = &self.map_location {
            next.map_location.clone_from(map_location);
        }
        if let Some(price) = self.price {
            next.price = price;
        }
        if let Some(dates) = &self.dates {
            next.dates.clone_from(dates);
        }
        if let Some(host) = &self.host {
            next.host = host.clone();
        }

        match (image, images) {
            (explicit, Some(images)) => {
                next.images = images;
                next.image = explicit.unwrap_or_default();
            }
            (Some(explicit), None) => next.image = explicit,
            (None, None) => {}
        }

        next.normalize();
        next
    }
}

impl TryFrom<ListingForm> for ListingPatch {
    type Error = DraftError;

    fn try_from(form: ListingForm) -> Result<Self, Self::Error> {
        let title = match form.title.as_deref() {
            Some(raw) => Some(parse_title(Some(raw))?.ok_or(DraftError::EmptyTitle)?),
            None => None,
        };

        Ok(Self {
            title,
            description: form.description.map(|s| s.trim().to_string()),
            location: form.location.map(|s| s.trim().to_string()),
            neighborhood: form.neighborhood.map(|s| s.trim().to_string()),
            map_location: form.map_location.map(|s| s.trim().to_string()),
            price: form.price.as_ref().map(parse_price).transpose()?,
            dates: form.dates.filter(|d| !d.trim().is_empty()),
            image: form.image.as_deref().map(ImageRef::parse_or_drop),
            images: form.images.map(parse_images),
            host: form.host,
        })
    }
}

fn trimmed(value: Option<String>) -> String {
    value.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn parse_title(raw: Option<&str>) -> Result<Option<String>, DraftError> {
    match raw.map(str::trim) {
        None => Ok(None),
        Some("") => Err(DraftError::EmptyTitle),
        Some(title) => Ok(Some(title.to_string())),
    }
}

fn parse_price(value: &serde_json::Value) -> Result<f64, DraftError> {
    let price = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| DraftError::InvalidPrice(value.to_string()))?;

    if !price.is_finite() || price < 0.0 {
        return Err(DraftError::InvalidPrice(value.to_string()));
    }
    Ok(price)
}

fn parse_images(raw: Vec<String>) -> Vec<ImageRef> {
    raw.iter()
        .map(|s| ImageRef::parse_or_drop(s))
        .filter(|r| *r != ImageRef::None)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn listing(image: &str, images: &[&str]) -> Listing {
        Listing {
            id: ListingId::new("l1").unwrap(),
            title: "Loft".into(),
            description: String::new(),
            location: String::new(),
            neighborhood: String::new(),
            map_location: String::new(),
            price: 10.0,
            rating: 0.0,
            dates: "2024-01-01".into(),
            image: image.into(),
            images: images.iter().map(|s| (*s).to_string()).collect(),
            host: Host::default(),
        }
    }

    #[test]
    fn listing_id_validation() {
        assert!(ListingId::new("abc-123_x").is_ok());
        assert!(ListingId::new("").is_err());
        assert!(ListingId::new("has space").is_err());
        assert!(ListingId::new("a".repeat(129)).is_err());
        assert_eq!(ListingId::new("  trimmed ").unwrap().as_str(), "trimmed");
    }

    #[test]
    fn listing_id_rejects_backup_key_infix() {
        assert!(matches!(
            ListingId::new("a_backup_5"),
            Err(DraftError::InvalidId(_))
        ));
        assert!(ListingId::new("backup").is_ok());
        assert!(ListingId::new("a_backup").is_ok());
        assert!(serde_json::from_str::<ListingId>("\"a_backup_5\"").is_err());
        assert_eq!(
            serde_json::to_string(&ListingId::new("a_backup").unwrap()).unwrap(),
            "\"a_backup\""
        );
    }

    #[test]
    fn normalize_falls_back_to_first_image() {
        let l = listing("", &["https://cdn/a.jpg", "https://cdn/b.jpg"]).normalized();
        assert_eq!(l.image, "https://cdn/a.jpg");
    }

    #[test]
    fn normalize_replaces_transient_primary() {
        let l = listing("blob:abc", &["blob:def", "https://cdn/a.jpg"]).normalized();
        assert_eq!(l.images, vec!["https://cdn/a.jpg".to_string()]);
        assert_eq!(l.image, "https://cdn/a.jpg");
    }

    #[test]
    fn normalize_uses_placeholder_without_images() {
        let l = listing("", &[]).normalized();
        assert_eq!(l.image, PLACEHOLDER_IMAGE_URL);
        assert!(l.images.is_empty());
    }

    #[test]
    fn missing_images_field_deserializes_as_empty() {
        let l: Listing = serde_json::from_value(json!({
            "id": "x1",
            "title": "Cabin",
            "price": 42.0,
            "mapLocation": "here"
        }))
        .unwrap();
        assert!(l.images.is_empty());
        assert_eq!(l.map_location, "here");
        assert_eq!(l.host, Host::default());
    }

    #[test]
    fn image_ref_classification() {
        assert_eq!(ImageRef::parse("  ").unwrap(), ImageRef::None);
        assert_eq!(
            ImageRef::parse("https://cdn/x.png").unwrap(),
            ImageRef::Ready("https://cdn/x.png".into())
        );
        assert!(ImageRef::parse("blob:http://app/123").unwrap().preview().is_some());

        let inline = ImageRef::parse("data:image/png;base64,AQID").unwrap();
        match inline {
            ImageRef::Pending(PendingImage::Inline { mime, bytes }) => {
                assert_eq!(mime, "image/png");
                assert_eq!(bytes.as_ref(), &[1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_data_url_is_rejected() {
        assert!(ImageRef::parse("data:image/png;base64").is_err());
        assert!(ImageRef::parse("data:image/png,plain").is_err());
        assert!(ImageRef::parse("data:image/png;base64,***").is_err());
    }

    #[test]
    fn malformed_data_url_is_dropped_from_the_form() {
        let form = ListingForm {
            title: Some("Flat".into()),
            price: Some(json!(80)),
            image: Some("data:image/png;base64,***".into()),
            images: Some(vec![
                "data:image/png,plain".into(),
                "https://cdn/a.jpg".into(),
                "data:image/png;base64,AQID".into(),
            ]),
            ..Default::default()
        };

        let draft = ListingDraft::try_from(form.clone()).unwrap();
        assert_eq!(draft.image, ImageRef::None);
        assert_eq!(draft.images.len(), 2);
        assert_eq!(draft.images[0], ImageRef::Ready("https://cdn/a.jpg".into()));
        assert!(draft.images[1].is_pending());

        let patch = ListingPatch::try_from(form).unwrap();
        assert_eq!(patch.image, Some(ImageRef::None));
        assert_eq!(patch.images.map(|i| i.len()), Some(2));
    }

    #[test]
    fn draft_requires_title_and_price() {
        let form = ListingForm {
            price: Some(json!(10)),
            ..Default::default()
        };
        assert_eq!(
            ListingDraft::try_from(form).unwrap_err(),
            DraftError::MissingField("title")
        );

        let form = ListingForm {
            title: Some("Flat".into()),
            ..Default::default()
        };
        assert_eq!(
            ListingDraft::try_from(form).unwrap_err(),
            DraftError::MissingField("price")
        );
    }

    #[test]
    fn draft_accepts_string_price_and_rejects_negative() {
        let mut form = ListingForm {
            title: Some("  Flat ".into()),
            price: Some(json!(" 120.5 ")),
            images: Some(vec!["".into(), "https://cdn/a.jpg".into()]),
            ..Default::default()
        };
        let draft = ListingDraft::try_from(form.clone()).unwrap();
        assert_eq!(draft.title, "Flat");
        assert!((draft.price - 120.5).abs() < f64::EPSILON);
        assert_eq!(draft.images, vec![ImageRef::Ready("https://cdn/a.jpg".into())]);

        form.price = Some(json!(-1));
        assert!(matches!(
            ListingDraft::try_from(form).unwrap_err(),
            DraftError::InvalidPrice(_)
        ));
    }

    #[test]
    fn patch_without_images_keeps_stored_images() {
        let base = listing("https://cdn/a.jpg", &["https://cdn/a.jpg", "https://cdn/b.jpg"]);
        let patch = ListingPatch::try_from(ListingForm {
            title: Some("Renamed".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(!patch.touches_images());

        let next = patch.apply(&base, None, None);
        assert_eq!(next.title, "Renamed");
        assert_eq!(next.images, base.images);
        assert_eq!(next.image, base.image);
    }

    #[test]
    fn patch_with_images_resets_primary_to_first() {
        let base = listing("https://cdn/a.jpg", &["https://cdn/a.jpg"]);
        let patch = ListingPatch {
            images: Some(vec![]),
            ..Default::default()
        };
        let next = patch.apply(&base, None, Some(vec!["https://cdn/z.jpg".into()]));
        assert_eq!(next.image, "https://cdn/z.jpg");
    }

    #[test]
    fn patch_rejects_blank_title() {
        let form = ListingForm {
            title: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(ListingPatch::try_from(form).unwrap_err(), DraftError::EmptyTitle);
    }

    fn image_string() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            "blob:[a-z]{1,4}",
            "https://cdn/[a-z]{1,8}\\.jpg",
        ]
    }

    proptest! {
        #[test]
        fn normalize_upholds_invariants(
            image in image_string(),
            images in proptest::collection::vec(image_string(), 0..6),
        ) {
            let refs: Vec<&str> = images.iter().map(String::as_str).collect();
            let l = listing(&image, &refs).normalized();

            prop_assert!(!is_transient_reference(&l.image));
            prop_assert!(l.images.iter().all(|u| !u.is_empty() && !is_transient_reference(u)));
            if image.starts_with("https://") {
                prop_assert_eq!(&l.image, &image);
            } else if let Some(first) = l.images.first() {
                prop_assert_eq!(&l.image, first);
            } else {
                prop_assert_eq!(l.image.as_str(), PLACEHOLDER_IMAGE_URL);
            }
        }

        #[test]
        fn normalize_is_idempotent(
            images in proptest::collection::vec(image_string(), 0..6),
        ) {
            let refs: Vec<&str> = images.iter().map(String::as_str).collect();
            let once = listing("", &refs).normalized();
            let twice = once.clone().normalized();
            prop_assert_eq!(once, twice);
        }
    }
}
