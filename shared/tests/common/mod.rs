#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use listing_core::capabilities::kv::{KeyValueStore, MemoryKv};
use listing_core::capabilities::notify::QueuedNotifier;
use listing_core::capabilities::remote::{
    ImageUploader, InMemoryTable, InMemoryUploader, ListingRow, RemoteError, RemoteTable,
};
use listing_core::image_processing::ImageFile;
use listing_core::{ListingForm, MutationPipeline, PipelineConfig};
use serde_json::json;

/// Wraps the in-memory table so a test can take the remote tier down.
#[derive(Default)]
pub struct FailableTable {
    pub inner: InMemoryTable,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub writes: AtomicUsize,
}

impl FailableTable {
    fn check(&self, flag: &AtomicBool) -> Result<(), RemoteError> {
        if flag.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteTable for FailableTable {
    async fn select_all(&self) -> Result<Vec<ListingRow>, RemoteError> {
        self.check(&self.fail_reads)?;
        self.inner.select_all().await
    }

    async fn select_by_id(&self, id: &str) -> Result<Option<ListingRow>, RemoteError> {
        self.check(&self.fail_reads)?;
        self.inner.select_by_id(id).await
    }

    async fn insert(&self, row: ListingRow) -> Result<ListingRow, RemoteError> {
        self.check(&self.fail_writes)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(row).await
    }

    async fn update(&self, id: &str, row: ListingRow) -> Result<ListingRow, RemoteError> {
        self.check(&self.fail_writes)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update(id, row).await
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.check(&self.fail_writes)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(id).await
    }
}

/// Object store that can be switched to reject every upload.
#[derive(Default)]
pub struct FailableUploader {
    pub inner: InMemoryUploader,
    pub fail: AtomicBool,
}

#[async_trait]
impl ImageUploader for FailableUploader {
    async fn upload(&self, path: &str, mime: &str, bytes: Bytes) -> Result<String, RemoteError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RemoteError::Upload {
                path: path.to_string(),
                reason: "bucket unavailable".into(),
            });
        }
        self.inner.upload(path, mime, bytes).await
    }
}

pub struct RemoteHarness {
    pub pipeline: MutationPipeline,
    pub table: Arc<FailableTable>,
    pub uploader: Arc<FailableUploader>,
    pub notifier: Arc<QueuedNotifier>,
    pub kv: Arc<MemoryKv>,
}

pub fn remote_harness() -> RemoteHarness {
    let kv = Arc::new(MemoryKv::new());
    let table = Arc::new(FailableTable::default());
    let uploader = Arc::new(FailableUploader::default());
    let notifier = Arc::new(QueuedNotifier::new());
    let pipeline = MutationPipeline::remote(
        kv.clone(),
        table.clone(),
        uploader.clone(),
        notifier.clone(),
        &PipelineConfig::default(),
    );
    RemoteHarness {
        pipeline,
        table,
        uploader,
        notifier,
        kv,
    }
}

pub fn local_pipeline(kv: Arc<dyn KeyValueStore>) -> (MutationPipeline, Arc<QueuedNotifier>) {
    let notifier = Arc::new(QueuedNotifier::new());
    let pipeline = MutationPipeline::local(kv, notifier.clone(), &PipelineConfig::default());
    (pipeline, notifier)
}

pub fn form(title: &str) -> ListingForm {
    ListingForm {
        title: Some(title.into()),
        price: Some(json!(95)),
        location: Some("Porto".into()),
        ..Default::default()
    }
}

pub fn form_with_images(title: &str, images: Vec<String>) -> ListingForm {
    ListingForm {
        images: Some(images),
        ..form(title)
    }
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode test png");
    out.into_inner()
}

pub fn png_file(name: &str) -> ImageFile {
    ImageFile::new(name, "image/png", png(32, 24))
}

pub fn corrupt_png(name: &str) -> ImageFile {
    ImageFile::new(name, "image/png", vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3])
}
