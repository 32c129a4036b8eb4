//! Parallel block upload to the artifact service.
//!
//! Content is split into blocks of at most 100 MiB, each with an independent
//! file handle seeked to its offset. Blocks upload concurrently with a cap
//! of ten in-flight transfers; the first non-success aborts the remainder
//! and the partial upload is abandoned for the server to collect. A final
//! block-list document commits the blob.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::{Error, Result};
use dyn_clone::{clone_trait_object, DynClone};
use futures::{stream, StreamExt};
use getset::{CopyGetters, Getters};
use log::{debug, trace};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Maximum size of one uploaded block.
pub const BLOCK_SIZE: u64 = 100 * 1024 * 1024;

/// Upper bound on concurrently in-flight block transfers.
pub const MAX_IN_FLIGHT: usize = 10;

/// Storage protocol version header value.
pub const STORAGE_API_VERSION: &str = "2016-05-31";

#[derive(Clone, Debug, CopyGetters, Getters)]
/// One planned block of the upload.
pub struct Block {
    #[get = "pub"]
    /// Base64 of a random 128-bit identifier.
    block_id: String,

    #[get_copy = "pub"]
    /// Byte offset of the block in the source file.
    offset: u64,

    #[get_copy = "pub"]
    /// Length of the block; only the final block may be short.
    length: u64,
}

/// Split `file_size` bytes into blocks of at most [`BLOCK_SIZE`].
pub fn plan_blocks(file_size: u64) -> Vec<Block> {
    plan_blocks_sized(file_size, BLOCK_SIZE)
}

fn plan_blocks_sized(file_size: u64, block_size: u64) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < file_size {
        let length = block_size.min(file_size - offset);
        blocks.push(Block {
            block_id: BASE64.encode(rand::random::<[u8; 16]>()),
            offset,
            length,
        });
        offset += length;
    }
    blocks
}

/// The block-list document committing an upload, ids in plan order.
pub fn block_list_xml(blocks: &[Block]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for block in blocks {
        xml.push_str("<Latest>");
        xml.push_str(block.block_id());
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

#[async_trait]
/// Transport for block PUTs; mockable for tests.
pub trait BlockTransport: DynClone + Send + Sync {
    /// PUT one block. Non-2xx statuses must surface as errors.
    async fn put_block(&self, blob_url: &str, block_id: &str, body: Vec<u8>) -> Result<()>;

    /// PUT the final block list.
    async fn put_block_list(&self, blob_url: &str, xml: String) -> Result<()>;
}

clone_trait_object!(BlockTransport);

#[derive(Clone, Debug, Default)]
/// The HTTP transport used in production.
pub struct HttpBlockTransport {
    client: reqwest::Client,
}

#[async_trait]
impl BlockTransport for HttpBlockTransport {
    async fn put_block(&self, blob_url: &str, block_id: &str, body: Vec<u8>) -> Result<()> {
        let url = format!(
            "{}&comp=block&blockid={}",
            blob_url,
            encode_block_id(block_id)
        );
        let response = self
            .client
            .put(&url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header(reqwest::header::CONTENT_LENGTH, body.len() as u64)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::io(format!("put block: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::io(format!(
                "block upload returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn put_block_list(&self, blob_url: &str, xml: String) -> Result<()> {
        let url = format!("{}&comp=blocklist", blob_url);
        let response = self
            .client
            .put(&url)
            .header("x-ms-version", STORAGE_API_VERSION)
            .body(xml)
            .send()
            .await
            .map_err(|e| Error::io(format!("put block list: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::io(format!(
                "block list commit returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Percent-encode the base64 characters that collide with URL syntax.
fn encode_block_id(block_id: &str) -> String {
    block_id
        .replace('+', "%2B")
        .replace('/', "%2F")
        .replace('=', "%3D")
}

/// Drives one upload and renders aggregate progress.
pub struct Uploader {
    transport: Box<dyn BlockTransport>,
    show_progress: bool,
}

impl Uploader {
    /// An uploader over the production HTTP transport.
    pub fn new() -> Self {
        Self {
            transport: Box::new(HttpBlockTransport::default()),
            show_progress: true,
        }
    }

    /// An uploader over a custom transport, silent by default.
    pub fn with_transport(transport: Box<dyn BlockTransport>) -> Self {
        Self {
            transport,
            show_progress: false,
        }
    }

    /// Upload `path` to `blob_url` and commit the block list. Returns the
    /// committed blocks in order.
    pub async fn upload_file(&self, blob_url: &str, path: &Path) -> Result<Vec<Block>> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::from_io(format!("stat {}", path.display()), e))?
            .len();
        let blocks = plan_blocks(size);
        self.upload_blocks(blob_url, path, &blocks, size).await?;
        Ok(blocks)
    }

    /// Upload a prepared block plan. Exposed separately so the plan (and
    /// therefore block sizing) stays testable.
    pub(crate) async fn upload_blocks(
        &self,
        blob_url: &str,
        path: &Path,
        blocks: &[Block],
        total: u64,
    ) -> Result<()> {
        debug!(
            "Uploading {} as {} blocks ({} bytes)",
            path.display(),
            blocks.len(),
            total
        );
        let uploaded = Arc::new(AtomicU64::new(0));

        let transfers = blocks.iter().cloned().map(|block| {
            let transport = self.transport.clone();
            let uploaded = Arc::clone(&uploaded);
            let blob_url = blob_url.to_string();
            let path = path.to_path_buf();
            async move {
                let body = read_block(&path, &block).await?;
                transport
                    .put_block(&blob_url, block.block_id(), body)
                    .await?;
                uploaded.fetch_add(block.length(), Ordering::SeqCst);
                Ok::<u64, Error>(uploaded.load(Ordering::SeqCst))
            }
        });

        // Dropping the stream on the first failure abandons the transfers
        // that are still in flight; the server collects stale blocks.
        let mut stream = stream::iter(transfers).buffer_unordered(MAX_IN_FLIGHT);
        while let Some(result) = stream.next().await {
            let done = result?;
            self.render_progress(done, total);
        }
        drop(stream);

        self.transport
            .put_block_list(blob_url, block_list_xml(blocks))
            .await
    }

    /// One aggregated percentage line on the TTY.
    fn render_progress(&self, uploaded: u64, total: u64) {
        if !self.show_progress || total == 0 {
            return;
        }
        let percent = uploaded * 100 / total;
        eprint!("\ruploading... {:>3}%", percent);
        if uploaded >= total {
            eprintln!();
        }
    }
}

impl Default for Uploader {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one block through an independent file handle seeked to its offset.
async fn read_block(path: &Path, block: &Block) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::from_io(format!("open {}", path.display()), e))?;
    file.seek(std::io::SeekFrom::Start(block.offset()))
        .await
        .map_err(|e| Error::from_io("seek block offset", e))?;

    let mut body = vec![0u8; block.length() as usize];
    file.read_exact(&mut body)
        .await
        .map_err(|e| Error::from_io("read block", e))?;
    trace!(
        "Read block at offset {} ({} bytes)",
        block.offset(),
        block.length()
    );
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn plan_for_250_mib() {
        let blocks = plan_blocks(250 * MIB);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].length(), 100 * MIB);
        assert_eq!(blocks[1].length(), 100 * MIB);
        assert_eq!(blocks[2].length(), 50 * MIB);
        assert_eq!(blocks[1].offset(), 100 * MIB);

        let ids = blocks
            .iter()
            .map(|b| b.block_id().clone())
            .collect::<HashSet<_>>();
        assert_eq!(ids.len(), 3, "block ids must be distinct");
    }

    #[test]
    fn plan_lengths_sum_to_file_size() {
        for size in [0, 1, BLOCK_SIZE - 1, BLOCK_SIZE, BLOCK_SIZE + 1, 7 * MIB + 13] {
            let blocks = plan_blocks(size);
            assert_eq!(blocks.iter().map(Block::length).sum::<u64>(), size);
            assert!(blocks.iter().all(|b| b.length() <= BLOCK_SIZE));
        }
        assert!(plan_blocks(0).is_empty());
    }

    #[test]
    fn block_list_preserves_order() {
        let blocks = plan_blocks_sized(3, 1);
        let xml = block_list_xml(&blocks);

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>"));
        assert!(xml.ends_with("</BlockList>"));

        let mut position = 0;
        for block in &blocks {
            let entry = format!("<Latest>{}</Latest>", block.block_id());
            let found = xml[position..].find(&entry).expect("entry present");
            position += found + entry.len();
        }
    }

    #[test]
    fn block_id_url_encoding() {
        assert_eq!(encode_block_id("ab+/c="), "ab%2B%2Fc%3D");
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        blocks: Arc<AtomicUsize>,
        lists: Arc<AtomicUsize>,
        fail_at: Option<u64>,
    }

    #[async_trait]
    impl BlockTransport for MockTransport {
        async fn put_block(&self, _blob_url: &str, _block_id: &str, body: Vec<u8>) -> common::Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(marker) = self.fail_at {
                if body.first() == Some(&(marker as u8)) {
                    return Err(Error::io("injected block failure"));
                }
            }
            self.blocks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn put_block_list(&self, _blob_url: &str, _xml: String) -> common::Result<()> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn file_with_marked_blocks(dir: &Path, block_count: usize) -> Result<std::path::PathBuf> {
        // One byte per "block"; the byte value marks the block index.
        let path = dir.join("payload.bin");
        std::fs::write(&path, (0..block_count as u8).collect::<Vec<_>>())?;
        Ok(path)
    }

    #[tokio::test]
    async fn concurrency_is_capped_and_list_committed() -> Result<()> {
        let dir = TempDir::new()?;
        let path = file_with_marked_blocks(dir.path(), 40)?;
        let blocks = plan_blocks_sized(40, 1);

        let mock = MockTransport::default();
        let uploader = Uploader::with_transport(Box::new(mock.clone()));
        uploader.upload_blocks("http://blob?sas", &path, &blocks, 40).await?;

        assert_eq!(mock.blocks.load(Ordering::SeqCst), 40);
        assert_eq!(mock.lists.load(Ordering::SeqCst), 1);
        let peak = mock.peak.load(Ordering::SeqCst);
        assert!(peak <= MAX_IN_FLIGHT, "peak {} exceeds cap", peak);
        assert!(peak > 1, "uploads should actually overlap");
        Ok(())
    }

    #[tokio::test]
    async fn failed_block_aborts_without_commit() -> Result<()> {
        let dir = TempDir::new()?;
        let path = file_with_marked_blocks(dir.path(), 30)?;
        let blocks = plan_blocks_sized(30, 1);

        let mock = MockTransport {
            fail_at: Some(7),
            ..MockTransport::default()
        };
        let uploader = Uploader::with_transport(Box::new(mock.clone()));
        let err = uploader
            .upload_blocks("http://blob?sas", &path, &blocks, 30)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), common::ErrorKind::Io);
        assert_eq!(mock.lists.load(Ordering::SeqCst), 0, "no commit after failure");
        assert!(mock.blocks.load(Ordering::SeqCst) < 30);
        Ok(())
    }

    #[tokio::test]
    async fn upload_file_plans_from_size() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("small.bin");
        std::fs::write(&path, vec![0u8; 4096])?;

        let mock = MockTransport::default();
        let uploader = Uploader::with_transport(Box::new(mock.clone()));
        let blocks = uploader.upload_file("http://blob?sas", &path).await?;

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].length(), 4096);
        assert_eq!(mock.blocks.load(Ordering::SeqCst), 1);
        assert_eq!(mock.lists.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
