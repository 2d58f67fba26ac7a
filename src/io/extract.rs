//! Streaming package extraction.
//!
//! The extractor pulls a package archive from a local file or an
//! `http(s)` URL, unpacks it into a destination directory and maintains
//! an incremental digest over the same bytes it writes out. The final
//! digest is checked against the digest embedded in the package footer.
//!
//! Extraction can be canceled from any thread through a
//! [`CancelHandle`]; the in-flight [`extract`](PackageExtractor::extract)
//! call then returns [`Error::Canceled`] as soon as the current chunk
//! has been written. No partial files are promised to remain.

use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf};
use tokio_util::io::StreamReader;

use crate::core::ids::is_valid_package_id;
use crate::core::report::InstallationReport;
use crate::error::{Error, Result};
use crate::io::format::{
    DigestAccumulator, PackageFooter, PackageHeader, FOOTER_ENTRY, FOOTER_FORMAT_TYPE,
    FORMAT_VERSION, HEADER_ENTRY, HEADER_FORMAT_TYPE,
};

const COPY_CHUNK: usize = 64 * 1024;
const MAX_DOCUMENT_ENTRY_SIZE: u64 = 1024 * 1024;

/// Where a package archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    File(PathBuf),
    Url(String),
}

impl PackageSource {
    /// Parses a source URL; anything without an `http(s)` scheme is
    /// treated as a local path (`file://` prefixes are stripped).
    pub fn parse(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            Self::Url(source.to_string())
        } else if let Some(path) = source.strip_prefix("file://") {
            Self::File(PathBuf::from(path))
        } else {
            Self::File(PathBuf::from(source))
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Url(url) => url.clone(),
        }
    }
}

impl From<&Path> for PackageSource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

/// Thread-safe cancellation flag for one extraction.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counts raw source bytes as they are consumed, for progress.
struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = (buf.filled().len() - before) as u64;
            this.consumed.fetch_add(read, Ordering::Relaxed);
        }
        poll
    }
}

/// Streams one package archive into a destination directory.
pub struct PackageExtractor {
    source: PackageSource,
    destination: PathBuf,
    cancel: Arc<AtomicBool>,
    progress: Option<Box<dyn FnMut(f32) + Send + Sync>>,
}

impl PackageExtractor {
    pub fn new(source: PackageSource, destination_dir: &Path) -> Self {
        Self {
            source,
            destination: destination_dir.to_path_buf(),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Handle for canceling this extraction from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Makes this extraction observe an externally owned cancel flag.
    pub fn use_cancel_handle(&mut self, handle: &CancelHandle) {
        self.cancel = handle.0.clone();
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Progress callback, invoked with values in `[0, 1]` per chunk.
    pub fn set_progress_callback(&mut self, callback: impl FnMut(f32) + Send + Sync + 'static) {
        self.progress = Some(Box::new(callback));
    }

    /// Runs the extraction.
    ///
    /// `on_file` is invoked once per fully written content file, after
    /// the file has been closed, with its index, relative path and
    /// absolute path. An error returned from the callback aborts the
    /// extraction.
    ///
    /// On success the returned report carries the package identity from
    /// the archive header, the verified digest, the signatures from the
    /// footer and the list of extracted files.
    pub async fn extract<F>(&mut self, mut on_file: F) -> Result<InstallationReport>
    where
        F: FnMut(usize, &str, &Path) -> Result<()>,
    {
        tokio::fs::create_dir_all(&self.destination)
            .await
            .map_err(|e| {
                Error::io_context(format!("cannot create {}", self.destination.display()), e)
            })?;

        let consumed = Arc::new(AtomicU64::new(0));
        let (raw, total_size) = self.open_source().await?;
        let counting = CountingReader {
            inner: raw,
            consumed: consumed.clone(),
        };

        // compressed packages are detected by their magic, not by name
        let mut buffered = BufReader::new(counting);
        let head = buffered.fill_buf().await?;
        let is_gzip = head.starts_with(&[0x1f, 0x8b]);
        let reader: Box<dyn AsyncRead + Send + Unpin> = if is_gzip {
            Box::new(async_compression::tokio::bufread::GzipDecoder::new(
                buffered,
            ))
        } else {
            Box::new(buffered)
        };

        let mut archive = tokio_tar::Archive::new(reader);
        let mut entries = archive
            .entries()
            .map_err(|e| malformed(format!("cannot read archive: {e}")))?;

        let mut report: Option<InstallationReport> = None;
        let mut digest = DigestAccumulator::new();
        let mut footer: Option<PackageFooter> = None;
        let mut file_index = 0usize;

        while let Some(entry) = entries.next().await {
            self.check_canceled()?;
            let mut entry = entry.map_err(|e| malformed(format!("corrupt archive entry: {e}")))?;

            let path = entry
                .path()
                .map_err(|e| malformed(format!("entry has an invalid path: {e}")))?;
            let name = path
                .to_str()
                .ok_or_else(|| malformed("entry path is not valid UTF-8".into()))?
                .to_string();

            if footer.is_some() {
                return Err(malformed(format!(
                    "entry '{name}' found after the package footer"
                )));
            }

            if name == HEADER_ENTRY {
                if report.is_some() {
                    return Err(malformed("duplicate package header".into()));
                }
                let header: PackageHeader =
                    parse_document_entry(&mut entry, HEADER_ENTRY).await?;
                report = Some(header_to_report(header)?);
                continue;
            }

            let Some(report) = report.as_mut() else {
                return Err(malformed(format!(
                    "the package must start with '{HEADER_ENTRY}', got '{name}'"
                )));
            };

            if name == FOOTER_ENTRY {
                footer = Some(parse_document_entry(&mut entry, FOOTER_ENTRY).await?);
                continue;
            }

            let header = entry.header();
            match header.entry_type() {
                tokio_tar::EntryType::Directory => {
                    let dir = self.resolve_entry_path(&name)?;
                    tokio::fs::create_dir_all(&dir)
                        .await
                        .map_err(|e| Error::io_context(format!("cannot create {}", dir.display()), e))?;
                    continue;
                }
                tokio_tar::EntryType::Regular => {}
                other => {
                    return Err(malformed(format!(
                        "entry '{name}' has unsupported type {other:?}"
                    )));
                }
            }

            let size = header
                .size()
                .map_err(|e| malformed(format!("entry '{name}': {e}")))?;
            let mode = header.mode().unwrap_or(0o644) & 0o777;
            let executable = mode & 0o100 != 0;
            let target = self.resolve_entry_path(&name)?;

            digest.begin_entry(&name, size, executable);
            self.write_entry(&mut entry, &target, mode, &mut digest, &consumed, total_size)
                .await?;

            report.files.push(name.clone());
            on_file(file_index, &name, &target)?;
            file_index += 1;
        }

        let mut report =
            report.ok_or_else(|| malformed(format!("missing '{HEADER_ENTRY}'")))?;
        let footer = footer.ok_or_else(|| malformed(format!("missing '{FOOTER_ENTRY}'")))?;

        if report.files.is_empty() {
            return Err(malformed("the package contains no files".into()));
        }

        let expected = hex::decode(&footer.digest)
            .map_err(|_| malformed("footer digest is not hex".into()))?;
        if expected.is_empty() {
            return Err(malformed("footer digest is empty".into()));
        }

        let computed = digest.finalize(&report.extra_signed_metadata)?;
        if computed != expected {
            return Err(Error::DigestMismatch {
                expected: footer.digest.clone(),
                actual: hex::encode(&computed),
            });
        }
        report.digest = computed;

        let b64 = base64::engine::general_purpose::STANDARD;
        if let Some(sig) = &footer.developer_signature {
            report.developer_signature = Some(
                b64.decode(sig)
                    .map_err(|_| malformed("developer signature is not base64".into()))?,
            );
        }
        if let Some(sig) = &footer.store_signature {
            report.store_signature = Some(
                b64.decode(sig)
                    .map_err(|_| malformed("store signature is not base64".into()))?,
            );
        }

        self.emit_progress(1.0);
        Ok(report)
    }

    async fn open_source(&self) -> Result<(Box<dyn AsyncRead + Send + Unpin>, Option<u64>)> {
        match &self.source {
            PackageSource::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    Error::io_context(format!("cannot open package {}", path.display()), e)
                })?;
                let size = file.metadata().await.ok().map(|m| m.len());
                Ok((Box::new(file), size))
            }
            PackageSource::Url(url) => {
                let response = reqwest::get(url)
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(|e| Error::Package(format!("cannot download {url}: {e}")))?;
                let size = response.content_length();
                let stream = response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(std::io::Error::other));
                Ok((Box::new(StreamReader::new(Box::pin(stream))), size))
            }
        }
    }

    /// Maps an archive entry name below the destination directory,
    /// rejecting anything that would escape it.
    fn resolve_entry_path(&self, name: &str) -> Result<PathBuf> {
        let path = Path::new(name);
        let clean = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if name.is_empty() || !clean {
            return Err(malformed(format!(
                "entry path '{name}' escapes the destination directory"
            )));
        }
        Ok(self.destination.join(path))
    }

    async fn write_entry<R: AsyncRead + Unpin>(
        &mut self,
        entry: &mut R,
        target: &Path,
        mode: u32,
        digest: &mut DigestAccumulator,
        consumed: &Arc<AtomicU64>,
        total_size: Option<u64>,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::io_context(format!("cannot create {}", parent.display()), e)
            })?;
        }

        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| Error::io_context(format!("cannot create {}", target.display()), e))?;

        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            self.check_canceled()?;
            let n = entry
                .read(&mut buf)
                .await
                .map_err(|e| malformed(format!("corrupt archive entry: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .map_err(|e| Error::io_context(format!("cannot write {}", target.display()), e))?;
            digest.update(&buf[..n]);

            if let Some(total) = total_size {
                if total > 0 {
                    let value = consumed.load(Ordering::Relaxed) as f32 / total as f32;
                    self.emit_progress(value.clamp(0.0, 1.0));
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| Error::io_context(format!("cannot write {}", target.display()), e))?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| {
                    Error::io_context(format!("cannot set mode of {}", target.display()), e)
                })?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(())
    }

    fn check_canceled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    fn emit_progress(&mut self, value: f32) {
        if let Some(progress) = &mut self.progress {
            progress(value);
        }
    }
}

impl std::fmt::Debug for PackageExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageExtractor")
            .field("source", &self.source.describe())
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

fn malformed(why: String) -> Error {
    Error::Package(format!("malformed package: {why}"))
}

async fn parse_document_entry<T, R>(entry: &mut R, what: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Validated,
    R: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    entry
        .take(MAX_DOCUMENT_ENTRY_SIZE)
        .read_to_end(&mut data)
        .await
        .map_err(|e| malformed(format!("cannot read '{what}': {e}")))?;
    let value: T = serde_norway::from_slice(&data)
        .map_err(|e| malformed(format!("cannot parse '{what}': {e}")))?;
    value.validate().map_err(|why| malformed(format!("'{what}': {why}")))?;
    Ok(value)
}

/// Format sanity checks for the header/footer documents.
trait Validated {
    fn validate(&self) -> std::result::Result<(), String>;
}

impl Validated for PackageHeader {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.format_type != HEADER_FORMAT_TYPE || self.format_version != FORMAT_VERSION {
            return Err(format!(
                "unsupported format {} version {}",
                self.format_type, self.format_version
            ));
        }
        Ok(())
    }
}

impl Validated for PackageFooter {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.format_type != FOOTER_FORMAT_TYPE || self.format_version != FORMAT_VERSION {
            return Err(format!(
                "unsupported format {} version {}",
                self.format_type, self.format_version
            ));
        }
        Ok(())
    }
}

fn header_to_report(header: PackageHeader) -> Result<InstallationReport> {
    if !is_valid_package_id(&header.package_id) {
        return Err(malformed(format!(
            "'{}' is not a valid package id",
            header.package_id
        )));
    }
    let mut report = InstallationReport::new(header.package_id);
    report.disk_space_used = header.disk_space_used;
    report.extra_metadata = header.extra_meta_data;
    report.extra_signed_metadata = header.extra_signed_meta_data;
    Ok(report)
}
