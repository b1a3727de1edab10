//! Payload collaborators of the transfer engine: where the sender's bytes
//! come from and where the receiver's bytes go.
//!
//! Bundles are plain zip archives built in memory, the same way a folder has
//! always been packed for sending. The engine never looks inside them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use walkdir::WalkDir;
use zip::read::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::{Error, Result};
use crate::transfer::{PayloadSink, ReceivedPayload};
use crate::utils::{OfferKind, TransferOffer};

/// Read up to `chunk_size` bytes. An empty chunk means the source is drained.
pub fn read_chunk<R: Read + ?Sized>(data_source: &mut R, chunk_size: usize) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(chunk_size);
    Read::take(&mut *data_source, chunk_size as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}

// ============================================================================
// Sources
// ============================================================================

/// Offer plus the reader producing exactly `offer.total_size` bytes.
pub struct PayloadSource {
    offer: TransferOffer,
    reader: Box<dyn Read + Send>,
}

impl PayloadSource {
    pub fn text(text: String) -> Self {
        let offer = TransferOffer::text(text.len() as u64);
        PayloadSource { offer, reader: Box::new(Cursor::new(text.into_bytes())) }
    }

    /// In-memory data offered as a file called `name`.
    pub fn bytes(name: &str, data: Vec<u8>) -> Result<Self> {
        let offer = TransferOffer::file(safe_file_name(name)?, data.len() as u64);
        Ok(PayloadSource { offer, reader: Box::new(Cursor::new(data)) })
    }

    /// One regular file is sent as-is; a directory or several paths become a
    /// bundle.
    pub fn paths(paths: &[PathBuf]) -> Result<Self> {
        if let [single] = paths {
            if fs::metadata(single).map_err(Error::Io)?.is_file() {
                let name = single
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| Error::Bundle(format!("{} has no usable file name", single.display())))?;
                let file = File::open(single).map_err(Error::Io)?;
                let size = file.metadata().map_err(Error::Io)?.len();
                debug!("Sending file {} ({} bytes)", name, size);
                return Ok(PayloadSource { offer: TransferOffer::file(name, size), reader: Box::new(file) });
            }
        }
        if paths.is_empty() {
            return Err(Error::Bundle("nothing to send".into()));
        }

        let (zip_data, names) = compress_paths(paths)?;
        debug!("Bundled {} path(s) into {} bytes", names.len(), zip_data.len());
        let offer = TransferOffer::bundle(names, zip_data.len() as u64);
        Ok(PayloadSource { offer, reader: Box::new(Cursor::new(zip_data)) })
    }

    pub fn offer(&self) -> &TransferOffer {
        &self.offer
    }

    pub(crate) fn reader(&mut self) -> &mut (dyn Read + Send) {
        self.reader.as_mut()
    }
}

/// Pack `paths` into one zip archive. Each path keeps its own name at the top
/// level of the archive; directories are walked recursively.
///
/// Returns the archive and the top-level names.
pub fn compress_paths(paths: &[PathBuf]) -> Result<(Vec<u8>, Vec<String>)> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let mut names: Vec<String> = Vec::new();

    for path in paths {
        let root = fs::canonicalize(path).map_err(Error::Io)?;
        let top = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Bundle(format!("{} has no usable name", path.display())))?
            .to_string();
        if names.contains(&top) {
            return Err(Error::Bundle(format!("two paths are both named {top}")));
        }

        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|e| Error::Bundle(e.to_string()))?;
            let name = archive_name(&top, relative)?;
            let file_type = entry.file_type();
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .unix_permissions(entry_mode(&entry));

            if file_type.is_dir() {
                debug!("Adding directory: {}/", name);
                zip.add_directory(format!("{name}/"), options)?;
            } else if file_type.is_file() {
                debug!("Adding file: {}", name);
                zip.start_file(name, options)?;
                let mut f = File::open(entry.path()).map_err(Error::Io)?;
                io::copy(&mut f, &mut zip).map_err(Error::Io)?;
            } else {
                warn!("Skipping {}: not a regular file or directory", entry.path().display());
            }
        }
        names.push(top);
    }

    let cursor = zip.finish()?;
    Ok((cursor.into_inner(), names))
}

fn archive_name(top: &str, relative: &Path) -> Result<String> {
    let mut name = top.to_string();
    for component in relative.components() {
        let Component::Normal(part) = component else {
            return Err(Error::Bundle(format!("unexpected path component in {}", relative.display())));
        };
        let part = part
            .to_str()
            .ok_or_else(|| Error::Bundle(format!("{} is not valid UTF-8", relative.display())))?;
        name.push('/');
        name.push_str(part);
    }
    Ok(name)
}

#[cfg(unix)]
fn entry_mode(entry: &walkdir::DirEntry) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    entry.metadata().map(|m| m.permissions().mode() & 0o777).unwrap_or(0o644)
}

#[cfg(not(unix))]
fn entry_mode(entry: &walkdir::DirEntry) -> u32 {
    if entry.file_type().is_dir() { 0o755 } else { 0o644 }
}

// ============================================================================
// Sinks
// ============================================================================

/// Where accepted payloads are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Files and bundles land in this directory.
    Directory(PathBuf),
    /// Everything is kept in memory and handed back in the summary.
    Memory,
}

pub fn open_sink(offer: &TransferOffer, target: &OutputTarget) -> Result<Box<dyn PayloadSink>> {
    match (offer.kind, target) {
        (OfferKind::Text, _) | (_, OutputTarget::Memory) => Ok(Box::new(MemorySink::new(offer))),
        (OfferKind::File, OutputTarget::Directory(dir)) => {
            let name = safe_file_name(&offer.display_name())?;
            Ok(Box::new(FileSink::create(dir, &name)?))
        }
        (OfferKind::Bundle, OutputTarget::Directory(dir)) => Ok(Box::new(BundleSink::new(offer, dir))),
    }
}

/// Buffers in memory no more than this up front, whatever the offer claims.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

fn buffer_for(offer: &TransferOffer) -> Vec<u8> {
    Vec::with_capacity(offer.total_size.min(MAX_PREALLOCATION) as usize)
}

struct MemorySink {
    kind: OfferKind,
    data: Vec<u8>,
}

impl MemorySink {
    fn new(offer: &TransferOffer) -> Self {
        MemorySink { kind: offer.kind, data: buffer_for(offer) }
    }
}

impl PayloadSink for MemorySink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<ReceivedPayload> {
        match self.kind {
            OfferKind::Text => String::from_utf8(self.data)
                .map(ReceivedPayload::Text)
                .map_err(|_| Error::protocol("text message is not valid UTF-8")),
            _ => Ok(ReceivedPayload::Memory(self.data)),
        }
    }

    fn discard(self: Box<Self>) {}
}

/// Writes to `NAME.part` and only moves the file into place once the payload
/// is verified.
struct FileSink {
    dir: PathBuf,
    name: String,
    part: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    fn create(dir: &Path, name: &str) -> Result<Self> {
        let part = unique_path(dir, &format!("{name}.part"));
        let writer = create_file_bufwriter(&part).map_err(Error::Io)?;
        debug!("Writing incoming file to {}", part.display());
        Ok(FileSink { dir: dir.to_path_buf(), name: name.to_string(), part, writer })
    }
}

impl PayloadSink for FileSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.writer.write_all(chunk).map_err(Error::Io)
    }

    fn finish(self: Box<Self>) -> Result<ReceivedPayload> {
        let FileSink { dir, name, part, writer } = *self;
        let finished = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all());
        if let Err(e) = finished {
            let _ = fs::remove_file(&part);
            return Err(Error::Io(e));
        }

        let target = unique_path(&dir, &name);
        if let Err(e) = fs::rename(&part, &target) {
            let _ = fs::remove_file(&part);
            return Err(Error::Io(e));
        }
        debug!("Saved {}", target.display());
        Ok(ReceivedPayload::File(target))
    }

    fn discard(self: Box<Self>) {
        let FileSink { part, writer, .. } = *self;
        drop(writer);
        if let Err(e) = fs::remove_file(&part) {
            warn!("Could not remove partial file {}: {}", part.display(), e);
        }
    }
}

/// Collects the archive in memory and extracts it after verification.
struct BundleSink {
    dir: PathBuf,
    data: Vec<u8>,
}

impl BundleSink {
    fn new(offer: &TransferOffer, dir: &Path) -> Self {
        BundleSink { dir: dir.to_path_buf(), data: buffer_for(offer) }
    }
}

impl PayloadSink for BundleSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<ReceivedPayload> {
        extract_bundle(&self.data, &self.dir).map(ReceivedPayload::Bundle)
    }

    fn discard(self: Box<Self>) {}
}

/// Unpack a bundle into `output_dir`.
///
/// Entries are first extracted into a staging directory, then every
/// top-level entry is moved into place under a name that does not exist yet.
/// Entries whose path would escape the output directory abort the whole
/// extraction.
pub fn extract_bundle(zip_data: &[u8], output_dir: &Path) -> Result<Vec<PathBuf>> {
    let staging = unique_path(output_dir, ".codedrop-bundle.part");
    fs::create_dir_all(&staging).map_err(Error::Io)?;

    if let Err(e) = unpack_into(zip_data, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    let mut entries: Vec<_> = fs::read_dir(&staging)
        .map_err(Error::Io)?
        .collect::<io::Result<Vec<_>>>()
        .map_err(Error::Io)?;
    entries.sort_by_key(|e| e.file_name());

    let mut placed = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry.file_name();
        let target = unique_path(output_dir, &name.to_string_lossy());
        fs::rename(entry.path(), &target).map_err(Error::Io)?;
        placed.push(target);
    }
    fs::remove_dir_all(&staging).map_err(Error::Io)?;

    debug!("Extracted bundle into {} top-level entries", placed.len());
    Ok(placed)
}

fn unpack_into(zip_data: &[u8], staging: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(zip_data))?;
    debug!("Extracting {} files/folders...", archive.len());

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let Some(relative) = file.enclosed_name() else {
            return Err(Error::Bundle(format!("entry {} escapes the output directory", file.name())));
        };
        let outpath = staging.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&outpath).map_err(Error::Io)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let mut outfile = File::create(&outpath).map_err(Error::Io)?;
        io::copy(&mut file, &mut outfile).map_err(Error::Io)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o777)).map_err(Error::Io)?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Paths
// ============================================================================

/// Final path component of a name declared by the peer. Anything that is not
/// a plain file name is refused.
pub fn safe_file_name(name: &str) -> Result<String> {
    let path = Path::new(name);
    match (path.file_name().and_then(|n| n.to_str()), path.components().count()) {
        (Some(file_name), 1) => Ok(file_name.to_string()),
        _ => Err(Error::protocol(format!("unusable file name {name:?}"))),
    }
}

/// `dir/name`, or `dir/stem (N).ext` with the smallest free `N`. Existing
/// files are never overwritten.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if fs::symlink_metadata(&candidate).is_err() {
        return candidate;
    }

    let as_path = Path::new(name);
    let stem = as_path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let extension = as_path.extension().and_then(|e| e.to_str());
    (1u32..)
        .map(|n| match extension {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| fs::symlink_metadata(p).is_err())
        .unwrap_or(candidate)
}

/// Buffered writer for a file that must not exist yet.
pub fn create_file_bufwriter(output_path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().write(true).create_new(true).open(output_path)?;
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("test_codedrop_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    // ============================================================================
    // Chunk Reading Tests
    // ============================================================================

    #[test]
    fn test_read_chunk_full_and_partial() {
        let mut cursor = Cursor::new(vec![7u8; 250]);
        assert_eq!(read_chunk(&mut cursor, 100).unwrap().len(), 100);
        assert_eq!(read_chunk(&mut cursor, 100).unwrap().len(), 100);
        assert_eq!(read_chunk(&mut cursor, 100).unwrap().len(), 50);
        assert!(read_chunk(&mut cursor, 100).unwrap().is_empty());
    }

    #[test]
    fn test_read_chunk_empty_source() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let chunk = read_chunk(&mut cursor, 64).expect("Should handle EOF");
        assert!(chunk.is_empty());
    }

    // ============================================================================
    // Source Tests
    // ============================================================================

    #[test]
    fn test_single_file_is_not_bundled() {
        let dir = temp_dir("single");
        let path = dir.join("notes.txt");
        fs::write(&path, b"Hello, World!").unwrap();

        let mut source = PayloadSource::paths(&[path]).expect("Should open file");
        assert_eq!(source.offer(), &TransferOffer::file("notes.txt", 13));
        let chunk = read_chunk(source.reader(), 1024).unwrap();
        assert_eq!(chunk, b"Hello, World!");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_path_is_io_error() {
        let result = PayloadSource::paths(&[PathBuf::from("/definitely/not/here.bin")]);
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_empty_path_list_is_rejected() {
        assert!(matches!(PayloadSource::paths(&[]), Err(Error::Bundle(_))));
    }

    #[test]
    fn test_bytes_source_uses_plain_name() {
        assert!(PayloadSource::bytes("../escape.txt", vec![1]).is_err());
        let source = PayloadSource::bytes("data.bin", vec![1, 2, 3]).unwrap();
        assert_eq!(source.offer().total_size, 3);
    }

    // ============================================================================
    // Bundle Tests
    // ============================================================================

    #[test]
    fn test_bundle_roundtrip_preserves_structure() {
        let src = temp_dir("bundle_src");
        let folder = src.join("photos");
        fs::create_dir_all(folder.join("nested")).unwrap();
        fs::write(folder.join("root.txt"), b"Root file").unwrap();
        fs::write(folder.join("nested").join("deep.txt"), b"Nested file").unwrap();
        let loose = src.join("loose.md");
        fs::write(&loose, b"# loose").unwrap();

        let (zip_data, names) = compress_paths(&[folder, loose]).expect("Should compress");
        assert_eq!(names, vec!["photos".to_string(), "loose.md".to_string()]);

        let dst = temp_dir("bundle_dst");
        let placed = extract_bundle(&zip_data, &dst).expect("Should extract");
        assert_eq!(placed.len(), 2);
        assert_eq!(fs::read(dst.join("photos").join("root.txt")).unwrap(), b"Root file");
        assert_eq!(fs::read(dst.join("photos").join("nested").join("deep.txt")).unwrap(), b"Nested file");
        assert_eq!(fs::read(dst.join("loose.md")).unwrap(), b"# loose");
        // Staging directory is gone.
        assert_eq!(fs::read_dir(&dst).unwrap().count(), 2);

        let _ = fs::remove_dir_all(&src);
        let _ = fs::remove_dir_all(&dst);
    }

    #[test]
    fn test_empty_folder_bundles() {
        let src = temp_dir("bundle_empty");
        let folder = src.join("empty");
        fs::create_dir_all(&folder).unwrap();

        let (zip_data, _) = compress_paths(&[folder]).expect("Should compress empty folder");
        let dst = temp_dir("bundle_empty_dst");
        extract_bundle(&zip_data, &dst).expect("Should extract");
        assert!(dst.join("empty").is_dir());

        let _ = fs::remove_dir_all(&src);
        let _ = fs::remove_dir_all(&dst);
    }

    #[test]
    fn test_extract_does_not_overwrite() {
        let src = temp_dir("bundle_clash_src");
        let file = src.join("report.txt");
        fs::write(&file, b"new").unwrap();
        let (zip_data, _) = compress_paths(&[file.clone()]).unwrap();
        assert!(matches!(compress_paths(&[file.clone(), file]), Err(Error::Bundle(_))));

        let dst = temp_dir("bundle_clash_dst");
        fs::write(dst.join("report.txt"), b"old").unwrap();
        let placed = extract_bundle(&zip_data, &dst).unwrap();
        assert_eq!(placed, vec![dst.join("report (1).txt")]);
        assert_eq!(fs::read(dst.join("report.txt")).unwrap(), b"old");

        let _ = fs::remove_dir_all(&src);
        let _ = fs::remove_dir_all(&dst);
    }

    #[test]
    fn test_escaping_entry_is_rejected() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("../evil.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"gotcha").unwrap();
        let zip_data = zip.finish().unwrap().into_inner();

        let dst = temp_dir("bundle_evil");
        let result = extract_bundle(&zip_data, &dst);
        assert!(matches!(result, Err(Error::Bundle(_))));
        assert_eq!(fs::read_dir(&dst).unwrap().count(), 0);
        assert!(!dst.parent().unwrap().join("evil.txt").exists());

        let _ = fs::remove_dir_all(&dst);
    }

    #[test]
    fn test_garbage_bundle_is_bundle_error() {
        let dst = temp_dir("bundle_garbage");
        assert!(matches!(extract_bundle(b"not a zip", &dst), Err(Error::Bundle(_))));
        let _ = fs::remove_dir_all(&dst);
    }

    // ============================================================================
    // Sink Tests
    // ============================================================================

    #[test]
    fn test_file_sink_renames_after_finish() {
        let dir = temp_dir("sink_file");
        let offer = TransferOffer::file("out.bin", 4);
        let mut sink = open_sink(&offer, &OutputTarget::Directory(dir.clone())).unwrap();
        sink.write_chunk(b"ab").unwrap();
        sink.write_chunk(b"cd").unwrap();
        assert!(dir.join("out.bin.part").exists());
        assert!(!dir.join("out.bin").exists());

        let received = sink.finish().expect("Should finish");
        assert_eq!(received, ReceivedPayload::File(dir.join("out.bin")));
        assert_eq!(fs::read(dir.join("out.bin")).unwrap(), b"abcd");
        assert!(!dir.join("out.bin.part").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_file_sink_discard_removes_part() {
        let dir = temp_dir("sink_discard");
        let offer = TransferOffer::file("half.bin", 100);
        let mut sink = open_sink(&offer, &OutputTarget::Directory(dir.clone())).unwrap();
        sink.write_chunk(&[0u8; 50]).unwrap();
        sink.discard();
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_text_sink_yields_string() {
        let offer = TransferOffer::text(5);
        let mut sink = open_sink(&offer, &OutputTarget::Memory).unwrap();
        sink.write_chunk(b"hello").unwrap();
        assert_eq!(sink.finish().unwrap(), ReceivedPayload::Text("hello".into()));
    }

    #[test]
    fn test_text_sink_rejects_invalid_utf8() {
        let offer = TransferOffer::text(2);
        let mut sink = open_sink(&offer, &OutputTarget::Memory).unwrap();
        sink.write_chunk(&[0xff, 0xfe]).unwrap();
        assert!(matches!(sink.finish(), Err(Error::Protocol(_))));
    }

    // ============================================================================
    // Path Tests
    // ============================================================================

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("report.pdf").unwrap(), "report.pdf");
        assert!(safe_file_name("../etc/passwd").is_err());
        assert!(safe_file_name("dir/file").is_err());
        assert!(safe_file_name("..").is_err());
        assert!(safe_file_name("").is_err());
        assert!(safe_file_name("/abs").is_err());
    }

    #[test]
    fn test_unique_path_adds_suffix() {
        let dir = temp_dir("unique");
        assert_eq!(unique_path(&dir, "a.txt"), dir.join("a.txt"));
        fs::write(dir.join("a.txt"), b"").unwrap();
        assert_eq!(unique_path(&dir, "a.txt"), dir.join("a (1).txt"));
        fs::write(dir.join("a (1).txt"), b"").unwrap();
        assert_eq!(unique_path(&dir, "a.txt"), dir.join("a (2).txt"));
        fs::create_dir(dir.join("folder")).unwrap();
        assert_eq!(unique_path(&dir, "folder"), dir.join("folder (1)"));

        let _ = fs::remove_dir_all(&dir);
    }
}
