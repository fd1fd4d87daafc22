//! A persistent, append-only store of SPU function bodies.
//!
//! Every function the recompiler discovers is appended to the store as one record; when the
//! runtime next starts it reads all records back and compiles them before any guest code runs, so
//! that analysis does not have to rediscover them.
//!
//! The store is deliberately forgiving. If the backing file cannot be opened, the store is
//! "absent": [SpuCache::is_open] returns `false`, [SpuCache::get] yields nothing, and
//! [SpuCache::add] does nothing. Records with bad checksums are skipped; a torn tail (e.g. after a
//! crash mid-append) is cut off so that later appends remain readable.
//!
//! ## File format
//!
//! All integers are little-endian.
//!
//! ```text
//! header:  magic "SPUC" | version: u32 | flags: u32 | reserved: u32
//! record:  entry: u32 | nwords: u32 | crc32: u32 | words: [u32; nwords]
//! ```
//!
//! The checksum covers `entry`, `nwords` and the words.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    mem,
    path::{Path, PathBuf},
    sync::OnceLock,
};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"SPUC";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const RECORD_HEADER_LEN: usize = 12;
/// No function can be longer than the local storage.
pub const MAX_RECORD_WORDS: u32 = 0x10000;

/// Why a cache could not be opened, or why some of its contents were discarded.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Bad magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("Unsupported cache version {0}")]
    UnsupportedVersion(u32),
    #[error("Truncated record at offset {0}")]
    Truncated(u64),
    #[error("Checksum mismatch at offset {offset}: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        offset: u64,
        expected: u32,
        actual: u32,
    },
    #[error("Record at offset {offset} claims {nwords} words")]
    TooLarge { offset: u64, nwords: u32 },
    #[error("A function of {0} words is too long to store")]
    RecordTooLong(usize),
    #[error("{0} is already opened for writing by this process")]
    Busy(PathBuf),
}

/// One stored function: its entry address in local storage and its instruction words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRecord {
    pub entry: u32,
    pub words: Vec<u32>,
}

/// The paths currently held open for writing by a [SpuCache] in this process.
static WRITERS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

pub struct SpuCache {
    /// `None` if the store is absent.
    file: Option<Mutex<File>>,
    /// The path we registered in [WRITERS], if any.
    path: Option<PathBuf>,
    /// Records read at open time, handed out (once) by [Self::get].
    records: Vec<CacheRecord>,
    /// Problems encountered while opening. None of these are fatal.
    diagnostics: Vec<CacheError>,
}

impl SpuCache {
    /// Prepare the process-wide state that caches share. This is idempotent and is called
    /// implicitly by [Self::new], but embedders may call it early (e.g. before spawning threads).
    pub fn initialize() {
        WRITERS.get_or_init(|| Mutex::new(HashSet::new()));
    }

    /// Open or create the cache at `loc`. This never fails: if `loc` can't be used, the returned
    /// cache is absent and [Self::diagnostics] says why.
    pub fn new<P: AsRef<Path>>(loc: P) -> Self {
        Self::initialize();
        let loc = loc.as_ref();
        let mut diagnostics = Vec::new();
        match Self::open(loc, &mut diagnostics) {
            Ok((file, path, records)) => Self {
                file: Some(Mutex::new(file)),
                path: Some(path),
                records,
                diagnostics,
            },
            Err(e) => {
                diagnostics.push(e);
                Self::absent_with(diagnostics)
            }
        }
    }

    /// Create a cache that is always absent.
    pub fn absent() -> Self {
        Self::absent_with(Vec::new())
    }

    fn absent_with(diagnostics: Vec<CacheError>) -> Self {
        Self {
            file: None,
            path: None,
            records: Vec::new(),
            diagnostics,
        }
    }

    fn open(
        loc: &Path,
        diagnostics: &mut Vec<CacheError>,
    ) -> Result<(File, PathBuf, Vec<CacheRecord>), CacheError> {
        if let Some(parent) = loc.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(loc)?;
        // Canonicalise only once the file exists, so that two spellings of one path collide.
        let path = fs::canonicalize(loc)?;
        if !WRITERS
            .get_or_init(|| Mutex::new(HashSet::new()))
            .lock()
            .insert(path.clone())
        {
            return Err(CacheError::Busy(path));
        }

        let records = match Self::load(&mut file, diagnostics) {
            Ok(x) => x,
            Err(e) => {
                WRITERS
                    .get_or_init(|| Mutex::new(HashSet::new()))
                    .lock()
                    .remove(&path);
                return Err(e);
            }
        };
        Ok((file, path, records))
    }

    /// Read every valid record from `file`, repairing the file so that it ends just after the
    /// last record which could be framed.
    fn load(
        file: &mut File,
        diagnostics: &mut Vec<CacheError>,
    ) -> Result<Vec<CacheRecord>, CacheError> {
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        if len < HEADER_LEN || Self::check_header(file).map_err(|e| diagnostics.push(e)).is_err() {
            if len > 0 && len < HEADER_LEN {
                diagnostics.push(CacheError::Truncated(0));
            }
            // Either a new file or one we can't make sense of: start afresh.
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            Self::write_header(file)?;
            file.sync_data()?;
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut rdr = BufReader::new(&mut *file);
        let mut off = HEADER_LEN;
        while off < len {
            match read_record(&mut rdr, off, len) {
                Ok((rec, next)) => {
                    records.push(rec);
                    off = next;
                }
                Err((e @ CacheError::ChecksumMismatch { .. }, next)) => {
                    // The framing is intact, so only this record is lost.
                    diagnostics.push(e);
                    off = next;
                }
                Err((e, _)) => {
                    diagnostics.push(e);
                    break;
                }
            }
        }
        drop(rdr);
        if off != len {
            // Cut off the torn tail so that new records directly follow the last good one.
            file.set_len(off)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(records)
    }

    fn check_header(file: &mut File) -> Result<(), CacheError> {
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(CacheError::BadMagic(magic));
        }
        let version = file.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(CacheError::UnsupportedVersion(version));
        }
        // Flags and the reserved word are currently ignored.
        file.read_u32::<LittleEndian>()?;
        file.read_u32::<LittleEndian>()?;
        Ok(())
    }

    fn write_header(file: &mut File) -> io::Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN as usize);
        buf.extend_from_slice(&MAGIC);
        buf.write_u32::<LittleEndian>(VERSION)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;
        file.write_all(&buf)
    }

    /// Is the backing store usable?
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Problems encountered while opening the store (an unopenable location, skipped records, a
    /// torn tail). These are diagnostics only: none of them stop the cache being used.
    pub fn diagnostics(&self) -> &[CacheError] {
        &self.diagnostics
    }

    /// Return every record present when the store was opened, oldest first. The records are
    /// handed out once: later calls return an empty iterator.
    pub fn get(&mut self) -> std::vec::IntoIter<CacheRecord> {
        mem::take(&mut self.records).into_iter()
    }

    /// Append one function to the store. The record is on disk when this returns; if it can't
    /// be written, none of it is. If the store is absent this does nothing.
    pub fn add(&self, entry: u32, words: &[u32]) -> Result<(), CacheError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let buf = encode_record(entry, words)?;
        append(&mut *file.lock(), &buf)
    }
}

/// What appending to the store needs from its backing file.
trait Backing: Write + Seek {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl Backing for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Append `buf` to `f`. If that fails part way, the partial write is cut off again so that the
/// next record still starts where a reader expects one.
fn append<B: Backing>(f: &mut B, buf: &[u8]) -> Result<(), CacheError> {
    let start = f.seek(SeekFrom::End(0))?;
    if let Err(e) = f.write_all(buf).and_then(|_| f.sync()) {
        // If this fails too, the next load cuts the file off at the torn record.
        f.truncate(start).ok();
        return Err(e.into());
    }
    Ok(())
}

fn encode_record(entry: u32, words: &[u32]) -> Result<Vec<u8>, CacheError> {
    if words.len() > MAX_RECORD_WORDS as usize {
        return Err(CacheError::RecordTooLong(words.len()));
    }
    let mut buf = vec![0u8; RECORD_HEADER_LEN + words.len() * 4];
    LittleEndian::write_u32(&mut buf[0..4], entry);
    LittleEndian::write_u32(&mut buf[4..8], words.len() as u32);
    LittleEndian::write_u32_into(words, &mut buf[RECORD_HEADER_LEN..]);
    let crc = record_crc(&buf[0..8], &buf[RECORD_HEADER_LEN..]);
    LittleEndian::write_u32(&mut buf[8..12], crc);
    Ok(buf)
}

impl Drop for SpuCache {
    fn drop(&mut self) {
        if let Some(p) = self.path.take() {
            if let Some(w) = WRITERS.get() {
                w.lock().remove(&p);
            }
        }
    }
}

fn record_crc(header: &[u8], words: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(header);
    h.update(words);
    h.finalize()
}

/// Read the record starting at `off`. On success, or on a checksum mismatch, the offset of the
/// following record is returned too.
fn read_record<R: Read>(
    rdr: &mut R,
    off: u64,
    len: u64,
) -> Result<(CacheRecord, u64), (CacheError, u64)> {
    if len - off < RECORD_HEADER_LEN as u64 {
        return Err((CacheError::Truncated(off), off));
    }
    let mut hdr = [0u8; RECORD_HEADER_LEN];
    rdr.read_exact(&mut hdr).map_err(|e| (e.into(), off))?;
    let entry = LittleEndian::read_u32(&hdr[0..4]);
    let nwords = LittleEndian::read_u32(&hdr[4..8]);
    let expected = LittleEndian::read_u32(&hdr[8..12]);
    if nwords > MAX_RECORD_WORDS {
        return Err((CacheError::TooLarge { offset: off, nwords }, off));
    }
    let body_len = u64::from(nwords) * 4;
    if len - off - (RECORD_HEADER_LEN as u64) < body_len {
        return Err((CacheError::Truncated(off), off));
    }
    let mut body = vec![0u8; body_len as usize];
    rdr.read_exact(&mut body).map_err(|e| (e.into(), off))?;
    let next = off + RECORD_HEADER_LEN as u64 + body_len;
    let actual = record_crc(&hdr[0..8], &body);
    if actual != expected {
        return Err((
            CacheError::ChecksumMismatch {
                offset: off,
                expected,
                actual,
            },
            next,
        ));
    }
    let mut words = vec![0u32; nwords as usize];
    LittleEndian::read_u32_into(&body, &mut words);
    Ok((CacheRecord { entry, words }, next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn funcs() -> Vec<(u32, Vec<u32>)> {
        vec![
            (0, vec![0x40200000, 0x32000000]),
            (0x100, vec![0x00200000, 0x40200000, 0x33ffff80, 0x00002000]),
            (0x3fffc, vec![0x35000000]),
        ]
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("spu.cache");
        {
            let c = SpuCache::new(&p);
            assert!(c.is_open());
            for (entry, words) in funcs() {
                c.add(entry, &words).unwrap();
            }
        }
        let mut c = SpuCache::new(&p);
        assert!(c.is_open());
        assert!(c.diagnostics().is_empty());
        let got = c
            .get()
            .map(|r| (r.entry, r.words))
            .collect::<Vec<_>>();
        assert_eq!(got, funcs());
        // One-shot.
        assert_eq!(c.get().count(), 0);
    }

    #[test]
    fn creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("a").join("b").join("spu.cache");
        let c = SpuCache::new(&p);
        assert!(c.is_open());
        assert!(p.exists());
    }

    #[test]
    fn truncated_tail_is_skipped_and_repaired() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("spu.cache");
        {
            let c = SpuCache::new(&p);
            for (entry, words) in funcs() {
                c.add(entry, &words).unwrap();
            }
        }
        // Tear the final record in half.
        let len = fs::metadata(&p).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&p)
            .unwrap()
            .set_len(len - 2)
            .unwrap();
        {
            let mut c = SpuCache::new(&p);
            assert!(matches!(c.diagnostics(), [CacheError::Truncated(_)]));
            let got = c.get().map(|r| (r.entry, r.words)).collect::<Vec<_>>();
            assert_eq!(got, funcs()[..2]);
            c.add(0x200, &[0x40200000]).unwrap();
        }
        let mut c = SpuCache::new(&p);
        assert!(c.diagnostics().is_empty());
        let got = c.get().map(|r| r.entry).collect::<Vec<_>>();
        assert_eq!(got, vec![0, 0x100, 0x200]);
    }

    /// Writes at most `budget` bytes, then fails.
    struct ShortWrites {
        file: File,
        budget: usize,
    }

    impl Write for ShortWrites {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::other("no space left"));
            }
            let n = self.file.write(&buf[..buf.len().min(self.budget)])?;
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl Seek for ShortWrites {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.file.seek(pos)
        }
    }

    impl Backing for ShortWrites {
        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.file.set_len(len)
        }

        fn sync(&mut self) -> io::Result<()> {
            self.file.sync_data()
        }
    }

    #[test]
    fn failed_append_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("spu.cache");
        let c = SpuCache::new(&p);
        c.add(0, &[0x40200000]).unwrap();
        let len = fs::metadata(&p).unwrap().len();

        // The disk fills up half way through the next record's header.
        let mut short = ShortWrites {
            file: OpenOptions::new().write(true).open(&p).unwrap(),
            budget: 6,
        };
        let buf = encode_record(0x100, &[0x40200000, 0x32000000]).unwrap();
        assert!(matches!(append(&mut short, &buf), Err(CacheError::Io(_))));
        assert_eq!(fs::metadata(&p).unwrap().len(), len);

        c.add(0x200, &[0x00200000]).unwrap();
        drop(c);
        let mut c = SpuCache::new(&p);
        assert!(c.diagnostics().is_empty());
        let got = c.get().map(|r| r.entry).collect::<Vec<_>>();
        assert_eq!(got, vec![0, 0x200]);
    }

    #[test]
    fn overlong_functions_are_refused() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("spu.cache");
        let c = SpuCache::new(&p);
        let words = vec![0x40200000; MAX_RECORD_WORDS as usize + 1];
        assert!(matches!(
            c.add(0, &words),
            Err(CacheError::RecordTooLong(n)) if n == words.len()
        ));
        c.add(0, &words[..MAX_RECORD_WORDS as usize]).unwrap();
        drop(c);
        let mut c = SpuCache::new(&p);
        let got = c.get().map(|r| r.words.len()).collect::<Vec<_>>();
        assert_eq!(got, vec![MAX_RECORD_WORDS as usize]);
    }

    #[test]
    fn bad_checksum_skips_only_that_record() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("spu.cache");
        {
            let c = SpuCache::new(&p);
            for (entry, words) in funcs() {
                c.add(entry, &words).unwrap();
            }
        }
        // Flip a bit in the first word of the first record.
        let mut bytes = fs::read(&p).unwrap();
        bytes[HEADER_LEN as usize + RECORD_HEADER_LEN] ^= 1;
        fs::write(&p, bytes).unwrap();

        let mut c = SpuCache::new(&p);
        assert!(matches!(
            c.diagnostics(),
            [CacheError::ChecksumMismatch { .. }]
        ));
        let got = c.get().map(|r| r.entry).collect::<Vec<_>>();
        assert_eq!(got, vec![0x100, 0x3fffc]);
    }

    #[test]
    fn bad_header_starts_afresh() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("spu.cache");
        fs::write(&p, b"not a cache file at all").unwrap();
        {
            let mut c = SpuCache::new(&p);
            assert!(c.is_open());
            assert!(matches!(c.diagnostics(), [CacheError::BadMagic(_)]));
            assert_eq!(c.get().count(), 0);
            c.add(4, &[0x40200000]).unwrap();
        }
        let mut c = SpuCache::new(&p);
        assert_eq!(
            c.get().collect::<Vec<_>>(),
            vec![CacheRecord {
                entry: 4,
                words: vec![0x40200000]
            }]
        );
    }

    #[test]
    fn unopenable_location_is_absent() {
        let dir = TempDir::new().unwrap();
        // A directory can't be opened as a file.
        let mut c = SpuCache::new(dir.path());
        assert!(!c.is_open());
        assert!(!c.diagnostics().is_empty());
        assert_eq!(c.get().count(), 0);
        c.add(0, &[1, 2, 3]).unwrap();
    }

    #[test]
    fn one_writer_per_path() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("spu.cache");
        let c1 = SpuCache::new(&p);
        let c2 = SpuCache::new(&p);
        assert!(c1.is_open());
        assert!(!c2.is_open());
        assert!(matches!(c2.diagnostics(), [CacheError::Busy(_)]));
        drop(c1);
        drop(c2);
        assert!(SpuCache::new(&p).is_open());
    }
}
