//! Shard index writer and memory-mapped reader.

use super::format::{
    CRC_SIZE, FILE_BINARY, HEADER_SIZE, ShardHeader, TRIGRAM_ENTRY_SIZE, VERSION, read_u16,
    read_u32, verify_section,
};
use super::planner::TrigramQuery;
use crate::error::{Error, Result};
use crate::utils::{Trigram, extract_trigrams_multi, fold_content, is_binary};
use ahash::AHashMap;
use memmap2::Mmap;
use roaring::RoaringBitmap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

/// Identifier of a file within one shard
pub type FileId = u32;

/// Accumulates files for one shard and writes it out on [`ShardWriter::flush`].
///
/// Output goes to a temporary sibling that is renamed over the target, so
/// readers never observe a partially written shard.
pub struct ShardWriter {
    path: PathBuf,
    files: Vec<(u8, String)>,
    postings: AHashMap<Trigram, RoaringBitmap>,
    data_bytes: u64,
    index_bytes: u64,
}

impl ShardWriter {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            files: Vec::new(),
            postings: AHashMap::new(),
            data_bytes: 0,
            index_bytes: 0,
        })
    }

    /// Read `root/rel` and index it under the name `rel`
    pub fn add_file_in_root(&mut self, root: &Path, rel: &Path) -> io::Result<()> {
        let content = fs::read(root.join(rel))?;
        self.add_file(&rel_name(rel), &content)
    }

    pub fn add_file(&mut self, name: &str, content: &[u8]) -> io::Result<()> {
        if name.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path too long to index ({} bytes)", name.len()),
            ));
        }
        let id = self.files.len() as FileId;
        self.data_bytes += content.len() as u64;

        if is_binary(content) {
            self.files.push((FILE_BINARY, name.to_string()));
            return Ok(());
        }
        self.files.push((0, name.to_string()));

        let folded = fold_content(content);
        let trigrams = match &folded {
            Some(folded) => extract_trigrams_multi(&[content, folded]),
            None => extract_trigrams_multi(&[content]),
        };
        for trigram in trigrams {
            self.postings.entry(trigram).or_default().insert(id);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Bytes of source content added so far
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    /// Size of the shard file written by the last flush
    pub fn index_bytes(&self) -> u64 {
        self.index_bytes
    }

    pub fn flush(&mut self) -> io::Result<()> {
        let bytes = self.serialize()?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".tmp.{}", std::process::id()));
        let tmp = PathBuf::from(tmp);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(&bytes)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.index_bytes = bytes.len() as u64;
        Ok(())
    }

    fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut sorted: Vec<(&Trigram, &RoaringBitmap)> = self.postings.iter().collect();
        sorted.sort_unstable_by_key(|(t, _)| **t);

        let mut output = vec![0u8; HEADER_SIZE];

        let file_table_offset = output.len() as u64;
        for (flags, name) in &self.files {
            output.push(*flags);
            output.extend_from_slice(&(name.len() as u16).to_le_bytes());
            output.extend_from_slice(name.as_bytes());
        }
        push_crc(&mut output, file_table_offset as usize);

        let mut postings = Vec::new();
        let trigram_table_offset = output.len() as u64;
        for (trigram, bitmap) in &sorted {
            let start = postings.len();
            bitmap.serialize_into(&mut postings)?;
            let len = postings.len() - start;
            output.extend_from_slice(&trigram.to_le_bytes());
            output.extend_from_slice(&(start as u32).to_le_bytes());
            output.extend_from_slice(&(len as u32).to_le_bytes());
        }
        push_crc(&mut output, trigram_table_offset as usize);

        let posting_offset = output.len() as u64;
        output.extend_from_slice(&postings);
        push_crc(&mut output, posting_offset as usize);

        let header = ShardHeader {
            version: VERSION,
            flags: 0,
            file_count: self.files.len() as u32,
            trigram_count: sorted.len() as u32,
            file_table_offset,
            trigram_table_offset,
            posting_offset,
        };
        output[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        Ok(output)
    }
}

fn push_crc(output: &mut Vec<u8>, section_start: usize) {
    let crc = crc32fast::hash(&output[section_start..]);
    output.extend_from_slice(&crc.to_le_bytes());
}

/// Slash-separated form of a root-relative path, as stored in the shard
fn rel_name(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

struct FileEntry {
    offset: usize,
    len: usize,
    flags: u8,
}

/// Read-only view of a shard file
pub struct ShardReader {
    mmap: Mmap,
    header: ShardHeader,
    files: Vec<FileEntry>,
}

impl ShardReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let corrupt = |what: &str| Error::Internal(format!("corrupt shard {}: {}", path.display(), what));

        let header = ShardHeader::from_bytes(&mmap).ok_or_else(|| corrupt("bad header"))?;
        let file_start = header.file_table_offset as usize;
        let tri_start = header.trigram_table_offset as usize;
        let post_start = header.posting_offset as usize;
        if !(HEADER_SIZE <= file_start && file_start < tri_start && tri_start < post_start)
            || post_start + CRC_SIZE > mmap.len()
        {
            return Err(corrupt("bad section offsets"));
        }
        if !verify_section(&mmap[file_start..tri_start])
            || !verify_section(&mmap[tri_start..post_start])
            || !verify_section(&mmap[post_start..])
        {
            return Err(corrupt("checksum mismatch"));
        }
        let expected_table = header.trigram_count as usize * TRIGRAM_ENTRY_SIZE + CRC_SIZE;
        if post_start - tri_start != expected_table {
            return Err(corrupt("trigram table size"));
        }

        let mut files = Vec::with_capacity(header.file_count as usize);
        let mut at = file_start;
        for _ in 0..header.file_count {
            let flags = *mmap.get(at).ok_or_else(|| corrupt("file table"))?;
            let len = read_u16(&mmap, at + 1).ok_or_else(|| corrupt("file table"))? as usize;
            let offset = at + 3;
            if offset + len > tri_start - CRC_SIZE {
                return Err(corrupt("file table"));
            }
            files.push(FileEntry { offset, len, flags });
            at = offset + len;
        }

        Ok(Self {
            mmap,
            header,
            files,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Root-relative name of file `id`
    pub fn name(&self, id: FileId) -> Option<&str> {
        let entry = self.files.get(id as usize)?;
        std::str::from_utf8(&self.mmap[entry.offset..entry.offset + entry.len]).ok()
    }

    pub fn is_binary(&self, id: FileId) -> bool {
        self.files
            .get(id as usize)
            .is_some_and(|e| e.flags & FILE_BINARY != 0)
    }

    /// Candidate file ids for `query`, ascending
    pub fn posting_query(&self, query: &TrigramQuery) -> Vec<FileId> {
        match self.eval(query) {
            Some(bitmap) => bitmap.iter().collect(),
            None => (0..self.files.len() as FileId).collect(),
        }
    }

    /// `None` means "every file"
    fn eval(&self, query: &TrigramQuery) -> Option<RoaringBitmap> {
        match query {
            TrigramQuery::All => None,
            TrigramQuery::And(trigrams) => {
                let mut acc: Option<RoaringBitmap> = None;
                for &t in trigrams {
                    let list = self.posting(t);
                    let next = match acc {
                        Some(a) => a & list,
                        None => list,
                    };
                    if next.is_empty() {
                        return Some(next);
                    }
                    acc = Some(next);
                }
                acc
            }
            TrigramQuery::Every(subs) => {
                let mut acc: Option<RoaringBitmap> = None;
                for sub in subs {
                    if let Some(list) = self.eval(sub) {
                        acc = Some(match acc {
                            Some(a) => a & list,
                            None => list,
                        });
                    }
                }
                acc
            }
            TrigramQuery::Or(subs) => {
                let mut acc = RoaringBitmap::new();
                for sub in subs {
                    acc |= self.eval(sub)?;
                }
                Some(acc)
            }
        }
    }

    fn posting(&self, trigram: Trigram) -> RoaringBitmap {
        let table = &self.mmap[self.header.trigram_table_offset as usize..];
        let count = self.header.trigram_count as usize;
        let entry = |i: usize| read_u32(table, i * TRIGRAM_ENTRY_SIZE);

        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match entry(mid) {
                Some(t) if t < trigram => lo = mid + 1,
                Some(t) if t > trigram => hi = mid,
                Some(_) => return self.read_posting(table, mid).unwrap_or_default(),
                None => break,
            }
        }
        RoaringBitmap::new()
    }

    fn read_posting(&self, table: &[u8], i: usize) -> Option<RoaringBitmap> {
        let offset = read_u32(table, i * TRIGRAM_ENTRY_SIZE + 4)? as usize;
        let len = read_u32(table, i * TRIGRAM_ENTRY_SIZE + 8)? as usize;
        let start = self.header.posting_offset as usize + offset;
        let bytes = self.mmap.get(start..start.checked_add(len)?)?;
        RoaringBitmap::deserialize_from(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::planner::plan;

    fn build(dir: &Path, files: &[(&str, &[u8])]) -> ShardReader {
        let path = dir.join("shard-0.mgi");
        let mut writer = ShardWriter::create(&path).unwrap();
        for (name, content) in files {
            writer.add_file(name, content).unwrap();
        }
        writer.flush().unwrap();
        assert_eq!(writer.index_bytes(), fs::metadata(&path).unwrap().len());
        ShardReader::open(&path).unwrap()
    }

    fn candidates<'a>(reader: &'a ShardReader, pattern: &str, ignore_case: bool) -> Vec<&'a str> {
        reader
            .posting_query(&plan(pattern, ignore_case).unwrap())
            .into_iter()
            .filter_map(|id| reader.name(id))
            .collect()
    }

    #[test]
    fn test_posting_query_narrows() {
        let dir = tempfile::tempdir().unwrap();
        let reader = build(
            dir.path(),
            &[
                ("a.txt", b"hello world"),
                ("b.txt", b"goodbye moon"),
                ("c/d.txt", b"say hello"),
            ],
        );
        assert_eq!(reader.len(), 3);
        assert_eq!(candidates(&reader, "hello", false), vec!["a.txt", "c/d.txt"]);
        assert_eq!(candidates(&reader, "moon|world", false), vec!["a.txt", "b.txt"]);
        assert!(candidates(&reader, "absent", false).is_empty());
        assert_eq!(candidates(&reader, ".", false).len(), 3);
    }

    #[test]
    fn test_case_insensitive_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let reader = build(dir.path(), &[("a.txt", b"HELLO"), ("b.txt", b"nothing")]);
        assert_eq!(candidates(&reader, "hello", true), vec!["a.txt"]);
        assert_eq!(candidates(&reader, "HELLO", false), vec!["a.txt"]);
        assert!(candidates(&reader, "NOTHING", true).contains(&"b.txt"));
    }

    #[test]
    fn test_binary_files_listed_without_trigrams() {
        let dir = tempfile::tempdir().unwrap();
        let reader = build(dir.path(), &[("bin", b"abc\x00def"), ("t.txt", b"abc")]);
        assert!(reader.is_binary(0));
        assert!(!reader.is_binary(1));
        assert_eq!(candidates(&reader, "abc", false), vec!["t.txt"]);
        assert_eq!(candidates(&reader, "", false), vec!["bin", "t.txt"]);
    }

    #[test]
    fn test_empty_shard() {
        let dir = tempfile::tempdir().unwrap();
        let reader = build(dir.path(), &[]);
        assert!(reader.is_empty());
        assert!(reader.posting_query(&TrigramQuery::All).is_empty());
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        build(dir.path(), &[("a.txt", b"hello world")]);
        let path = dir.path().join("shard-0.mgi");

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();
        assert!(ShardReader::open(&path).is_err());
    }

    #[test]
    fn test_add_file_in_root_uses_relative_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn hello() {}").unwrap();

        let path = dir.path().join("idx/r-0.mgi");
        let mut writer = ShardWriter::create(&path).unwrap();
        writer
            .add_file_in_root(dir.path(), Path::new("src/lib.rs"))
            .unwrap();
        assert_eq!(writer.data_bytes(), 17);
        writer.flush().unwrap();

        let reader = ShardReader::open(&path).unwrap();
        assert_eq!(reader.name(0), Some("src/lib.rs"));
    }
}
