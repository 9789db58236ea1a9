//! Streaming line matcher.
//!
//! Files are read in fixed-size chunks. Each pass only considers matches that
//! start inside the chunk's complete lines; the trailing partial line is
//! carried into the next read. The byte just before a chunk (always the
//! `\n` that ended the previous one) stays in the haystack so that `\A`
//! and word boundaries see the real preceding text. Context lines that fall
//! in a neighbouring chunk are carried across the edge.

use crate::error::{Error, Result};
use crate::query::LineMatches;
use memchr::{memchr, memchr_iter, memrchr};
use regex::bytes::{Regex, RegexBuilder};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Lines of context to collect around each matching line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextLines {
    pub before: usize,
    pub after: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMatches {
    /// Matching and context lines by 1-based line number
    pub lines: LineMatches,
    /// Number of matching lines
    pub num_matches: u64,
}

#[derive(Debug, Clone)]
pub struct LineMatcher {
    re: Regex,
}

impl LineMatcher {
    pub fn new(pattern: &str, ignore_case: bool) -> Result<Self> {
        let pattern = if ignore_case {
            format!("(?i){}", pattern)
        } else {
            pattern.to_string()
        };
        let re = RegexBuilder::new(&pattern)
            .multi_line(true)
            .build()
            .map_err(|e| Error::validation("re", e))?;
        Ok(Self { re })
    }

    pub fn grep_file(&self, path: &Path, context: ContextLines) -> io::Result<FileMatches> {
        self.grep_reader(File::open(path)?, context)
    }

    pub fn grep_reader<R: Read>(&self, reader: R, context: ContextLines) -> io::Result<FileMatches> {
        self.grep_chunked(reader, context, DEFAULT_CHUNK_SIZE)
    }

    pub(crate) fn grep_chunked<R: Read>(
        &self,
        mut reader: R,
        context: ContextLines,
        chunk_size: usize,
    ) -> io::Result<FileMatches> {
        let chunk_size = chunk_size.max(1);
        let mut out = FileMatches::default();
        let mut buf: Vec<u8> = Vec::with_capacity(chunk_size + 1);
        let mut eof = false;
        // offset of the first byte of the current chunk (1 once a lookbehind byte is kept)
        let mut first = 0usize;
        // line number of the line starting at `first`
        let mut first_line = 1u64;

        let mut carry = Carry::default();

        loop {
            let processed_end = fill(&mut reader, &mut buf, &mut eof, first, chunk_size)?;

            let mut chunk = Chunk {
                buf: &buf,
                first,
                end: processed_end,
                cursor: first,
                cursor_line: first_line,
            };
            chunk.owed_after(&mut carry.after, &mut out.lines);
            let next_line = self.scan(&mut chunk, context, &mut carry, &mut out);

            if eof {
                return Ok(out);
            }
            if context.before > 0 {
                chunk.keep_tail(context.before, next_line, &mut carry.tail);
            }

            // keep the `\n` that ended this chunk as lookbehind for the next
            buf.drain(..processed_end - 1);
            first = 1;
            first_line = next_line;
        }
    }

    /// Record every matching line in `chunk`; returns the line number just past it
    fn scan(
        &self,
        chunk: &mut Chunk<'_>,
        context: ContextLines,
        carry: &mut Carry,
        out: &mut FileMatches,
    ) -> u64 {
        let mut pos = chunk.first;

        while pos < chunk.end {
            let Some(m) = self.re.find_at(chunk.buf, pos) else {
                break;
            };
            let start = m.start();
            if start >= chunk.end {
                break;
            }

            let line_start = chunk.line_start(start);
            let line_end = chunk.line_end(start);
            if line_start == line_end {
                // zero-width hit on an empty line or at the chunk edge
                pos = start + 1;
                continue;
            }

            let line_no = chunk.line_number(line_start);
            out.lines.insert(line_no, chunk.text(line_start, line_end));
            out.num_matches += 1;

            chunk.before(line_start, line_no, context.before, &carry.tail, &mut out.lines);
            let owed = chunk.after(line_end, line_no, context.after, &mut out.lines);
            carry.after = carry.after.max(owed);

            pos = line_end + 1;
        }

        chunk.line_number(chunk.end)
    }
}

/// Read until the buffer holds at least one complete line past `first`, or EOF.
/// Returns the end of the processable prefix.
fn fill<R: Read>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    eof: &mut bool,
    first: usize,
    chunk_size: usize,
) -> io::Result<usize> {
    let mut target = first + chunk_size;
    loop {
        while !*eof && buf.len() < target {
            let len = buf.len();
            buf.resize(target, 0);
            match reader.read(&mut buf[len..]) {
                Ok(0) => {
                    buf.truncate(len);
                    *eof = true;
                }
                Ok(n) => buf.truncate(len + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => buf.truncate(len),
                Err(e) => {
                    buf.truncate(len);
                    return Err(e);
                }
            }
        }

        if *eof {
            return Ok(buf.len());
        }
        if let Some(i) = memrchr(b'\n', &buf[first..]) {
            return Ok(first + i + 1);
        }
        // a single line longer than the chunk: keep reading
        target += chunk_size;
    }
}

/// Context state handed from one chunk to the next
#[derive(Default)]
struct Carry {
    /// Last lines before the current chunk, oldest first
    tail: VecDeque<(u64, String)>,
    /// Lines of after-context still owed from the start of the next chunk
    after: usize,
}

/// Processable window of the read buffer, plus an incremental line counter
struct Chunk<'a> {
    buf: &'a [u8],
    first: usize,
    end: usize,
    cursor: usize,
    cursor_line: u64,
}

impl Chunk<'_> {
    fn line_start(&self, at: usize) -> usize {
        match memrchr(b'\n', &self.buf[self.first..at]) {
            Some(i) => self.first + i + 1,
            None => self.first,
        }
    }

    fn line_end(&self, at: usize) -> usize {
        match memchr(b'\n', &self.buf[at..self.end]) {
            Some(i) => at + i,
            None => self.end,
        }
    }

    /// Line number of the line starting at `at`; positions must not go backwards
    fn line_number(&mut self, at: usize) -> u64 {
        if at > self.cursor {
            self.cursor_line += memchr_iter(b'\n', &self.buf[self.cursor..at]).count() as u64;
            self.cursor = at;
        }
        self.cursor_line
    }

    fn text(&self, start: usize, end: usize) -> String {
        let line = &self.buf[start..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        String::from_utf8_lossy(line).into_owned()
    }

    fn before(
        &self,
        line_start: usize,
        line_no: u64,
        count: usize,
        tail: &VecDeque<(u64, String)>,
        lines: &mut LineMatches,
    ) {
        let mut cur = line_start;
        for i in 1..=count {
            if cur <= self.first {
                for (n, text) in tail.iter().rev().take(count - i + 1) {
                    lines.entry(*n).or_insert_with(|| text.clone());
                }
                break;
            }
            let prev_end = cur - 1;
            let prev_start = self.line_start(prev_end);
            lines
                .entry(line_no - i as u64)
                .or_insert_with(|| self.text(prev_start, prev_end));
            cur = prev_start;
        }
    }

    /// Record up to `count` lines after the match; returns how many ran past the chunk
    fn after(&self, line_end: usize, line_no: u64, count: usize, lines: &mut LineMatches) -> usize {
        let mut cur = line_end;
        for i in 1..=count {
            let next_start = cur + 1;
            if next_start >= self.end {
                return count - i + 1;
            }
            let next_end = self.line_end(next_start);
            lines
                .entry(line_no + i as u64)
                .or_insert_with(|| self.text(next_start, next_end));
            cur = next_end;
        }
        0
    }

    /// Emit the leading lines a match in an earlier chunk still wants
    fn owed_after(&self, owed: &mut usize, lines: &mut LineMatches) {
        let mut cur = self.first;
        let mut line_no = self.cursor_line;
        while *owed > 0 && cur < self.end {
            let end = self.line_end(cur);
            lines.entry(line_no).or_insert_with(|| self.text(cur, end));
            *owed -= 1;
            line_no += 1;
            cur = end + 1;
        }
    }

    /// Append the last `count` lines of this chunk to `tail`, keeping at most `count`
    fn keep_tail(&self, count: usize, next_line: u64, tail: &mut VecDeque<(u64, String)>) {
        let mut kept = Vec::with_capacity(count);
        let mut end = self.end;
        let mut line_no = next_line;
        while kept.len() < count && end > self.first {
            let newline = end - 1;
            let start = self.line_start(newline);
            line_no -= 1;
            kept.push((line_no, self.text(start, newline)));
            end = start;
        }
        tail.extend(kept.into_iter().rev());
        while tail.len() > count {
            tail.pop_front();
        }
    }
}
