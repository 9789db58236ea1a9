/// A trigram packed into the low 24 bits of a u32
pub type Trigram = u32;

#[inline]
pub fn bytes_to_trigram(b0: u8, b1: u8, b2: u8) -> Trigram {
    ((b0 as u32) << 16) | ((b1 as u32) << 8) | (b2 as u32)
}

/// Bitset over the whole 24-bit trigram space (2MB).
/// Cheaper than hashing for deduplicating large files.
struct TrigramBitset {
    bits: Vec<u64>,
}

impl TrigramBitset {
    fn new() -> Self {
        Self {
            bits: vec![0u64; 1 << 18],
        }
    }

    #[inline]
    fn insert(&mut self, trigram: Trigram) {
        self.bits[(trigram >> 6) as usize] |= 1u64 << (trigram & 63);
    }

    fn collect(&self) -> Vec<Trigram> {
        let mut result = Vec::with_capacity(8192);
        for (word_idx, &word) in self.bits.iter().enumerate() {
            let base = (word_idx as u32) << 6;
            let mut w = word;
            while w != 0 {
                result.push(base | w.trailing_zeros());
                w &= w - 1;
            }
        }
        result
    }
}

/// Unique trigrams of `content`, sorted.
pub fn extract_trigrams(content: &[u8]) -> Vec<Trigram> {
    extract_trigrams_multi(&[content])
}

/// Unique trigrams across several byte views of the same file, sorted.
pub fn extract_trigrams_multi(views: &[&[u8]]) -> Vec<Trigram> {
    let total: usize = views.iter().map(|v| v.len()).sum();

    // small inputs: sort + dedup is more cache-friendly than the bitset
    if total < 4096 {
        let mut trigrams: Vec<Trigram> = views
            .iter()
            .flat_map(|v| v.windows(3))
            .map(|w| bytes_to_trigram(w[0], w[1], w[2]))
            .collect();
        trigrams.sort_unstable();
        trigrams.dedup();
        return trigrams;
    }

    let mut bitset = TrigramBitset::new();
    for view in views {
        for w in view.windows(3) {
            bitset.insert(bytes_to_trigram(w[0], w[1], w[2]));
        }
    }
    bitset.collect()
}

/// Case fold used for the index's second trigram view.
///
/// ASCII letters lowercase; the two non-ASCII code points whose simple case
/// fold lands in ASCII (long s and the Kelvin sign) map to it. Everything
/// else is kept, so a fold class only narrows when it is purely ASCII.
#[inline]
pub fn fold_char(c: char) -> char {
    match c {
        'A'..='Z' => c.to_ascii_lowercase(),
        '\u{017F}' => 's',
        '\u{212A}' => 'k',
        _ => c,
    }
}

/// Folded copy of `content`, or `None` when folding changes nothing
pub fn fold_content(content: &[u8]) -> Option<Vec<u8>> {
    let text = String::from_utf8_lossy(content);
    let needs_fold = text
        .chars()
        .any(|c| c.is_ascii_uppercase() || c == '\u{017F}' || c == '\u{212A}');
    if !needs_fold {
        return None;
    }
    Some(text.chars().map(fold_char).collect::<String>().into_bytes())
}

/// Check if content is likely binary
pub fn is_binary(content: &[u8]) -> bool {
    let sample_size = content.len().min(8192);
    let sample = &content[..sample_size];

    if memchr::memchr(0, sample).is_some() {
        return true;
    }

    let non_text_count = sample
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t' && b != 0x0c)
        .count();

    non_text_count > sample_size / 8
}
