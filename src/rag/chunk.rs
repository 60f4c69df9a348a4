/// Split `text` into overlapping word windows.
///
/// Consecutive chunks share `overlap` words. Chunking stops at the chunk that
/// reaches the last word, so there is never a trailing chunk made only of
/// overlap: 500 words with the default window give one chunk, not two.
/// Empty input yields no chunks.
pub fn chunk_words(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let window = window.max(1);
    let stride = window.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + window).min(words.len());
        let chunk = words[start..end].join(" ");
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        if end == words.len() {
            break;
        }
        start += stride;
    }
    chunks
}
