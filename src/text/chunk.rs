//! Sentence splitting and byte-bounded chunk packing.

const ASCII_BREAKS: &[char] = &[';', ':', ',', '.', '!', '?'];
const FULL_WIDTH_BREAKS: &[char] = &['；', '：', '，', '。', '！', '？'];

/// Split after ASCII punctuation followed by whitespace (the whitespace is
/// dropped) and directly after full-width punctuation.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let end = i + c.len_utf8();
        if FULL_WIDTH_BREAKS.contains(&c) {
            sentences.push(&text[start..end]);
            start = end;
        } else if ASCII_BREAKS.contains(&c)
            && chars.peek().is_some_and(|(_, next)| next.is_whitespace())
        {
            sentences.push(&text[start..end]);
            start = end;
            while let Some((j, next)) = chars.peek().copied() {
                if !next.is_whitespace() {
                    break;
                }
                start = j + next.len_utf8();
                chars.next();
            }
        }
    }
    sentences.push(&text[start..]);
    sentences.retain(|s| !s.is_empty());
    sentences
}

/// Appends a sentence, followed by a space when it ends in a single-byte
/// character.
fn push_sentence(chunk: &mut String, sentence: &str) {
    chunk.push_str(sentence);
    if sentence.chars().last().is_some_and(|c| c.len_utf8() == 1) {
        chunk.push(' ');
    }
}

/// Greedily pack sentences into chunks of at most `max_chars` UTF-8 bytes.
///
/// A sentence longer than `max_chars` on its own becomes a single oversize
/// chunk.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        if current.len() + sentence.len() > max_chars && !current.is_empty() {
            chunks.push(current.trim().to_string());
            current.clear();
        }
        push_sentence(&mut current, sentence);
    }
    if !current.is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_punctuation_and_whitespace() {
        assert_eq!(
            split_sentences("Hi there. How are you?  Fine,thanks"),
            vec!["Hi there.", "How are you?", "Fine,thanks"]
        );
        assert_eq!(split_sentences("你好。我很好！"), vec!["你好。", "我很好！"]);
    }

    #[test]
    fn chunks_respect_byte_bound() {
        let text = "The quick brown fox. Jumps over the lazy dog! \
                    Again and again, it jumps. 然后它休息了。再次跳跃！";
        let max_chars = 30;
        let chunks = chunk_text(text, max_chars);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= max_chars, "{chunk:?} is {} bytes", chunk.len());
            assert_eq!(chunk, chunk.trim());
        }
    }

    #[test]
    fn sentences_joined_with_space() {
        assert_eq!(chunk_text("One. Two.", 100), vec!["One. Two."]);
    }

    #[test]
    fn oversize_sentence_stands_alone() {
        let chunks = chunk_text("Short. This sentence is far too long to fit.", 10);
        assert_eq!(chunks, vec!["Short.", "This sentence is far too long to fit."]);
    }

    #[test]
    fn unsplittable_text_is_one_chunk() {
        let text = "Hello,I'm Aurora.And nice to meet you.";
        assert_eq!(chunk_text(text, 135), vec![text]);
    }
}
