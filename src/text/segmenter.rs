//! jieba segmentation + TONE3 pinyin romanisation.

use jieba_rs::Jieba;
use pinyin::ToPinyin;

use super::polyphone::PhraseTable;

/// Characters the romaniser treats as Chinese: Bopomofo through CJK
/// Unified Ideographs.
pub fn is_chinese(c: char) -> bool {
    ('\u{3100}'..='\u{9fff}').contains(&c)
}

/// Punctuation rewrites applied before segmentation.
fn translate(c: char) -> char {
    match c {
        ';' => ',',
        '\u{201c}' | '\u{201d}' => '"',
        '\u{2018}' | '\u{2019}' => '\'',
        other => other,
    }
}

/// Holds the jieba dictionary and the multi-reading word table. Build one
/// and share it; loading the dictionary is the expensive part.
pub struct TextSegmenter {
    jieba: Jieba,
    phrases: PhraseTable,
}

impl std::fmt::Debug for TextSegmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextSegmenter").finish_non_exhaustive()
    }
}

impl Default for TextSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl TextSegmenter {
    pub fn new() -> Self {
        let jieba = Jieba::new();
        let phrases = PhraseTable::new();
        tracing::debug!(phrases = phrases.len(), "jieba dictionary loaded");
        Self { jieba, phrases }
    }

    /// Turn each text into a token list: ASCII passes through per char,
    /// Chinese characters become ` ` + TONE3 pinyin, anything else passes
    /// through unchanged.
    pub fn convert_char_to_pinyin<S: AsRef<str>>(&self, texts: &[S]) -> Vec<Vec<String>> {
        texts.iter().map(|t| self.convert(t.as_ref())).collect()
    }

    fn convert(&self, text: &str) -> Vec<String> {
        let text: String = text.chars().map(translate).collect();
        let mut out: Vec<String> = Vec::new();

        for seg in self.jieba.cut(&text, true) {
            let chars = seg.chars().count();
            if seg.len() == chars {
                let after_separator = out
                    .last()
                    .is_some_and(|last| matches!(last.as_str(), " " | ":" | "'" | "\""));
                if !out.is_empty() && seg.len() > 1 && !after_separator {
                    out.push(" ".to_string());
                }
                out.extend(seg.chars().map(String::from));
            } else if seg.len() == 3 * chars {
                let syllables = segment_pinyin(seg, &self.phrases);
                for (c, syllable) in seg.chars().zip(syllables) {
                    if is_chinese(c) {
                        out.push(" ".to_string());
                    }
                    out.push(syllable);
                }
            } else {
                for c in seg.chars() {
                    if (c as u32) < 256 {
                        out.push(c.to_string());
                    } else if is_chinese(c) {
                        out.push(" ".to_string());
                        out.push(char_pinyin(c));
                    } else {
                        out.push(c.to_string());
                    }
                }
            }
        }
        out
    }
}

/// TONE3 syllable for a single character, ü spelled `v`, or the character
/// itself when it has no reading.
fn char_pinyin(c: char) -> String {
    match c.to_pinyin() {
        Some(p) => p.with_tone_num_end().replace('ü', "v"),
        None => c.to_string(),
    }
}

/// Tone digit of a TONE3 syllable (5 for neutral / unmarked).
fn tone_of(syllable: &str) -> u8 {
    match syllable.as_bytes().last() {
        Some(b @ b'1'..=b'4') => b - b'0',
        _ => 5,
    }
}

fn with_tone(syllable: &str, tone: u8) -> String {
    let base = syllable.trim_end_matches(|c: char| c.is_ascii_digit());
    format!("{base}{tone}")
}

/// Per-character TONE3 readings of one word with tone sandhi applied:
/// runs of third tones lift all but the last to second tone, and 不 / 一
/// take second tone before a fourth tone (一 takes fourth tone before the
/// other tones).
///
/// Multi-reading words in `phrases` override the per-character default.
fn segment_pinyin(word: &str, phrases: &PhraseTable) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    let mut syllables: Vec<String> = Vec::with_capacity(chars.len());
    let mut rest = word;
    while let Some(c) = rest.chars().next() {
        let consumed = match phrases.longest_prefix(rest) {
            Some((len, readings)) => {
                syllables.extend(readings.iter().map(|r| r.to_string()));
                len
            }
            None => {
                syllables.push(char_pinyin(c));
                c.len_utf8()
            }
        };
        rest = &rest[consumed..];
    }
    let tones: Vec<Option<u8>> = chars
        .iter()
        .zip(&syllables)
        .map(|(&c, s)| is_chinese(c).then(|| tone_of(s)))
        .collect();

    let mut run_start = None;
    for i in 0..=tones.len() {
        let third = tones.get(i).copied().flatten() == Some(3);
        match (third, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                for syllable in &mut syllables[start..i.saturating_sub(1)] {
                    *syllable = with_tone(syllable, 2);
                }
                run_start = None;
            }
            _ => {}
        }
    }

    for i in 0..chars.len().saturating_sub(1) {
        let Some(next) = tones[i + 1] else { continue };
        match chars[i] {
            '不' if next == 4 => syllables[i] = with_tone(&syllables[i], 2),
            '一' if next == 4 => syllables[i] = with_tone(&syllables[i], 2),
            '一' if next != 5 => syllables[i] = with_tone(&syllables[i], 4),
            _ => {}
        }
    }
    syllables
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(text: &str) -> Vec<String> {
        TextSegmenter::new().convert_char_to_pinyin(&[text]).remove(0)
    }

    #[test]
    fn ascii_passes_through_per_char() {
        let tokens = convert("hello world");
        assert_eq!(tokens.concat(), "hello world");
        assert_eq!(tokens.len(), 11);
    }

    #[test]
    fn semicolon_and_curly_quotes_translated() {
        let tokens = convert("a;b \u{201c}c\u{201d}");
        let joined = tokens.concat();
        assert!(joined.contains(','));
        assert!(!joined.contains(';'));
        assert!(joined.contains('"'));
        assert!(!joined.contains('\u{201c}'));
    }

    #[test]
    fn chinese_gets_space_and_tone3() {
        let tokens = convert("中国");
        assert_eq!(tokens, vec![" ", "zhong1", " ", "guo2"]);
    }

    fn word(text: &str) -> Vec<String> {
        segment_pinyin(text, &PhraseTable::new())
    }

    #[test]
    fn third_tone_sandhi() {
        assert_eq!(word("你好"), vec!["ni2", "hao3"]);
    }

    #[test]
    fn bu_before_fourth_tone() {
        assert_eq!(word("不是"), vec!["bu2", "shi4"]);
    }

    #[test]
    fn umlaut_spelled_v() {
        assert_eq!(convert("女"), vec![" ", "nv3"]);
        assert_eq!(convert("绿"), vec![" ", "lv4"]);
        for text in ["绿色", "旅行", "律师"] {
            assert!(convert(text).iter().all(|t| !t.contains('ü')), "{text}");
        }
    }

    #[test]
    fn word_level_readings() {
        assert_eq!(convert("银行"), vec![" ", "yin2", " ", "hang2"]);
        assert_eq!(convert("音乐"), vec![" ", "yin1", " ", "yue4"]);
        assert_eq!(word("长大"), vec!["zhang3", "da4"]);
        assert_eq!(word("长城"), vec!["chang2", "cheng2"]);
        assert_eq!(word("重新"), vec!["chong2", "xin1"]);
        assert_eq!(word("效率"), vec!["xiao4", "lv4"]);
    }

    #[test]
    fn phrase_inside_longer_word() {
        assert_eq!(&word("中国银行")[2..], &["yin2", "hang2"]);
    }

    #[test]
    fn sandhi_applies_after_phrase_lookup() {
        assert_eq!(word("了解"), vec!["liao2", "jie3"]);
    }

    #[test]
    fn chinese_range() {
        assert!(is_chinese('中'));
        assert!(!is_chinese('a'));
        assert!(!is_chinese('，'));
    }
}
