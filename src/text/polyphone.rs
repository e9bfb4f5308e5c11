//! Word-level readings for characters with more than one pronunciation.
//!
//! The per-character default from the `pinyin` crate is only right for the
//! most frequent reading; inside these words the other reading applies.
//! Readings are TONE3 with `v` for ü and no digit for the neutral tone,
//! before tone sandhi.

use std::collections::HashMap;

const PHRASES: &[(&str, &str)] = &[
    // 行
    ("银行", "yin2 hang2"),
    ("银行家", "yin2 hang2 jia1"),
    ("行业", "hang2 ye4"),
    ("行列", "hang2 lie4"),
    ("排行", "pai2 hang2"),
    ("内行", "nei4 hang2"),
    ("外行", "wai4 hang2"),
    // 乐
    ("音乐", "yin1 yue4"),
    ("音乐会", "yin1 yue4 hui4"),
    ("乐器", "yue4 qi4"),
    ("乐队", "yue4 dui4"),
    ("乐曲", "yue4 qu3"),
    ("快乐", "kuai4 le4"),
    // 长
    ("长大", "zhang3 da4"),
    ("成长", "cheng2 zhang3"),
    ("校长", "xiao4 zhang3"),
    ("家长", "jia1 zhang3"),
    ("部长", "bu4 zhang3"),
    ("处长", "chu4 zhang3"),
    ("长城", "chang2 cheng2"),
    ("长期", "chang2 qi1"),
    ("长度", "chang2 du4"),
    ("长江", "chang2 jiang1"),
    ("长短", "chang2 duan3"),
    ("长久", "chang2 jiu3"),
    // 重
    ("重新", "chong2 xin1"),
    ("重复", "chong2 fu4"),
    ("重庆", "chong2 qing4"),
    ("重要", "zhong4 yao4"),
    // 还
    ("还有", "hai2 you3"),
    ("还是", "hai2 shi4"),
    ("还钱", "huan2 qian2"),
    ("归还", "gui1 huan2"),
    // 了 得 地 的
    ("了解", "liao3 jie3"),
    ("为了", "wei4 le"),
    ("得到", "de2 dao4"),
    ("获得", "huo4 de2"),
    ("觉得", "jue2 de"),
    ("地方", "di4 fang1"),
    ("土地", "tu3 di4"),
    ("地球", "di4 qiu2"),
    ("的确", "di2 que4"),
    ("目的", "mu4 di4"),
    // 都 发 觉
    ("首都", "shou3 du1"),
    ("都市", "du1 shi4"),
    ("头发", "tou2 fa4"),
    ("理发", "li3 fa4"),
    ("发现", "fa1 xian4"),
    ("睡觉", "shui4 jiao4"),
    // 为
    ("因为", "yin1 wei4"),
    ("作为", "zuo4 wei2"),
    ("认为", "ren4 wei2"),
    ("成为", "cheng2 wei2"),
    ("以为", "yi3 wei2"),
    // 差 好 当 调 种 着 少 朝 传 角 率 省 藏 数
    ("出差", "chu1 chai1"),
    ("差不多", "cha4 bu4 duo1"),
    ("爱好", "ai4 hao4"),
    ("好奇", "hao4 qi2"),
    ("当作", "dang4 zuo4"),
    ("上当", "shang4 dang4"),
    ("调查", "diao4 cha2"),
    ("声调", "sheng1 diao4"),
    ("种植", "zhong4 zhi2"),
    ("着急", "zhao2 ji2"),
    ("少年", "shao4 nian2"),
    ("朝阳", "zhao1 yang2"),
    ("朝代", "chao2 dai4"),
    ("传记", "zhuan4 ji4"),
    ("角色", "jue2 se4"),
    ("效率", "xiao4 lv4"),
    ("反省", "fan3 xing3"),
    ("西藏", "xi1 zang4"),
    ("数学", "shu4 xue2"),
    // 处 应 空 干 教 尽 几 会
    ("处理", "chu3 li3"),
    ("到处", "dao4 chu4"),
    ("应该", "ying1 gai1"),
    ("应用", "ying4 yong4"),
    ("空间", "kong1 jian1"),
    ("空闲", "kong4 xian2"),
    ("干净", "gan1 jing4"),
    ("干部", "gan4 bu4"),
    ("教室", "jiao4 shi4"),
    ("教书", "jiao1 shu1"),
    ("尽管", "jin3 guan3"),
    ("尽力", "jin4 li4"),
    ("几乎", "ji1 hu1"),
    ("会计", "kuai4 ji4"),
];

/// Multi-reading words, matched longest first inside a segmented word.
pub struct PhraseTable {
    readings: HashMap<&'static str, Vec<&'static str>>,
    longest: usize,
}

impl std::fmt::Debug for PhraseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhraseTable")
            .field("phrases", &self.readings.len())
            .finish()
    }
}

impl Default for PhraseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PhraseTable {
    pub fn new() -> Self {
        let readings: HashMap<_, Vec<_>> = PHRASES
            .iter()
            .map(|&(word, pinyin)| (word, pinyin.split(' ').collect()))
            .collect();
        let longest = PHRASES
            .iter()
            .map(|(word, _)| word.chars().count())
            .max()
            .unwrap_or(0);
        Self { readings, longest }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Longest phrase that `text` starts with: its length in bytes and its
    /// readings, one per character.
    pub fn longest_prefix(&self, text: &str) -> Option<(usize, &[&'static str])> {
        let ends: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .skip(2)
            .chain(std::iter::once(text.len()))
            .take(self.longest.saturating_sub(1))
            .collect();
        ends.into_iter().rev().find_map(|end| {
            self.readings
                .get(&text[..end])
                .map(|readings| (end, readings.as_slice()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_reading_per_character() {
        for (word, pinyin) in PHRASES {
            let syllables: Vec<&str> = pinyin.split(' ').collect();
            assert_eq!(syllables.len(), word.chars().count(), "{word}");
            for syllable in syllables {
                let base = syllable.trim_end_matches(|c: char| ('1'..='4').contains(&c));
                assert!(
                    !base.is_empty() && base.chars().all(|c| c.is_ascii_lowercase()),
                    "{word}: {syllable}"
                );
            }
        }
    }

    #[test]
    fn no_duplicate_words() {
        assert_eq!(PhraseTable::new().len(), PHRASES.len());
    }

    #[test]
    fn prefers_longest_match() {
        let table = PhraseTable::new();
        let (len, readings) = table.longest_prefix("音乐会很好").unwrap();
        assert_eq!(len, "音乐会".len());
        assert_eq!(readings, ["yin1", "yue4", "hui4"]);
        let (len, readings) = table.longest_prefix("银行卡").unwrap();
        assert_eq!(len, "银行".len());
        assert_eq!(readings, ["yin2", "hang2"]);
    }

    #[test]
    fn single_characters_never_match() {
        let table = PhraseTable::new();
        assert!(table.longest_prefix("行").is_none());
        assert!(table.longest_prefix("").is_none());
        assert!(table.longest_prefix("你好").is_none());
    }
}
