use yrs::OffsetKind;

/// One contiguous replacement turning a previous text into the next one.
/// Positions and lengths count chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub index: usize,
    pub remove: usize,
    pub insert: String,
}

impl TextEdit {
    pub fn is_noop(&self) -> bool {
        self.remove == 0 && self.insert.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out: String = text.chars().take(self.index).collect();
        out.push_str(&self.insert);
        out.extend(text.chars().skip(self.index + self.remove));
        out
    }

    /// Start and length of the removed range of `prev`, in the units the
    /// replica text type uses.
    pub fn replica_range(&self, prev: &str, kind: &OffsetKind) -> (u32, u32) {
        let start = unit_len(prev.chars().take(self.index), kind);
        let len = unit_len(prev.chars().skip(self.index).take(self.remove), kind);
        (start, len)
    }
}

/// Length of a char run in replica units.
pub fn unit_len(chars: impl Iterator<Item = char>, kind: &OffsetKind) -> u32 {
    let len: usize = match kind {
        OffsetKind::Utf16 => chars.map(char::len_utf16).sum(),
        _ => chars.map(char::len_utf8).sum(),
    };
    len as u32
}

/// Computes a single edit from `prev` to `next`.
///
/// The common prefix is first grown only up to `bias` (usually the caret),
/// then the common suffix, then the prefix again without the bias limit.
/// With repeated characters this places the edit next to the caret.
pub fn diff(prev: &str, next: &str, bias: usize) -> TextEdit {
    let a: Vec<char> = prev.chars().collect();
    let b: Vec<char> = next.chars().collect();

    let mut left = 0;
    while left < a.len() && left < b.len() && a[left] == b[left] && left < bias {
        left += 1;
    }
    let mut right = 0;
    while right + left < a.len() && right + left < b.len() && a[a.len() - right - 1] == b[b.len() - right - 1] {
        right += 1;
    }
    while right + left < a.len() && right + left < b.len() && a[left] == b[left] {
        left += 1;
    }

    TextEdit {
        index: left,
        remove: a.len() - left - right,
        insert: b[left..b.len() - right].iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_replacement() {
        let edit = diff("Hello world", "Hello metaverse", 15);
        assert_eq!(edit, TextEdit { index: 6, remove: 5, insert: "metaverse".into() });
        assert_eq!(edit.apply("Hello world"), "Hello metaverse");
    }

    #[test]
    fn test_equal_texts_yield_noop() {
        let edit = diff("same", "same", 2);
        assert!(edit.is_noop());
    }

    #[test]
    fn test_bias_picks_position_in_repeated_run() {
        // Typing one more "a" with the caret after the first char.
        assert_eq!(diff("aaa", "aaaa", 1).index, 1);
        // Without a caret the insertion lands at the end.
        assert_eq!(diff("aaa", "aaaa", 4).index, 3);
    }

    #[test]
    fn test_deletion_before_bias() {
        let edit = diff("abcdef", "abef", 2);
        assert_eq!(edit, TextEdit { index: 2, remove: 2, insert: String::new() });
    }

    #[test]
    fn test_replica_range_units() {
        let edit = diff("héllo wörld", "héllo", 5);
        assert_eq!(edit.index, 5);
        assert_eq!(edit.replica_range("héllo wörld", &OffsetKind::Bytes), (6, 7));
        assert_eq!(edit.replica_range("héllo wörld", &OffsetKind::Utf16), (5, 6));
    }

    #[test]
    fn test_multibyte_apply() {
        let edit = diff("日本語", "日本の語", 2);
        assert_eq!(edit.apply("日本語"), "日本の語");
    }
}
