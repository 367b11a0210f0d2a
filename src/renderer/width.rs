use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Display width of `s` in terminal columns. East-asian ambiguous
/// characters count as `ambiwidth` columns (1 or 2).
pub fn strwidth(s: &str, ambiwidth: usize) -> usize {
    if ambiwidth >= 2 {
        UnicodeWidthStr::width_cjk(s)
    } else {
        UnicodeWidthStr::width(s)
    }
}

/// Width of a single character; control characters count as zero.
pub fn charwidth(c: char, ambiwidth: usize) -> usize {
    let width = if ambiwidth >= 2 {
        UnicodeWidthChar::width_cjk(c)
    } else {
        UnicodeWidthChar::width(c)
    };
    width.unwrap_or(0)
}

/// Longest suffix of `s` that fits in `columns`.
pub fn tail_fitting(s: &str, columns: usize, ambiwidth: usize) -> &str {
    let mut used = 0;
    let mut start = s.len();
    for (index, c) in s.char_indices().rev() {
        let w = charwidth(c, ambiwidth);
        if used + w > columns {
            break;
        }
        used += w;
        start = index;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_and_ambiguous_characters() {
        assert_eq!(strwidth("abc", 1), 3);
        assert_eq!(strwidth("日本", 1), 4);
        // U+2026 HORIZONTAL ELLIPSIS is east-asian ambiguous.
        assert_eq!(strwidth("\u{2026}", 1), 1);
        assert_eq!(strwidth("\u{2026}", 2), 2);
    }

    #[test]
    fn test_tail_fitting() {
        assert_eq!(tail_fitting("abcdef", 3, 1), "def");
        assert_eq!(tail_fitting("a日本", 3, 1), "本");
        assert_eq!(tail_fitting("abc", 10, 1), "abc");
        assert_eq!(tail_fitting("abc", 0, 1), "");
    }
}
