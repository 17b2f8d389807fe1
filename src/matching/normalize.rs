// src/matching/normalize.rs
//
// Canonicalization of free-text wholesale names for comparison. Deterministic,
// pure, no I/O; empty input yields an empty string.

/// Packaging synonyms canonicalized to their long form, e.g. "硬" -> "硬盒".
/// Collapsing the long form first keeps the substitution idempotent.
const PACKAGE_SYNONYMS: [(&str, &str); 2] = [("硬", "硬盒"), ("软", "软盒")];

/// CJK ideograph ranges retained by normalization (URO + extension A).
fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

/// Strips brackets, punctuation and whitespace, lowercases, and retains only
/// CJK ideographs, Latin letters and digits.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter_map(|c| {
            if is_cjk(c) {
                Some(c)
            } else if c.is_ascii_alphanumeric() {
                Some(c.to_ascii_lowercase())
            } else {
                None
            }
        })
        .collect()
}

/// `normalize` plus synonym substitution and CJK numeral conversion.
pub fn deep_normalize(text: &str) -> String {
    let mut s = normalize(text);
    s = convert_cjk_numerals(&s);
    for (short, full) in PACKAGE_SYNONYMS {
        // Collapse the canonical form first so "硬盒" does not become "硬盒盒".
        s = s.replace(full, short).replace(short, full);
    }
    s
}

/// Per-character CJK numeral conversion; no positional arithmetic by design
/// (lightweight normalization only).
fn convert_cjk_numerals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '零' | '〇' => out.push('0'),
            '一' => out.push('1'),
            '二' => out.push('2'),
            '三' => out.push('3'),
            '四' => out.push('4'),
            '五' => out.push('5'),
            '六' => out.push('6'),
            '七' => out.push('7'),
            '八' => out.push('8'),
            '九' => out.push('9'),
            '十' => out.push_str("10"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_brackets_and_punctuation() {
        assert_eq!(normalize("中华(软盒)"), "中华软盒");
        assert_eq!(normalize("  黄鹤楼 - 1916 / 硬 "), "黄鹤楼1916硬");
        assert_eq!(normalize("Marlboro (Red)!"), "marlborored");
    }

    #[test]
    fn test_normalize_lowercases_latin() {
        assert_eq!(normalize("ABC123"), "abc123");
    }

    #[test]
    fn test_normalize_empty_input() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("()（）【】"), "");
    }

    #[test]
    fn test_normalize_idempotent() {
        for input in ["中华(软盒)", "玉溪 硬", "Marlboro Lights 100s", "", "！@#￥"] {
            let once = normalize(input);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_deep_normalize_package_synonyms() {
        assert_eq!(deep_normalize("中华(软)"), "中华软盒");
        assert_eq!(deep_normalize("中华(软盒)"), "中华软盒");
        assert_eq!(deep_normalize("玉溪硬"), "玉溪硬盒");
    }

    #[test]
    fn test_deep_normalize_cjk_numerals() {
        assert_eq!(deep_normalize("红塔山一九五六"), "红塔山1956");
        assert_eq!(deep_normalize("五粮液"), "5粮液");
    }

    #[test]
    fn test_deep_normalize_idempotent() {
        for input in ["中华(软)", "红塔山一九五六", "玉溪硬", "七匹狼(白)"] {
            let once = deep_normalize(input);
            assert_eq!(deep_normalize(&once), once);
        }
    }
}
