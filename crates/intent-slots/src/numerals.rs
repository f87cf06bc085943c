//! Chinese / Arabic numeral parsing for counts inside queries ("三个月", "12天").

/// Parse an Arabic numeral (any `u32`) or a simple Chinese numeral (up to 99).
///
/// Supports 一..九, 两, 十, 二十, 十五, 二十三 and plain digits.
pub fn parse_count(s: &str) -> Option<u32> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(n) = s.parse::<u32>() {
        return Some(n);
    }

    let chars: Vec<char> = s.chars().collect();
    match chars.as_slice() {
        [c] => digit(*c).or(if *c == '十' { Some(10) } else { None }),
        ['十', c] => digit(*c).map(|d| 10 + d),
        [c, '十'] => digit(*c).map(|d| d * 10),
        [a, '十', b] => Some(digit(*a)? * 10 + digit(*b)?),
        _ => None,
    }
}

fn digit(c: char) -> Option<u32> {
    Some(match c {
        '零' => 0,
        '一' => 1,
        '二' | '两' => 2,
        '三' => 3,
        '四' => 4,
        '五' => 5,
        '六' => 6,
        '七' => 7,
        '八' => 8,
        '九' => 9,
        _ => return None,
    })
}

/// Format a numeric value the way it was most likely written.
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arabic_digits() {
        assert_eq!(parse_count("7"), Some(7));
        assert_eq!(parse_count("30"), Some(30));
    }

    #[test]
    fn chinese_units() {
        assert_eq!(parse_count("三"), Some(3));
        assert_eq!(parse_count("两"), Some(2));
        assert_eq!(parse_count("十"), Some(10));
        assert_eq!(parse_count("十五"), Some(15));
        assert_eq!(parse_count("二十"), Some(20));
        assert_eq!(parse_count("二十三"), Some(23));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("几"), None);
        assert_eq!(parse_count("一百"), None);
    }

    #[test]
    fn formats_integers_without_fraction() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(2.5), "2.5");
    }
}
