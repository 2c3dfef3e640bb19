//! Redis-style glob matching for channel names.
//!
//! Supported syntax: `*` (any run), `?` (one byte), `[abc]`, `[^abc]`,
//! `[a-z]` and `\` to escape the next byte.

/// Check whether `channel` matches the glob `pattern`.
#[must_use]
pub fn glob_match(pattern: &str, channel: &str) -> bool {
    matches(pattern.as_bytes(), channel.as_bytes())
}

fn matches(mut p: &[u8], mut s: &[u8]) -> bool {
    while let Some(&c) = p.first() {
        match c {
            b'*' => {
                while p.first() == Some(&b'*') {
                    p = &p[1..];
                }
                if p.is_empty() {
                    return true;
                }
                return (0..=s.len()).any(|i| matches(p, &s[i..]));
            }
            b'?' => {
                if s.is_empty() {
                    return false;
                }
                p = &p[1..];
                s = &s[1..];
            }
            b'[' => {
                let Some((&byte, rest)) = s.split_first() else {
                    return false;
                };
                let (matched, after) = match_class(&p[1..], byte);
                if !matched {
                    return false;
                }
                p = after;
                s = rest;
            }
            b'\\' if p.len() >= 2 => {
                if s.first() != Some(&p[1]) {
                    return false;
                }
                p = &p[2..];
                s = &s[1..];
            }
            _ => {
                if s.first() != Some(&c) {
                    return false;
                }
                p = &p[1..];
                s = &s[1..];
            }
        }
    }
    s.is_empty()
}

/// Match one byte against a `[...]` class. `p` starts after the `[`.
///
/// Returns whether it matched and the pattern remaining after the class.
/// An unterminated class runs to the end of the pattern.
fn match_class(mut p: &[u8], byte: u8) -> (bool, &[u8]) {
    let negate = p.first() == Some(&b'^');
    if negate {
        p = &p[1..];
    }

    let mut matched = false;
    loop {
        match p {
            [] => break,
            [b']', rest @ ..] => {
                p = rest;
                break;
            }
            [b'\\', escaped, rest @ ..] => {
                matched |= *escaped == byte;
                p = rest;
            }
            [lo, b'-', hi, rest @ ..] => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                matched |= (lo..=hi).contains(&byte);
                p = rest;
            }
            [other, rest @ ..] => {
                matched |= *other == byte;
                p = rest;
            }
        }
    }

    (matched != negate, p)
}
