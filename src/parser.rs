//! Grammar for a single `INFO` line: `KEY="VALUE"`.
//!
//! One call to [`info_line`] consumes exactly one line (including its
//! trailing newline); the caller is responsible for skipping blank lines and
//! stopping at end of input. Kept as a small nom combinator pipeline in the
//! same style as a control-file parser: verify the key shape, match the
//! quoted value, and hand back borrowed slices so the SPK reader can decide
//! how to interpret each key without an extra allocation pass.

use nom::{
    bytes::complete::{tag, take_until},
    character::complete::char,
    combinator::verify,
    sequence::{separated_pair, terminated},
    IResult, Parser,
};

#[inline]
fn key_name(input: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(take_until("="), |input: &[u8]| {
        !input.is_empty() && input.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_')
    })
    .parse(input)
}

#[inline]
fn quoted_value(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, _) = char('"').parse(input)?;
    let (input, value) = take_until("\"")(input)?;
    let (input, _) = char('"').parse(input)?;
    Ok((input, value))
}

#[inline]
fn key_value(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    separated_pair(key_name, char('='), quoted_value).parse(input)
}

/// Parses one `KEY="VALUE"` line, consuming its trailing `\n` if present.
pub fn info_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    terminated(key_value, nom::combinator::opt(tag("\n"))).parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_name() {
        let test = &b"package=\"zsync\""[..];
        assert_eq!(key_name(test), Ok((&b"=\"zsync\""[..], &b"package"[..])));
    }

    #[test]
    fn test_key_name_rejects_non_alnum() {
        assert!(key_name(&b"dis-play=\"x\""[..]).is_err());
    }

    #[test]
    fn test_quoted_value() {
        assert_eq!(
            quoted_value(&b"\"hello world\""[..]),
            Ok((&b""[..], &b"hello world"[..]))
        );
    }

    #[test]
    fn test_quoted_value_empty() {
        assert_eq!(quoted_value(&b"\"\""[..]), Ok((&b""[..], &b""[..])));
    }

    #[test]
    fn test_key_value() {
        assert_eq!(
            key_value(&b"version=\"1.0-1\""[..]),
            Ok((&b""[..], (&b"version"[..], &b"1.0-1"[..])))
        );
    }

    #[test]
    fn test_info_line_with_newline() {
        assert_eq!(
            info_line(&b"arch=\"88f6281\"\nmore"[..]),
            Ok((&b"more"[..], (&b"arch"[..], &b"88f6281"[..])))
        );
    }

    #[test]
    fn test_info_line_without_trailing_newline() {
        assert_eq!(
            info_line(&b"arch=\"88f6281\""[..]),
            Ok((&b""[..], (&b"arch"[..], &b"88f6281"[..])))
        );
    }

    #[test]
    fn test_info_line_rejects_unquoted() {
        assert!(info_line(&b"arch=88f6281\n"[..]).is_err());
    }
}
