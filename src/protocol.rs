//! Tokenization helpers for the line-oriented kit protocol.
//!
//! Kit frames are a first line of space-separated tokens, optionally
//! followed by a binary payload. Tokens are either bare words
//! (`tilecombine:`) or `name=value` pairs (`part=0`).

/// The first line of a frame, without the trailing newline.
pub fn first_line(payload: &[u8]) -> &str {
    let end = payload
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).unwrap_or("")
}

/// The first whitespace-delimited token of a line.
pub fn first_token(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

/// Split a token of the form `name<sep>value` (e.g. `client-all`).
pub fn parse_name_value(token: &str, sep: char) -> Option<(&str, &str)> {
    let idx = token.find(sep)?;
    Some((&token[..idx], &token[idx + sep.len_utf8()..]))
}

/// Look up `name=value` among a line's tokens and return the value.
pub fn token_string<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.split_whitespace().find_map(|tok| {
        let (n, v) = parse_name_value(tok, '=')?;
        (n == name).then_some(v)
    })
}

/// Look up `name=value` and parse the value as an integer.
pub fn token_i64(line: &str, name: &str) -> Option<i64> {
    token_string(line, name)?.parse().ok()
}
