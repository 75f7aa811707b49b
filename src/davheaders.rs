//! Typed versions of the WebDAV request headers.
use std::convert::TryFrom;
use std::fmt::Display;
use std::str::FromStr;

use headers::Header;
use http::header::{HeaderName, HeaderValue};
use lazy_static::lazy_static;
use regex::Regex;

use crate::fs::DavMetaData;

lazy_static! {
    static ref RE_URL: Regex = Regex::new(r"https?://[^/]*([^#?]+).*$").unwrap();
    pub static ref DEPTH: HeaderName = HeaderName::from_static("depth");
    pub static ref TIMEOUT: HeaderName = HeaderName::from_static("timeout");
    pub static ref OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
    pub static ref DESTINATION: HeaderName = HeaderName::from_static("destination");
    pub static ref ETAG: HeaderName = HeaderName::from_static("etag");
    pub static ref IF_RANGE: HeaderName = HeaderName::from_static("if-range");
    pub static ref IF_MATCH: HeaderName = HeaderName::from_static("if-match");
    pub static ref IF_NONE_MATCH: HeaderName = HeaderName::from_static("if-none-match");
    pub static ref IF: HeaderName = HeaderName::from_static("if");
}

// helper.
fn one<'i, I>(values: &mut I) -> Result<&'i HeaderValue, headers::Error>
where I: Iterator<Item = &'i HeaderValue> {
    let v = values.next().ok_or_else(invalid)?;
    if values.next().is_some() {
        Err(invalid())
    } else {
        Ok(v)
    }
}

// helper
fn invalid() -> headers::Error {
    headers::Error::invalid()
}

// helper
fn map_invalid(_e: impl std::error::Error) -> headers::Error {
    headers::Error::invalid()
}

macro_rules! header {
    ($tname:ident, $hname:ident, $sname:expr) => {
        lazy_static! {
            pub static ref $hname: HeaderName = HeaderName::from_static($sname);
        }

        #[derive(Debug, Clone, PartialEq)]
        pub struct $tname(pub String);

        impl Header for $tname {
            fn name() -> &'static HeaderName {
                &$hname
            }

            fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
            where I: Iterator<Item = &'i HeaderValue> {
                one(values)?
                    .to_str()
                    .map(|x| $tname(x.to_owned()))
                    .map_err(map_invalid)
            }

            fn encode<E>(&self, values: &mut E)
            where E: Extend<HeaderValue> {
                let value = HeaderValue::from_str(&self.0).unwrap();
                values.extend(std::iter::once(value))
            }
        }
    };
}

header!(ContentType, CONTENT_TYPE, "content-type");
header!(ContentLocation, CONTENT_LOCATION, "content-location");
header!(LockToken, LOCK_TOKEN, "lock-token");
header!(XLitmus, X_LITMUS, "x-litmus");

/// Depth: header.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        let value = one(values)?;
        match value.as_bytes() {
            b"0" => Ok(Depth::Zero),
            b"1" => Ok(Depth::One),
            b"infinity" | b"Infinity" => Ok(Depth::Infinity),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        let value = match *self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "Infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// Timeout: header, "Second-nnn" or "Infinite".
#[derive(Debug, Clone, PartialEq)]
pub enum DavTimeout {
    Seconds(u32),
    Infinite,
}

#[derive(Debug, Clone)]
pub struct Timeout(pub Vec<DavTimeout>);

impl Header for Timeout {
    fn name() -> &'static HeaderName {
        &TIMEOUT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        let value = one(values)?;
        let mut v = Vec::new();
        let words = value.to_str().map_err(map_invalid)?.split(',');
        for word in words {
            let word = word.trim();
            let w = match word {
                "Infinite" => DavTimeout::Infinite,
                _ if word.starts_with("Second-") => {
                    match word[7..].parse::<u32>() {
                        Err(_) => return Err(invalid()),
                        Ok(n) => DavTimeout::Seconds(n),
                    }
                },
                _ => return Err(invalid()),
            };
            v.push(w);
        }
        Ok(Timeout(v))
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        let value = self
            .0
            .iter()
            .map(|s| {
                match s {
                    DavTimeout::Seconds(n) => format!("Second-{}", n),
                    DavTimeout::Infinite => "Infinite".to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        values.extend(std::iter::once(HeaderValue::from_str(&value).unwrap()));
    }
}

/// Destination: header. Reduced to the URL path.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination(pub String);

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        if s.starts_with('/') {
            return Ok(Destination(s.to_string()));
        }
        if let Some(caps) = RE_URL.captures(s) {
            if let Some(path) = caps.get(1) {
                return Ok(Destination(path.as_str().to_string()));
            }
        }
        Err(invalid())
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        values.extend(std::iter::once(HeaderValue::from_str(&self.0).unwrap()));
    }
}

/// Overwrite: header, "T" or "F".
#[derive(Debug, Clone, PartialEq)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        match one(values)?.as_bytes() {
            b"F" => Ok(Overwrite(false)),
            b"T" => Ok(Overwrite(true)),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        let value = if self.0 { "T" } else { "F" };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// Range: header. Only single byte-ranges are supported, which is all
/// the usual clients send.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ByteRange {
    /// bytes=a-b (inclusive)
    FromTo(u64, u64),
    /// bytes=a-
    AllFrom(u64),
    /// bytes=-n
    Last(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Range(pub Vec<ByteRange>);

impl Header for Range {
    fn name() -> &'static HeaderName {
        &http::header::RANGE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        let s = s.strip_prefix("bytes=").ok_or_else(invalid)?;
        let mut v = Vec::new();
        for part in s.split(',') {
            let nums = part.trim().split('-').collect::<Vec<&str>>();
            if nums.len() != 2 {
                return Err(invalid());
            }
            let r = match (nums[0].is_empty(), nums[1].is_empty()) {
                (false, false) => {
                    let b = nums[0].parse::<u64>().map_err(map_invalid)?;
                    let e = nums[1].parse::<u64>().map_err(map_invalid)?;
                    if b > e {
                        return Err(invalid());
                    }
                    ByteRange::FromTo(b, e)
                },
                (false, true) => ByteRange::AllFrom(nums[0].parse::<u64>().map_err(map_invalid)?),
                (true, false) => ByteRange::Last(nums[1].parse::<u64>().map_err(map_invalid)?),
                (true, true) => return Err(invalid()),
            };
            v.push(r);
        }
        if v.is_empty() {
            return Err(invalid());
        }
        Ok(Range(v))
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        let value = self
            .0
            .iter()
            .map(|r| {
                match r {
                    ByteRange::FromTo(b, e) => format!("{}-{}", b, e),
                    ByteRange::AllFrom(b) => format!("{}-", b),
                    ByteRange::Last(n) => format!("-{}", n),
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        let value = format!("bytes={}", value);
        values.extend(std::iter::once(HeaderValue::from_str(&value).unwrap()));
    }
}

/// ETag, strong or weak.
#[derive(Debug, Clone)]
pub struct ETag {
    tag:  String,
    weak: bool,
}

impl ETag {
    pub fn new(weak: bool, t: impl Into<String>) -> Result<ETag, headers::Error> {
        let t = t.into();
        if t.contains('"') {
            Err(invalid())
        } else {
            let w = if weak { "W/" } else { "" };
            Ok(ETag {
                tag: format!("{}\"{}\"", w, t),
                weak,
            })
        }
    }

    pub fn from_meta(meta: &dyn DavMetaData) -> Option<ETag> {
        let tag = meta.etag()?;
        Some(ETag {
            tag:  format!("\"{}\"", tag),
            weak: false,
        })
    }
}

impl FromStr for ETag {
    type Err = headers::Error;

    fn from_str(t: &str) -> Result<Self, Self::Err> {
        let (weak, s) = match t.strip_prefix("W/") {
            Some(t) => (true, t),
            None => (false, t),
        };
        if s.starts_with('"') && s.ends_with('"') && !s[1..s.len() - 1].contains('"') {
            Ok(ETag {
                tag: t.to_owned(),
                weak,
            })
        } else {
            Err(invalid())
        }
    }
}

impl TryFrom<&HeaderValue> for ETag {
    type Error = headers::Error;

    fn try_from(value: &HeaderValue) -> Result<Self, Self::Error> {
        let s = value.to_str().map_err(map_invalid)?;
        ETag::from_str(s)
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.tag)
    }
}

impl PartialEq for ETag {
    // strong comparison; weak tags never match.
    fn eq(&self, other: &Self) -> bool {
        !self.weak && !other.weak && self.tag == other.tag
    }
}

impl Header for ETag {
    fn name() -> &'static HeaderName {
        &ETAG
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        ETag::try_from(one(values)?)
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        values.extend(std::iter::once(HeaderValue::from_str(&self.tag).unwrap()));
    }
}

/// If-Range: header, an etag or a date.
#[derive(Debug, Clone, PartialEq)]
pub enum IfRange {
    ETag(ETag),
    Date(headers::Date),
}

impl Header for IfRange {
    fn name() -> &'static HeaderName {
        &IF_RANGE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        let value = one(values)?;

        let mut iter = std::iter::once(value);
        if let Ok(tm) = headers::Date::decode(&mut iter) {
            return Ok(IfRange::Date(tm));
        }

        let mut iter = std::iter::once(value);
        if let Ok(et) = ETag::decode(&mut iter) {
            return Ok(IfRange::ETag(et));
        }

        Err(invalid())
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        match *self {
            IfRange::Date(ref d) => d.encode(values),
            IfRange::ETag(ref t) => t.encode(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ETagList {
    Tags(Vec<ETag>),
    Star,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfMatch(pub ETagList);

#[derive(Debug, Clone, PartialEq)]
pub struct IfNoneMatch(pub ETagList);

// Decode a list of etags. Not a full parser: comma's inside etags are
// not handled, but we never generate those either.
fn decode_etaglist<'i, I>(values: &mut I) -> Result<ETagList, headers::Error>
where I: Iterator<Item = &'i HeaderValue> {
    let mut v = Vec::new();
    let mut count = 0usize;
    for value in values {
        let s = value.to_str().map_err(map_invalid)?;
        if s.trim() == "*" {
            return Ok(ETagList::Star);
        }
        for t in s.split(',') {
            // Simply skip misformed etags, they will never match.
            if let Ok(t) = ETag::from_str(t.trim()) {
                v.push(t);
            }
        }
        count += 1;
    }
    if count != 0 {
        Ok(ETagList::Tags(v))
    } else {
        Err(invalid())
    }
}

fn encode_etaglist<E>(m: &ETagList, values: &mut E)
where E: Extend<HeaderValue> {
    let value = match *m {
        ETagList::Star => "*".to_string(),
        ETagList::Tags(ref t) => {
            t.iter()
                .map(|t| t.tag.as_str())
                .collect::<Vec<&str>>()
                .join(", ")
        },
    };
    values.extend(std::iter::once(HeaderValue::from_str(&value).unwrap()));
}

impl Header for IfMatch {
    fn name() -> &'static HeaderName {
        &IF_MATCH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        Ok(IfMatch(decode_etaglist(values)?))
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        encode_etaglist(&self.0, values)
    }
}

impl Header for IfNoneMatch {
    fn name() -> &'static HeaderName {
        &IF_NONE_MATCH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        Ok(IfNoneMatch(decode_etaglist(values)?))
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        encode_etaglist(&self.0, values)
    }
}

// The "If" header contains IfLists, of which the results are ORed.
#[derive(Debug, Clone, PartialEq)]
pub struct If(pub Vec<IfList>);

// An IfList contains Conditions, of which the results are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub struct IfList {
    pub resource_tag: Option<url::Url>,
    pub conditions:   Vec<IfCondition>,
}

impl IfList {
    fn new() -> IfList {
        IfList {
            resource_tag: None,
            conditions:   Vec::new(),
        }
    }

    fn add(&mut self, not: bool, item: IfItem) {
        self.conditions.push(IfCondition { not, item });
    }
}

// Single Condition is [Not] State-Token | ETag
#[derive(Debug, Clone, PartialEq)]
pub struct IfCondition {
    pub not:  bool,
    pub item: IfItem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IfItem {
    StateToken(String),
    ETag(ETag),
}

// Tokenizer state.
#[derive(Debug, Clone, PartialEq)]
enum IfToken {
    ListOpen,
    ListClose,
    Not,
    Word(String),
    Pointy(String),
    ETag(ETag),
    End,
}

#[derive(Debug, Clone, PartialEq)]
enum IfState {
    Start,
    RTag,
    List,
    Not,
    Bad,
}

fn is_whitespace(c: u8) -> bool {
    b" \t\r\n".contains(&c)
}

fn is_special(c: u8) -> bool {
    b"<>()[]".contains(&c)
}

fn trim_left(mut out: &'_ [u8]) -> &'_ [u8] {
    while !out.is_empty() && is_whitespace(out[0]) {
        out = &out[1..];
    }
    out
}

// scan from an opening delimiter up to `c`.
fn scan_until(buf: &[u8], c: u8) -> Result<(&[u8], &[u8]), headers::Error> {
    let mut i = 1;
    let mut quote = false;
    while quote || buf.get(i) != Some(&c) {
        match buf.get(i) {
            None => return Err(invalid()),
            Some(&x) if is_whitespace(x) => return Err(invalid()),
            Some(b'"') => quote = !quote,
            Some(_) => {},
        }
        i += 1;
    }
    Ok((&buf[1..i], &buf[i + 1..]))
}

// scan one bare word.
fn scan_word(buf: &[u8]) -> Result<(&[u8], &[u8]), headers::Error> {
    for (i, &c) in buf.iter().enumerate() {
        if is_whitespace(c) || is_special(c) || c < 32 {
            if i == 0 {
                return Err(invalid());
            }
            return Ok((&buf[..i], &buf[i..]));
        }
    }
    Ok((buf, b""))
}

// next token.
fn get_token(buf: &'_ [u8]) -> Result<(IfToken, &'_ [u8]), headers::Error> {
    let buf = trim_left(buf);
    if buf.is_empty() {
        return Ok((IfToken::End, buf));
    }
    match buf[0] {
        b'(' => Ok((IfToken::ListOpen, &buf[1..])),
        b')' => Ok((IfToken::ListClose, &buf[1..])),
        b'<' => {
            let (tok, rest) = scan_until(buf, b'>')?;
            let s = String::from_utf8(tok.to_vec()).map_err(map_invalid)?;
            Ok((IfToken::Pointy(s), rest))
        },
        b'[' => {
            let (tok, rest) = scan_until(buf, b']')?;
            let s = std::str::from_utf8(tok).map_err(map_invalid)?;
            Ok((IfToken::ETag(ETag::from_str(s)?), rest))
        },
        _ => {
            let (tok, rest) = scan_word(buf)?;
            if tok == b"Not" {
                Ok((IfToken::Not, rest))
            } else {
                let s = String::from_utf8(tok.to_vec()).map_err(map_invalid)?;
                Ok((IfToken::Word(s), rest))
            }
        },
    }
}

impl Header for If {
    fn name() -> &'static HeaderName {
        &IF
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where I: Iterator<Item = &'i HeaderValue> {
        // one big state machine.
        let mut if_lists = If(Vec::new());
        let mut cur_list = IfList::new();

        let mut state = IfState::Start;
        let mut input = one(values)?.as_bytes();

        loop {
            let (tok, rest) = get_token(input)?;
            input = rest;
            state = match state {
                IfState::Start => {
                    match tok {
                        IfToken::ListOpen => IfState::List,
                        IfToken::Pointy(url) => {
                            let u = url::Url::parse(&url).map_err(map_invalid)?;
                            cur_list.resource_tag = Some(u);
                            IfState::RTag
                        },
                        IfToken::End => {
                            if !if_lists.0.is_empty() {
                                break;
                            }
                            IfState::Bad
                        },
                        _ => IfState::Bad,
                    }
                },
                IfState::RTag => {
                    match tok {
                        IfToken::ListOpen => IfState::List,
                        _ => IfState::Bad,
                    }
                },
                IfState::List | IfState::Not => {
                    let not = state == IfState::Not;
                    match tok {
                        IfToken::Not => {
                            if not {
                                IfState::Bad
                            } else {
                                IfState::Not
                            }
                        },
                        IfToken::Pointy(stok) | IfToken::Word(stok) => {
                            // we have no full URI parser; require at
                            // least one ':' to accept a state token.
                            if !stok.contains(':') {
                                IfState::Bad
                            } else {
                                cur_list.add(not, IfItem::StateToken(stok));
                                IfState::List
                            }
                        },
                        IfToken::ETag(etag) => {
                            cur_list.add(not, IfItem::ETag(etag));
                            IfState::List
                        },
                        IfToken::ListClose => {
                            if cur_list.conditions.is_empty() {
                                IfState::Bad
                            } else {
                                if_lists.0.push(cur_list);
                                cur_list = IfList::new();
                                IfState::Start
                            }
                        },
                        _ => IfState::Bad,
                    }
                },
                IfState::Bad => return Err(invalid()),
            };
        }
        Ok(if_lists)
    }

    fn encode<E>(&self, values: &mut E)
    where E: Extend<HeaderValue> {
        let value = "[If header]";
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn if_header() {
        // Tagged list with etags, Not, state tokens, and a bare-word
        // token (golang x/net/webdav accepts those too).
        let val =
            r#"  <http://x.yz/> ([W/"etag"] Not <DAV:nope> ) (Not<urn:x>[W/"bla"] plain:word:123) "#;
        let hdrval = HeaderValue::from_static(val);
        let mut iter = std::iter::once(&hdrval);
        let hdr = If::decode(&mut iter).unwrap();
        assert_eq!(hdr.0.len(), 2);
        assert!(hdr.0[0].resource_tag.is_some());
        assert_eq!(hdr.0[0].conditions.len(), 2);
        assert!(hdr.0[0].conditions[1].not);
        assert_eq!(hdr.0[1].conditions.len(), 3);
    }

    #[test]
    fn etag_header() {
        let t1 = ETag::from_str(r#"W/"12345""#).unwrap();
        let t2 = ETag::from_str(r#"W/"12345""#).unwrap();
        let t3 = ETag::from_str(r#""12346""#).unwrap();
        let t4 = ETag::from_str(r#""12346""#).unwrap();
        assert!(t1 != t2);
        assert!(t2 != t3);
        assert!(t3 == t4);
        assert!(ETag::from_str("bogus").is_err());
    }

    #[test]
    fn range_header() {
        let hdrval = HeaderValue::from_static("bytes=0-0");
        let mut iter = std::iter::once(&hdrval);
        let r = Range::decode(&mut iter).unwrap();
        assert_eq!(r.0, vec![ByteRange::FromTo(0, 0)]);

        let hdrval = HeaderValue::from_static("bytes=10-,-5");
        let mut iter = std::iter::once(&hdrval);
        let r = Range::decode(&mut iter).unwrap();
        assert_eq!(r.0, vec![ByteRange::AllFrom(10), ByteRange::Last(5)]);
    }
}
