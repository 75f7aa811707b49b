//! The path part of a request URL, with the share prefix split off.
//!
//! A `DavPath` is stored as percent-decoded bytes. Comparisons are
//! byte-exact, and a trailing slash marks a collection. The prefix
//! (mount path plus share name) is carried along but hidden: the plain
//! accessors return the in-share path, the `_with_prefix` variants the
//! full request path.
use std::error::Error;
use std::ffi::OsStr;
#[cfg(target_family = "unix")]
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use percent_encoding as pct;
use unicode_normalization::UnicodeNormalization;

use crate::errors::DavError;

// Encode all non-unreserved characters, except '/'.
const PATH_ENCODE_SET: &pct::AsciiSet = &pct::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// URL path, with hidden share prefix.
#[derive(Clone)]
pub struct DavPath {
    fullpath: Vec<u8>,
    pfxlen:   usize,
}

/// Error returned by the DavPath constructors.
#[derive(Debug)]
pub enum ParseError {
    /// cannot parse
    InvalidPath,
    /// outside of prefix
    PrefixMismatch,
    /// too many dotdots
    ForbiddenPath,
}

impl Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ParseError> for DavError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::InvalidPath => DavError::InvalidPath,
            ParseError::PrefixMismatch => DavError::IllegalPath,
            ParseError::ForbiddenPath => DavError::ForbiddenPath,
        }
    }
}

// A decoded segment may contain any byte except '/' and NUL.
fn valid_segment(src: &[u8]) -> Result<(), ParseError> {
    let mut p = pct::percent_decode(src);
    if p.any(|x| x == 0 || x == b'/') {
        return Err(ParseError::InvalidPath);
    }
    Ok(())
}

fn encode_path(src: &[u8]) -> Vec<u8> {
    pct::percent_encode(src, PATH_ENCODE_SET).to_string().into_bytes()
}

// Decoded UTF-8 segments are recomposed to NFC, so the composed and
// decomposed spellings of a name address the same resource. Segments
// that are not valid UTF-8 stay byte-exact.
fn nfc_segment(seg: Vec<u8>) -> Vec<u8> {
    match String::from_utf8(seg) {
        Ok(s) => s.nfc().collect::<String>().into_bytes(),
        Err(e) => e.into_bytes(),
    }
}

// Normalize the raw request path:
// - only printable ASCII before decoding
// - strip the query, reject fragments
// - must be absolute
// - merge consecutive slashes, resolve "." and ".."
// - percent-decode, rejecting NUL and encoded '/'
// - recompose decoded UTF-8 to NFC
fn normalize_path(rp: &[u8]) -> Result<Vec<u8>, ParseError> {
    if rp.iter().any(|&x| !(32..=126).contains(&x)) {
        return Err(ParseError::InvalidPath);
    }

    let mut rawpath = rp;
    if let Some(pos) = rawpath.iter().position(|&x| x == b'?' || x == b'#') {
        if rawpath[pos] == b'#' {
            return Err(ParseError::InvalidPath);
        }
        rawpath = &rawpath[..pos];
    }

    if rawpath.first() != Some(&b'/') {
        return Err(ParseError::InvalidPath);
    }

    let isdir = rawpath.ends_with(b"/");
    let mut segs: Vec<&[u8]> = Vec::new();
    for segment in rawpath.split(|&c| c == b'/') {
        match segment {
            b"" | b"." => {},
            b".." => {
                if segs.pop().is_none() {
                    return Err(ParseError::ForbiddenPath);
                }
            },
            s => {
                valid_segment(s)?;
                segs.push(s);
            },
        }
    }

    let mut path = Vec::with_capacity(rawpath.len());
    for seg in &segs {
        path.push(b'/');
        path.extend(nfc_segment(pct::percent_decode(seg).collect()));
    }
    if isdir || segs.is_empty() {
        path.push(b'/');
    }
    Ok(path)
}

/// Comparison ignores a trailing slash, so /foo == /foo/.
impl PartialEq for DavPath {
    fn eq(&self, rhs: &DavPath) -> bool {
        strip_slash(&self.fullpath) == strip_slash(&rhs.fullpath)
    }
}

fn strip_slash(p: &[u8]) -> &[u8] {
    if p.len() > 1 && p.ends_with(b"/") {
        &p[..p.len() - 1]
    } else {
        p
    }
}

impl std::fmt::Display for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.fullpath))
    }
}

impl std::fmt::Debug for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let pfx = String::from_utf8_lossy(&self.fullpath[..self.pfxlen]);
        let rest = String::from_utf8_lossy(&self.fullpath[self.pfxlen..]);
        write!(f, "{}[{}]", pfx, rest)
    }
}

impl DavPath {
    /// Parse a URL-encoded path, no prefix.
    pub fn new(src: &str) -> Result<DavPath, ParseError> {
        Ok(DavPath {
            fullpath: normalize_path(src.as_bytes())?,
            pfxlen:   0,
        })
    }

    /// Parse a URL-encoded path and split off the (unencoded) prefix.
    pub fn from_str_and_prefix(src: &str, prefix: &str) -> Result<DavPath, ParseError> {
        let path = normalize_path(src.as_bytes())?;
        let mut this = DavPath {
            fullpath: path,
            pfxlen:   0,
        };
        this.set_prefix(prefix)?;
        Ok(this)
    }

    /// From a request URI. The `*` form (OPTIONS) is passed through.
    pub fn from_uri_and_prefix(uri: &http::uri::Uri, prefix: &str) -> Result<DavPath, ParseError> {
        match uri.path() {
            "*" => {
                Ok(DavPath {
                    fullpath: b"*".to_vec(),
                    pfxlen:   0,
                })
            },
            path if path.starts_with('/') => DavPath::from_str_and_prefix(path, prefix),
            _ => Err(ParseError::InvalidPath),
        }
    }

    fn set_prefix(&mut self, prefix: &str) -> Result<(), ParseError> {
        let path = &mut self.fullpath;
        let prefix = prefix.as_bytes();
        if !path.starts_with(prefix) {
            return Err(ParseError::PrefixMismatch);
        }
        let mut pfxlen = prefix.len();
        if prefix.ends_with(b"/") {
            pfxlen -= 1;
            if path[pfxlen] != b'/' {
                return Err(ParseError::PrefixMismatch);
            }
        } else if path.len() == pfxlen {
            path.push(b'/');
        }
        self.pfxlen = pfxlen;
        Ok(())
    }

    /// the URL prefix (mount path + share).
    pub fn prefix(&self) -> &str {
        std::str::from_utf8(&self.fullpath[..self.pfxlen]).unwrap_or("")
    }

    /// raw decoded bytes of the in-share path.
    pub fn as_bytes(&self) -> &[u8] {
        &self.fullpath[self.pfxlen..]
    }

    /// raw decoded bytes of the full path, prefix included. This is
    /// the canonical key for state shared between shares (locks).
    pub fn as_bytes_with_prefix(&self) -> &[u8] {
        &self.fullpath
    }

    /// URL-encoded in-share path.
    pub fn as_url_string(&self) -> String {
        String::from_utf8(encode_path(self.as_bytes())).unwrap()
    }

    /// URL-encoded path including the prefix. This is what goes into
    /// `<D:href>` elements and `Location`-style headers.
    pub fn as_url_string_with_prefix(&self) -> String {
        String::from_utf8(encode_path(&self.fullpath)).unwrap()
    }

    /// does the path end in '/'.
    pub fn is_collection(&self) -> bool {
        self.as_bytes().ends_with(b"/")
    }

    // is this the `OPTIONS *` pseudo path.
    pub(crate) fn is_star(&self) -> bool {
        self.fullpath == b"*"
    }

    pub(crate) fn add_slash(&mut self) {
        if !self.is_collection() {
            self.fullpath.push(b'/');
        }
    }

    pub(crate) fn add_slash_if(&mut self, b: bool) {
        if b && !self.is_collection() {
            self.fullpath.push(b'/');
        }
    }

    /// Append one (decoded) segment.
    pub(crate) fn push_segment(&mut self, b: &[u8]) {
        if !self.is_collection() {
            self.fullpath.push(b'/');
        }
        self.fullpath.extend_from_slice(b);
    }

    /// The parent collection.
    pub fn parent(&self) -> DavPath {
        let path = self.as_bytes();
        let mut end = strip_slash(path).len();
        while end > 0 {
            end -= 1;
            if path[end] == b'/' {
                break;
            }
        }
        let mut fullpath = self.fullpath[..self.pfxlen].to_vec();
        fullpath.extend_from_slice(&path[..end]);
        fullpath.push(b'/');
        DavPath {
            fullpath,
            pfxlen: self.pfxlen,
        }
    }

    /// Last segment of the path. Empty for the root.
    pub fn file_name_bytes(&self) -> &[u8] {
        strip_slash(self.as_bytes())
            .split(|&c| c == b'/')
            .next_back()
            .unwrap_or(b"")
    }

    /// As OS-specific path relative to a root directory, for `push()`
    /// onto a `PathBuf`. Never starts or ends in a slash.
    pub fn as_rel_ospath(&self) -> &Path {
        let mut path = self.as_bytes();
        if path.starts_with(b"/") {
            path = &path[1..];
        }
        path = strip_slash(path);
        #[cfg(target_family = "unix")]
        let os_str = OsStr::from_bytes(path);
        #[cfg(not(target_family = "unix"))]
        let os_str: &OsStr = std::str::from_utf8(path).unwrap_or("").as_ref();
        Path::new(os_str)
    }

    /// As OS-specific absolute-ish path (in-share). Never ends in '/'.
    pub fn as_pathbuf(&self) -> PathBuf {
        let b = strip_slash(self.as_bytes());
        #[cfg(target_family = "unix")]
        let os_string = OsStr::from_bytes(b).to_owned();
        #[cfg(not(target_family = "unix"))]
        let os_string = std::ffi::OsString::from(String::from_utf8_lossy(b).into_owned());
        PathBuf::from(os_string)
    }

    pub(crate) fn get_mime_type_str(&self) -> &'static str {
        let name = self.file_name_bytes();
        let d = name.rsplitn(2, |&c| c == b'.').collect::<Vec<&[u8]>>();
        if d.len() > 1 {
            if let Ok(ext) = std::str::from_utf8(d[0]) {
                if let Some(t) = mime_guess::from_ext(ext).first_raw() {
                    return t;
                }
            }
        }
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        let p = DavPath::new("/a//b/./c%20d").unwrap();
        assert_eq!(p.as_bytes(), b"/a/b/c d");
        assert_eq!(p.as_url_string(), "/a/b/c%20d");
        assert!(!p.is_collection());
        assert!(DavPath::new("/a/../../b").is_err());
        assert!(DavPath::new("/a/%2fb").is_err());
        assert_eq!(DavPath::new("/a/..").unwrap().as_bytes(), b"/");
    }

    #[test]
    fn nfc() {
        // "café", composed (U+00E9) and decomposed (e + U+0301).
        let composed = DavPath::new("/caf%C3%A9").unwrap();
        let decomposed = DavPath::new("/cafe%CC%81").unwrap();
        assert_eq!(composed.as_bytes(), decomposed.as_bytes());
        assert!(composed == decomposed);
        // non-UTF-8 segments stay byte-exact.
        let raw = DavPath::new("/%ff%fe").unwrap();
        assert_eq!(raw.as_bytes(), b"/\xff\xfe");
    }

    #[test]
    fn prefixes() {
        let p = DavPath::from_str_and_prefix("/share/x/y/", "/share").unwrap();
        assert_eq!(p.as_bytes(), b"/x/y/");
        assert_eq!(p.prefix(), "/share");
        assert_eq!(p.as_url_string_with_prefix(), "/share/x/y/");
        let root = DavPath::from_str_and_prefix("/share", "/share").unwrap();
        assert_eq!(root.as_bytes(), b"/");
        assert!(DavPath::from_str_and_prefix("/other/x", "/share").is_err());
    }

    #[test]
    fn segments() {
        let mut p = DavPath::from_str_and_prefix("/s/a", "/s").unwrap();
        p.add_slash();
        p.push_segment(b"b");
        assert_eq!(p.as_bytes(), b"/a/b");
        assert_eq!(p.file_name_bytes(), b"b");
        assert_eq!(p.parent().as_bytes(), b"/a/");
        assert_eq!(p.parent().parent().as_bytes(), b"/");
        assert!(p == DavPath::from_str_and_prefix("/s/a/b/", "/s").unwrap());
    }
}
