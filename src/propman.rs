//! Dead-property storage, independent of the backends.
//!
//! Properties are keyed by the canonical URL-encoded path of the
//! resource including its share prefix (the "ref URL"), so one manager
//! can serve several shares. Values are opaque XML subtrees; the
//! manager stores the serialized bytes and never reinterprets them.
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use http::StatusCode;

use crate::davpath::DavPath;
use crate::fs::{DavProp, FsError, FsResult};

/// The trait that defines a dead-property manager.
pub trait DavPropManager: Debug + Sync + Send + BoxClonePm {
    /// Are dead properties supported at all? (used by PROPFIND allprop).
    fn have_props(&self, path: &DavPath) -> bool;

    /// Value of one property, as serialized XML.
    fn get_prop(&self, path: &DavPath, prop: DavProp) -> FsResult<Vec<u8>>;

    /// All properties of a resource. With `do_content` the XML values
    /// are included, otherwise just the names.
    fn get_props(&self, path: &DavPath, do_content: bool) -> FsResult<Vec<DavProp>>;

    /// Atomically apply a PROPPATCH batch: `(true, prop)` sets,
    /// `(false, prop)` removes. Either all changes apply or none do.
    fn patch_props(
        &self,
        path: &DavPath,
        patch: Vec<(bool, DavProp)>,
    ) -> FsResult<Vec<(StatusCode, DavProp)>>;

    /// Copy all properties of `src` to `dst` (COPY of a single resource).
    fn copy_properties(&self, src: &DavPath, dst: &DavPath) -> FsResult<()>;

    /// Move properties from `src` to `dst`. With `with_children`, every
    /// entry at or below `src` is rewritten to live below `dst`.
    fn move_properties(&self, src: &DavPath, dst: &DavPath, with_children: bool) -> FsResult<()>;

    /// Drop the properties of a deleted resource (and subtree).
    fn remove_properties(&self, path: &DavPath, with_children: bool) -> FsResult<()>;
}

#[doc(hidden)]
pub trait BoxClonePm {
    fn box_clone(&self) -> Box<dyn DavPropManager>;
}

// generic Clone, calls implementation-specific box_clone().
impl Clone for Box<dyn DavPropManager> {
    fn clone(&self) -> Box<dyn DavPropManager> {
        self.box_clone()
    }
}

#[doc(hidden)]
impl<PM: Clone + DavPropManager + 'static> BoxClonePm for PM {
    fn box_clone(&self) -> Box<dyn DavPropManager> {
        Box::new((*self).clone())
    }
}

type PropMap = BTreeMap<String, HashMap<String, DavProp>>;

/// In-memory property manager.
///
/// Create one instance with `MemPm::new`, keep it in the application,
/// and clone it into every share; a MemPm is just a handle.
#[derive(Debug, Clone)]
pub struct MemPm(Arc<Mutex<PropMap>>);

impl MemPm {
    pub fn new() -> Box<MemPm> {
        Box::new(MemPm(Arc::new(Mutex::new(BTreeMap::new()))))
    }
}

// canonical ref-URL: encoded path with prefix, no trailing slash.
fn refurl(path: &DavPath) -> String {
    let mut u = path.as_url_string_with_prefix();
    while u.len() > 1 && u.ends_with('/') {
        u.pop();
    }
    u
}

fn propkey(ns: &Option<String>, name: &str) -> String {
    format!("{}:{}", ns.as_deref().unwrap_or(""), name)
}

// clone a DavProp without the (possibly large) value.
fn nameonly(p: &DavProp) -> DavProp {
    DavProp {
        name:      p.name.clone(),
        prefix:    p.prefix.clone(),
        namespace: p.namespace.clone(),
        xml:       None,
    }
}

impl DavPropManager for MemPm {
    fn have_props(&self, _path: &DavPath) -> bool {
        true
    }

    fn get_prop(&self, path: &DavPath, prop: DavProp) -> FsResult<Vec<u8>> {
        let map = self.0.lock().unwrap();
        map.get(&refurl(path))
            .and_then(|props| props.get(&propkey(&prop.namespace, &prop.name)))
            .and_then(|p| p.xml.clone())
            .ok_or(FsError::NotFound)
    }

    fn get_props(&self, path: &DavPath, do_content: bool) -> FsResult<Vec<DavProp>> {
        let map = self.0.lock().unwrap();
        let mut res = Vec::new();
        if let Some(props) = map.get(&refurl(path)) {
            for p in props.values() {
                res.push(if do_content { p.clone() } else { nameonly(p) });
            }
        }
        Ok(res)
    }

    fn patch_props(
        &self,
        path: &DavPath,
        patch: Vec<(bool, DavProp)>,
    ) -> FsResult<Vec<(StatusCode, DavProp)>>
    {
        let mut map = self.0.lock().unwrap();
        let props = map.entry(refurl(path)).or_default();
        // all operations below are infallible, so the batch as a whole
        // is trivially atomic under the lock.
        let mut res = Vec::new();
        for (set, p) in patch.into_iter() {
            let key = propkey(&p.namespace, &p.name);
            if set {
                res.push((StatusCode::OK, nameonly(&p)));
                props.insert(key, p);
            } else {
                // removing a non-existent property is a no-op success.
                props.remove(&key);
                res.push((StatusCode::OK, p));
            }
        }
        Ok(res)
    }

    fn copy_properties(&self, src: &DavPath, dst: &DavPath) -> FsResult<()> {
        let mut map = self.0.lock().unwrap();
        if let Some(props) = map.get(&refurl(src)).cloned() {
            map.insert(refurl(dst), props);
        }
        Ok(())
    }

    fn move_properties(&self, src: &DavPath, dst: &DavPath, with_children: bool) -> FsResult<()> {
        let mut map = self.0.lock().unwrap();
        let src = refurl(src);
        let dst = refurl(dst);
        let keys = matching_keys(&map, &src, with_children);
        for key in keys {
            if let Some(props) = map.remove(&key) {
                let newkey = format!("{}{}", dst, &key[src.len()..]);
                map.insert(newkey, props);
            }
        }
        Ok(())
    }

    fn remove_properties(&self, path: &DavPath, with_children: bool) -> FsResult<()> {
        let mut map = self.0.lock().unwrap();
        let url = refurl(path);
        for key in matching_keys(&map, &url, with_children) {
            map.remove(&key);
        }
        Ok(())
    }
}

// keys equal to `url`, plus everything below it if `with_children`.
fn matching_keys(map: &PropMap, url: &str, with_children: bool) -> Vec<String> {
    map.range(url.to_string()..)
        .take_while(|(k, _)| k.as_str() == url || (with_children && is_child(k, url)))
        .map(|(k, _)| k.clone())
        .collect()
}

fn is_child(key: &str, url: &str) -> bool {
    key.len() > url.len() && key.starts_with(url) && key.as_bytes()[url.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::davpath::DavPath;

    fn prop(ns: &str, name: &str, val: Option<&str>) -> DavProp {
        DavProp {
            name:      name.to_string(),
            prefix:    None,
            namespace: Some(ns.to_string()),
            xml:       val.map(|v| v.as_bytes().to_vec()),
        }
    }

    #[test]
    fn set_get_remove() {
        let pm = MemPm::new();
        let path = DavPath::new("/a/b.txt").unwrap();
        pm.patch_props(&path, vec![(true, prop("http://ex/", "color", Some("<c>red</c>")))])
            .unwrap();
        let got = pm.get_prop(&path, prop("http://ex/", "color", None)).unwrap();
        assert_eq!(got, b"<c>red</c>");
        pm.patch_props(&path, vec![(false, prop("http://ex/", "color", None))])
            .unwrap();
        assert!(pm.get_prop(&path, prop("http://ex/", "color", None)).is_err());
    }

    #[test]
    fn move_with_children() {
        let pm = MemPm::new();
        let dir = DavPath::new("/d/").unwrap();
        let file = DavPath::new("/d/x").unwrap();
        let sibling = DavPath::new("/dx").unwrap();
        pm.patch_props(&dir, vec![(true, prop("urn:t", "p", Some("<p>1</p>")))])
            .unwrap();
        pm.patch_props(&file, vec![(true, prop("urn:t", "p", Some("<p>2</p>")))])
            .unwrap();
        pm.patch_props(&sibling, vec![(true, prop("urn:t", "p", Some("<p>3</p>")))])
            .unwrap();

        let dst = DavPath::new("/e/").unwrap();
        pm.move_properties(&dir, &dst, true).unwrap();

        assert!(pm.get_prop(&dir, prop("urn:t", "p", None)).is_err());
        assert_eq!(
            pm.get_prop(&DavPath::new("/e/x").unwrap(), prop("urn:t", "p", None)).unwrap(),
            b"<p>2</p>"
        );
        // the sibling whose name merely shares the prefix string is untouched.
        assert_eq!(pm.get_prop(&sibling, prop("urn:t", "p", None)).unwrap(), b"<p>3</p>");
    }
}
