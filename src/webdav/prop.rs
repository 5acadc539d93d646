//! 资源属性
//!
//! 活属性由存储对象实时计算，死属性（PROPPATCH 写入的任意属性）保存在
//! [`MemPropertyStore`] 中，随资源一起移动、复制和删除。

use super::lock::LockManager;
use super::xml::{activelock_xml, PropName, Property, Proppatch, Propstat};
use crate::storage::{clean_path, Obj};
use axum::http::StatusCode;
use chrono::SecondsFormat;
use dashmap::DashMap;
use quick_xml::escape::escape;
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime};

/// 把虚拟路径编码为带前缀的 href，目录以 `/` 结尾
pub fn href(prefix: &str, path: &str, is_dir: bool) -> String {
    let mut out = prefix.trim_end_matches('/').to_string();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(&urlencoding::encode(segment));
    }
    if out.is_empty() || (is_dir && !out.ends_with('/')) {
        out.push('/');
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveProp {
    ResourceType,
    DisplayName,
    ContentLength,
    LastModified,
    CreationDate,
    ContentType,
    ETag,
    LockDiscovery,
    SupportedLock,
}

const LIVE_PROPS: [LiveProp; 9] = [
    LiveProp::ResourceType,
    LiveProp::DisplayName,
    LiveProp::ContentLength,
    LiveProp::LastModified,
    LiveProp::CreationDate,
    LiveProp::ContentType,
    LiveProp::ETag,
    LiveProp::LockDiscovery,
    LiveProp::SupportedLock,
];

impl LiveProp {
    fn local(self) -> &'static str {
        match self {
            LiveProp::ResourceType => "resourcetype",
            LiveProp::DisplayName => "displayname",
            LiveProp::ContentLength => "getcontentlength",
            LiveProp::LastModified => "getlastmodified",
            LiveProp::CreationDate => "creationdate",
            LiveProp::ContentType => "getcontenttype",
            LiveProp::ETag => "getetag",
            LiveProp::LockDiscovery => "lockdiscovery",
            LiveProp::SupportedLock => "supportedlock",
        }
    }

    fn lookup(name: &PropName) -> Option<LiveProp> {
        LIVE_PROPS.into_iter().find(|p| name.is_dav(p.local()))
    }

    /// 目录是否具有该属性
    fn for_dir(self) -> bool {
        !matches!(
            self,
            LiveProp::ContentLength | LiveProp::ContentType | LiveProp::ETag
        )
    }

    fn value(self, obj: &Obj, ctx: &PropContext<'_>) -> String {
        match self {
            LiveProp::ResourceType => {
                if obj.is_dir {
                    "<D:collection/>".to_string()
                } else {
                    String::new()
                }
            }
            LiveProp::DisplayName => {
                if clean_path(&obj.path) == "/" {
                    String::new()
                } else {
                    escape(&obj.name).into_owned()
                }
            }
            LiveProp::ContentLength => obj.size.max(0).to_string(),
            LiveProp::LastModified => httpdate::fmt_http_date(SystemTime::from(obj.modified)),
            LiveProp::CreationDate => obj.created.to_rfc3339_opts(SecondsFormat::Secs, true),
            LiveProp::ContentType => mime_guess::from_path(&obj.name)
                .first_or_octet_stream()
                .to_string(),
            LiveProp::ETag => obj.etag(),
            LiveProp::LockDiscovery => ctx
                .locks
                .active_locks(Instant::now(), &obj.path)
                .iter()
                .map(|l| activelock_xml(&l.token, &l.details, &ctx.href(&l.details.root, false)))
                .collect(),
            LiveProp::SupportedLock => concat!(
                "<D:lockentry>",
                "<D:lockscope><D:exclusive/></D:lockscope>",
                "<D:locktype><D:write/></D:locktype>",
                "</D:lockentry>"
            )
            .to_string(),
        }
    }
}

/// 计算活属性所需的上下文
#[derive(Debug, Clone, Copy)]
pub struct PropContext<'a> {
    pub locks: &'a LockManager,
    /// 对外的 URL 前缀
    pub prefix: &'a str,
    /// 用户根目录，存储路径去掉它之后才是 URL 路径
    pub user_root: &'a str,
}

impl PropContext<'_> {
    /// 存储路径对应的 href
    pub fn href(&self, path: &str, is_dir: bool) -> String {
        href(self.prefix, &strip_root(self.user_root, path), is_dir)
    }
}

/// 去掉用户根目录前缀
pub fn strip_root(root: &str, path: &str) -> String {
    let root = clean_path(root);
    let path = clean_path(path);
    if root == "/" {
        return path;
    }
    match path.strip_prefix(&root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => clean_path(rest),
        _ => path,
    }
}

/// 内存死属性存储，按路径保存
#[derive(Debug, Default)]
pub struct MemPropertyStore {
    props: DashMap<String, BTreeMap<PropName, Property>>,
}

fn in_tree(path: &str, root: &str) -> bool {
    path == root || root == "/" || path.starts_with(&format!("{}/", root))
}

impl MemPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dead_props(&self, path: &str) -> BTreeMap<PropName, Property> {
        self.props
            .get(&clean_path(path))
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// 应用全部 set / remove 操作，返回每个属性名的 200 propstat
    pub fn patch(&self, path: &str, patches: &[Proppatch]) -> Vec<Propstat> {
        let path = clean_path(path);
        let mut names = Vec::new();
        {
            let mut entry = self.props.entry(path.clone()).or_default();
            for patch in patches {
                for prop in &patch.props {
                    if patch.remove {
                        entry.remove(&prop.name);
                    } else {
                        entry.insert(prop.name.clone(), prop.clone());
                    }
                    names.push(Property::empty(prop.name.clone()));
                }
            }
        }
        self.props.remove_if(&path, |_, p| p.is_empty());
        vec![Propstat::new(StatusCode::OK, names)]
    }

    /// 删除路径及其所有后代的属性
    pub fn remove_tree(&self, root: &str) {
        let root = clean_path(root);
        self.props.retain(|k, _| !in_tree(k, &root));
    }

    /// 只复制路径本身的属性
    pub fn copy_node(&self, src: &str, dst: &str) {
        let dst = clean_path(dst);
        match self.props.get(&clean_path(src)).map(|p| p.clone()) {
            Some(props) => {
                self.props.insert(dst, props);
            }
            None => {
                self.props.remove(&dst);
            }
        }
    }

    /// 复制路径及其后代的属性到 `dst`
    pub fn copy_tree(&self, src: &str, dst: &str) {
        let (src, dst) = (clean_path(src), clean_path(dst));
        let copied: Vec<(String, BTreeMap<PropName, Property>)> = self
            .props
            .iter()
            .filter(|e| in_tree(e.key(), &src))
            .map(|e| (rebase(e.key(), &src, &dst), e.value().clone()))
            .collect();
        self.remove_tree(&dst);
        for (path, props) in copied {
            self.props.insert(path, props);
        }
    }

    /// 移动路径及其后代的属性到 `dst`
    pub fn move_tree(&self, src: &str, dst: &str) {
        self.copy_tree(src, dst);
        let (src, dst) = (clean_path(src), clean_path(dst));
        self.props
            .retain(|k, _| !in_tree(k, &src) || in_tree(k, &dst));
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

fn rebase(path: &str, src: &str, dst: &str) -> String {
    let rest = path.strip_prefix(src).unwrap_or_default();
    clean_path(&format!("{}/{}", dst, rest))
}

fn make_propstats(x: Propstat, y: Propstat) -> Vec<Propstat> {
    let stats: Vec<Propstat> = [x, y].into_iter().filter(|p| !p.props.is_empty()).collect();
    if stats.is_empty() {
        return vec![Propstat::new(StatusCode::OK, Vec::new())];
    }
    stats
}

/// 查询指定属性，找不到的属性归入 404 propstat
pub fn props(
    obj: &Obj,
    store: &MemPropertyStore,
    ctx: &PropContext<'_>,
    names: &[PropName],
) -> Vec<Propstat> {
    let dead = store.dead_props(&obj.path);
    let mut ok = Propstat::new(StatusCode::OK, Vec::new());
    let mut not_found = Propstat::new(StatusCode::NOT_FOUND, Vec::new());

    for name in names {
        if let Some(prop) = dead.get(name) {
            ok.props.push(prop.clone());
            continue;
        }
        match LiveProp::lookup(name) {
            Some(live) if live.for_dir() || !obj.is_dir => {
                ok.props.push(Property::new(name.clone(), live.value(obj, ctx)));
            }
            _ => not_found.props.push(Property::empty(name.clone())),
        }
    }
    make_propstats(ok, not_found)
}

/// 资源具有的全部属性名
pub fn propnames(obj: &Obj, store: &MemPropertyStore) -> Vec<PropName> {
    let mut names: Vec<PropName> = LIVE_PROPS
        .into_iter()
        .filter(|p| p.for_dir() || !obj.is_dir)
        .map(|p| PropName::dav(p.local()))
        .collect();
    names.extend(store.dead_props(&obj.path).into_keys());
    names
}

/// allprop 加上 include 中额外列出的属性
pub fn allprop(
    obj: &Obj,
    store: &MemPropertyStore,
    ctx: &PropContext<'_>,
    include: &[PropName],
) -> Vec<Propstat> {
    let mut names = propnames(obj, store);
    for name in include {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    props(obj, store, ctx, &names)
}

/// PROPPATCH；任何一个活属性都会让整个请求失败
pub fn patch(path: &str, store: &MemPropertyStore, patches: &[Proppatch]) -> Vec<Propstat> {
    let conflict = patches
        .iter()
        .flat_map(|p| p.props.iter())
        .any(|p| LiveProp::lookup(&p.name).is_some());
    if !conflict {
        return store.patch(path, patches);
    }

    let mut forbidden = Propstat::new(StatusCode::FORBIDDEN, Vec::new());
    forbidden.error_xml = "<D:cannot-modify-protected-property/>".to_string();
    let mut failed_dep = Propstat::new(StatusCode::FAILED_DEPENDENCY, Vec::new());
    for prop in patches.iter().flat_map(|p| p.props.iter()) {
        let target = if LiveProp::lookup(&prop.name).is_some() {
            &mut forbidden
        } else {
            &mut failed_dep
        };
        target.props.push(Property::empty(prop.name.clone()));
    }
    make_propstats(forbidden, failed_dep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::lock::LockDetails;
    use chrono::{TimeZone, Utc};

    fn file(path: &str) -> Obj {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Obj {
            path: path.to_string(),
            name: crate::storage::base_name(path),
            size: 42,
            modified: t,
            created: t,
            is_dir: false,
        }
    }

    fn set(name: PropName, value: &str) -> Proppatch {
        Proppatch {
            remove: false,
            props: vec![Property::new(name, value)],
        }
    }

    #[test]
    fn test_href() {
        assert_eq!(href("/dav", "/", true), "/dav/");
        assert_eq!(href("", "/", true), "/");
        assert_eq!(href("/dav/", "/a b/c", false), "/dav/a%20b/c");
        assert_eq!(href("", "/dir", true), "/dir/");
    }

    #[test]
    fn test_strip_root() {
        assert_eq!(strip_root("/", "/a/b"), "/a/b");
        assert_eq!(strip_root("/alice", "/alice/a"), "/a");
        assert_eq!(strip_root("/alice", "/alice"), "/");
        assert_eq!(strip_root("/alice", "/alicex/a"), "/alicex/a");
        let locks = LockManager::new();
        let ctx = PropContext { locks: &locks, prefix: "/dav", user_root: "/alice" };
        assert_eq!(ctx.href("/alice/docs", true), "/dav/docs/");
    }

    #[test]
    fn test_live_props() {
        let locks = LockManager::new();
        let ctx = PropContext { locks: &locks, prefix: "/dav", user_root: "/" };
        let store = MemPropertyStore::new();
        let obj = file("/docs/a.txt");

        let stats = props(
            &obj,
            &store,
            &ctx,
            &[
                PropName::dav("getcontentlength"),
                PropName::dav("getcontenttype"),
                PropName::dav("getlastmodified"),
                PropName::new("urn:z", "missing"),
            ],
        );
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].status, StatusCode::OK);
        assert_eq!(stats[0].props[0].inner_xml, "42");
        assert_eq!(stats[0].props[1].inner_xml, "text/plain");
        assert_eq!(stats[0].props[2].inner_xml, "Tue, 14 Nov 2023 22:13:20 GMT");
        assert_eq!(stats[1].status, StatusCode::NOT_FOUND);

        // 目录没有 getcontentlength
        let dir = Obj::dir("/docs");
        let stats = props(&dir, &store, &ctx, &[PropName::dav("getcontentlength")]);
        assert_eq!(stats[0].status, StatusCode::NOT_FOUND);
        assert!(!propnames(&dir, &store).contains(&PropName::dav("getetag")));
    }

    #[test]
    fn test_lockdiscovery_prop() {
        let locks = LockManager::new();
        locks
            .create(
                Instant::now(),
                LockDetails {
                    root: "/docs".to_string(),
                    duration: None,
                    owner_xml: String::new(),
                    zero_depth: false,
                },
            )
            .unwrap();
        let ctx = PropContext { locks: &locks, prefix: "/dav", user_root: "/" };
        let stats = props(
            &file("/docs/a.txt"),
            &MemPropertyStore::new(),
            &ctx,
            &[PropName::dav("lockdiscovery")],
        );
        let value = &stats[0].props[0].inner_xml;
        assert!(value.contains("<D:lockroot><D:href>/dav/docs</D:href></D:lockroot>"));
    }

    #[test]
    fn test_patch_dead_props() {
        let locks = LockManager::new();
        let ctx = PropContext { locks: &locks, prefix: "", user_root: "/" };
        let store = MemPropertyStore::new();
        let color = PropName::new("urn:z", "color");

        let stats = patch("/a.txt", &store, &[set(color.clone(), "red")]);
        assert_eq!(stats[0].status, StatusCode::OK);
        assert!(stats[0].props[0].inner_xml.is_empty());

        let stats = allprop(&file("/a.txt"), &store, &ctx, &[]);
        assert!(stats[0].props.iter().any(|p| p.name == color && p.inner_xml == "red"));

        patch(
            "/a.txt",
            &store,
            &[Proppatch {
                remove: true,
                props: vec![Property::empty(color.clone())],
            }],
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_patch_protected_property() {
        let store = MemPropertyStore::new();
        let stats = patch(
            "/a.txt",
            &store,
            &[
                set(PropName::dav("getetag"), "x"),
                set(PropName::new("urn:z", "color"), "red"),
            ],
        );
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].status, StatusCode::FORBIDDEN);
        assert_eq!(stats[1].status, StatusCode::FAILED_DEPENDENCY);
        assert!(store.is_empty());
    }

    #[test]
    fn test_tree_operations() {
        let store = MemPropertyStore::new();
        let color = PropName::new("urn:z", "color");
        store.patch("/a", &[set(color.clone(), "1")]);
        store.patch("/a/b", &[set(color.clone(), "2")]);
        store.patch("/ab", &[set(color.clone(), "3")]);

        store.copy_tree("/a", "/c");
        assert_eq!(store.dead_props("/c/b")[&color].inner_xml, "2");
        assert_eq!(store.len(), 5);

        store.move_tree("/c", "/d");
        assert!(store.dead_props("/c").is_empty());
        assert_eq!(store.dead_props("/d")[&color].inner_xml, "1");

        store.remove_tree("/a");
        assert!(store.dead_props("/a/b").is_empty());
        assert_eq!(store.dead_props("/ab")[&color].inner_xml, "3");
    }
}
