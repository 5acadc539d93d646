//! WebDAV XML 编解码
//!
//! 请求体（lockinfo / propfind / propertyupdate）先解析成一棵带命名空间的元素树，
//! 再按元素名取出需要的部分；响应（multistatus / lockdiscovery）直接拼接，
//! 所有 DAV 元素统一使用 `D:` 前缀。

use super::error::{status_line, DavError};
use super::lock::LockDetails;
use axum::http::StatusCode;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use std::fmt::Write as _;

pub const DAV_NS: &str = "DAV:";

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// 带命名空间的属性名
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropName {
    pub space: String,
    pub local: String,
}

impl PropName {
    pub fn new(space: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            local: local.into(),
        }
    }

    pub fn dav(local: &str) -> Self {
        Self::new(DAV_NS, local)
    }

    pub fn is_dav(&self, local: &str) -> bool {
        self.space == DAV_NS && self.local == local
    }
}

/// 属性及其值（原始内部 XML）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: PropName,
    pub lang: String,
    pub inner_xml: String,
}

impl Property {
    pub fn new(name: PropName, inner_xml: impl Into<String>) -> Self {
        Self {
            name,
            lang: String::new(),
            inner_xml: inner_xml.into(),
        }
    }

    /// 只有名字的空属性（用于 propname 与失败的 propstat）
    pub fn empty(name: PropName) -> Self {
        Self::new(name, String::new())
    }
}

#[derive(Debug, Default)]
struct Element {
    name: PropName,
    lang: String,
    children: Vec<Element>,
    /// 自包含的内部 XML：直接子元素补上了它们用到的祖先命名空间声明
    inner_xml: String,
}

impl Element {
    fn is_dav(&self, local: &str) -> bool {
        self.name.is_dav(local)
    }

    fn child(&self, local: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is_dav(local))
    }
}

fn invalid(what: &str) -> DavError {
    DavError::BadRequest(format!("无效的 {} 请求体", what))
}

/// 解析中的元素
struct Frame {
    element: Element,
    /// `<` 所在位置
    lt: usize,
    /// 标签名之后的位置，命名空间声明插在这里
    name_end: usize,
    prefixed: bool,
    inner_start: usize,
    /// 元素自身声明的命名空间（前缀为空表示默认命名空间）
    own: Vec<(String, String)>,
    /// 直接子元素需要补的声明 (位置, 文本)
    inserts: Vec<(usize, String)>,
}

fn namespace_decls(e: &quick_xml::events::BytesStart<'_>) -> Vec<(String, String)> {
    e.attributes()
        .flatten()
        .filter_map(|attr| {
            let key = attr.key.as_ref();
            let prefix = if key == b"xmlns" {
                ""
            } else {
                std::str::from_utf8(key.strip_prefix(b"xmlns:")?).ok()?
            };
            let uri = attr.unescape_value().ok()?.into_owned();
            Some((prefix.to_string(), uri))
        })
        .collect()
}

/// 元素脱离原文档后仍需要的命名空间声明
fn missing_decls(ancestors: &[Frame], frame: &Frame, raw: &str) -> String {
    let mut seen: Vec<&str> = frame.own.iter().map(|(p, _)| p.as_str()).collect();
    let mut out = String::new();
    let mut default_bound = false;
    for (prefix, uri) in ancestors.iter().rev().flat_map(|f| f.own.iter()) {
        if seen.contains(&prefix.as_str()) {
            continue;
        }
        seen.push(prefix.as_str());
        if prefix.is_empty() {
            default_bound = true;
            if !frame.prefixed {
                let _ = write!(out, " xmlns=\"{}\"", escape(uri));
            }
        } else if !(prefix == "D" && uri == DAV_NS) && raw.contains(&format!("{}:", prefix)) {
            let _ = write!(out, " xmlns:{}=\"{}\"", prefix, escape(uri));
        }
    }
    // 原文中没有默认命名空间，输出时也不能继承外层的
    if !default_bound && !frame.prefixed && !seen.contains(&"") {
        out.push_str(" xmlns=\"\"");
    }
    out
}

fn splice(body: &str, start: usize, end: usize, inserts: &[(usize, String)]) -> Option<String> {
    let mut out = String::with_capacity(end.saturating_sub(start));
    let mut pos = start;
    for (at, text) in inserts {
        out.push_str(body.get(pos..*at)?);
        out.push_str(text);
        pos = *at;
    }
    out.push_str(body.get(pos..end)?);
    Some(out)
}

fn parse_tree(body: &str) -> Result<Element, DavError> {
    let mut reader = NsReader::from_str(body);
    reader.trim_text(true);
    reader.expand_empty_elements(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root = None;
    loop {
        let before = reader.buffer_position() as usize;
        let (ns, event) = reader
            .read_resolved_event()
            .map_err(|e| DavError::BadRequest(format!("XML 解析失败: {}", e)))?;
        match event {
            Event::Start(e) => {
                let space = match ns {
                    ResolveResult::Bound(Namespace(ns)) => String::from_utf8_lossy(ns).into_owned(),
                    _ => String::new(),
                };
                let local = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let lang = e
                    .try_get_attribute("xml:lang")
                    .ok()
                    .flatten()
                    .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
                    .unwrap_or_default();
                let lt = before + body.get(before..).and_then(|rest| rest.find('<')).unwrap_or(0);
                stack.push(Frame {
                    element: Element {
                        name: PropName::new(space, local),
                        lang,
                        ..Default::default()
                    },
                    lt,
                    name_end: lt + 1 + e.name().as_ref().len(),
                    prefixed: e.name().prefix().is_some(),
                    inner_start: reader.buffer_position() as usize,
                    own: namespace_decls(&e),
                    inserts: Vec::new(),
                });
            }
            Event::End(_) => {
                let end = reader.buffer_position() as usize;
                let mut frame = stack
                    .pop()
                    .ok_or_else(|| DavError::BadRequest("XML 标签不匹配".to_string()))?;
                let inner = splice(body, frame.inner_start, before, &frame.inserts)
                    .or_else(|| body.get(frame.inner_start..before).map(str::to_string))
                    .unwrap_or_default();
                frame.element.inner_xml = inner.trim().to_string();

                let raw = body.get(frame.lt..end).unwrap_or_default();
                let decls = missing_decls(&stack, &frame, raw);
                match stack.last_mut() {
                    Some(parent) => {
                        if !decls.is_empty() {
                            parent.inserts.push((frame.name_end, decls));
                        }
                        parent.element.children.push(frame.element);
                    }
                    None if root.is_none() => root = Some(frame.element),
                    None => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(DavError::BadRequest("XML 文档不完整".to_string()));
    }
    root.ok_or_else(|| DavError::BadRequest("XML 文档为空".to_string()))
}

/// LOCK 请求体
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockInfo {
    pub exclusive: bool,
    pub shared: bool,
    pub write: bool,
    pub owner_xml: String,
}

/// 解析 `<D:lockinfo>`；空请求体表示刷新锁，返回 None
pub fn parse_lockinfo(body: &str) -> Result<Option<LockInfo>, DavError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let root = parse_tree(body)?;
    if !root.is_dav("lockinfo") {
        return Err(invalid("lockinfo"));
    }

    let mut info = LockInfo::default();
    if let Some(scope) = root.child("lockscope") {
        info.exclusive = scope.child("exclusive").is_some();
        info.shared = scope.child("shared").is_some();
    }
    if let Some(kind) = root.child("locktype") {
        info.write = kind.child("write").is_some();
    }
    if let Some(owner) = root.child("owner") {
        info.owner_xml = owner.inner_xml.clone();
    }

    // 只支持独占写锁
    if !info.exclusive || info.shared || !info.write {
        return Err(DavError::NotImplemented("仅支持独占写锁".to_string()));
    }
    Ok(Some(info))
}

/// PROPFIND 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropfindRequest {
    /// 所有属性，外加 `<D:include>` 中列出的属性
    AllProp { include: Vec<PropName> },
    /// 只列出属性名
    PropName,
    /// 指定属性
    Prop(Vec<PropName>),
}

fn child_names(element: &Element) -> Vec<PropName> {
    element.children.iter().map(|c| c.name.clone()).collect()
}

/// 解析 `<D:propfind>`；空请求体等同 allprop
pub fn parse_propfind(body: &str) -> Result<PropfindRequest, DavError> {
    if body.trim().is_empty() {
        return Ok(PropfindRequest::AllProp { include: Vec::new() });
    }
    let root = parse_tree(body)?;
    if !root.is_dav("propfind") {
        return Err(invalid("propfind"));
    }

    let allprop = root.child("allprop").is_some();
    let propname = root.child("propname").is_some();
    let prop = root.child("prop").map(child_names);
    let include = root.child("include").map(child_names);

    match (allprop, propname, prop, include) {
        (true, false, None, include) => Ok(PropfindRequest::AllProp {
            include: include.unwrap_or_default(),
        }),
        (false, true, None, None) => Ok(PropfindRequest::PropName),
        (false, false, Some(names), None) => Ok(PropfindRequest::Prop(names)),
        _ => Err(invalid("propfind")),
    }
}

/// PROPPATCH 中的一个 set 或 remove 操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proppatch {
    pub remove: bool,
    pub props: Vec<Property>,
}

/// 解析 `<D:propertyupdate>`
pub fn parse_proppatch(body: &str) -> Result<Vec<Proppatch>, DavError> {
    let root = parse_tree(body)?;
    if !root.is_dav("propertyupdate") {
        return Err(invalid("propertyupdate"));
    }

    let mut patches = Vec::new();
    for op in &root.children {
        let remove = if op.is_dav("set") {
            false
        } else if op.is_dav("remove") {
            true
        } else {
            return Err(invalid("propertyupdate"));
        };

        let props: Vec<Property> = op
            .children
            .iter()
            .filter(|c| c.is_dav("prop"))
            .flat_map(|p| p.children.iter())
            .map(|c| Property {
                name: c.name.clone(),
                lang: c.lang.clone(),
                inner_xml: c.inner_xml.clone(),
            })
            .collect();
        // remove 不能携带属性值
        if remove && props.iter().any(|p| !p.inner_xml.is_empty()) {
            return Err(invalid("propertyupdate"));
        }
        patches.push(Proppatch { remove, props });
    }
    Ok(patches)
}

fn write_property(out: &mut String, prop: &Property) {
    let name = &prop.name;
    let tag = if name.space == DAV_NS {
        format!("D:{}", name.local)
    } else {
        name.local.clone()
    };
    let _ = write!(out, "<{}", tag);
    if name.space != DAV_NS && !name.space.is_empty() {
        let _ = write!(out, " xmlns=\"{}\"", escape(&name.space));
    }
    if !prop.lang.is_empty() {
        let _ = write!(out, " xml:lang=\"{}\"", escape(&prop.lang));
    }
    if prop.inner_xml.is_empty() {
        out.push_str("/>");
    } else {
        let _ = write!(out, ">{}</{}>", prop.inner_xml, tag);
    }
}

/// 一组状态相同的属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Propstat {
    pub props: Vec<Property>,
    pub status: StatusCode,
    /// `<D:error>` 的内部 XML
    pub error_xml: String,
    pub description: String,
}

impl Propstat {
    pub fn new(status: StatusCode, props: Vec<Property>) -> Self {
        Self {
            props,
            status,
            error_xml: String::new(),
            description: String::new(),
        }
    }
}

/// multistatus 中的一个资源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavResponse {
    /// 已经过 URL 编码的路径
    pub href: String,
    pub propstats: Vec<Propstat>,
    /// 没有 propstat 时使用的整体状态
    pub status: Option<StatusCode>,
}

/// 增量构造 `<D:multistatus>` 文档
#[derive(Debug)]
pub struct MultistatusWriter {
    out: String,
    count: usize,
}

impl MultistatusWriter {
    pub fn new() -> Self {
        let mut out = String::with_capacity(4096);
        out.push_str(XML_DECL);
        out.push_str(r#"<D:multistatus xmlns:D="DAV:">"#);
        Self { out, count: 0 }
    }

    pub fn write(&mut self, response: &DavResponse) {
        let out = &mut self.out;
        let _ = write!(out, "<D:response><D:href>{}</D:href>", escape(&response.href));
        for ps in &response.propstats {
            out.push_str("<D:propstat><D:prop>");
            for prop in &ps.props {
                write_property(out, prop);
            }
            let _ = write!(out, "</D:prop><D:status>{}</D:status>", status_line(ps.status));
            if !ps.error_xml.is_empty() {
                let _ = write!(out, "<D:error>{}</D:error>", ps.error_xml);
            }
            if !ps.description.is_empty() {
                let _ = write!(
                    out,
                    "<D:responsedescription>{}</D:responsedescription>",
                    escape(&ps.description)
                );
            }
            out.push_str("</D:propstat>");
        }
        if let Some(status) = response.status {
            let _ = write!(out, "<D:status>{}</D:status>", status_line(status));
        }
        out.push_str("</D:response>");
        self.count += 1;
    }

    /// 已写入的 response 数量
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(mut self) -> String {
        self.out.push_str("</D:multistatus>");
        self.out
    }
}

impl Default for MultistatusWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// `Second-N` 或 `Infinite`
pub fn timeout_value(details: &LockDetails) -> String {
    match details.duration {
        Some(d) => format!("Second-{}", d.as_secs()),
        None => "Infinite".to_string(),
    }
}

/// `<D:activelock>` 片段，`root_href` 为锁根的 URL 编码路径
pub fn activelock_xml(token: &str, details: &LockDetails, root_href: &str) -> String {
    let mut out = String::new();
    out.push_str("<D:activelock>");
    out.push_str("<D:locktype><D:write/></D:locktype>");
    out.push_str("<D:lockscope><D:exclusive/></D:lockscope>");
    let depth = if details.zero_depth { "0" } else { "infinity" };
    let _ = write!(out, "<D:depth>{}</D:depth>", depth);
    if !details.owner_xml.is_empty() {
        let _ = write!(out, "<D:owner>{}</D:owner>", details.owner_xml);
    }
    let _ = write!(out, "<D:timeout>{}</D:timeout>", timeout_value(details));
    let _ = write!(
        out,
        "<D:locktoken><D:href>{}</D:href></D:locktoken>",
        escape(token)
    );
    let _ = write!(
        out,
        "<D:lockroot><D:href>{}</D:href></D:lockroot>",
        escape(root_href)
    );
    out.push_str("</D:activelock>");
    out
}

/// LOCK 成功后的响应体
pub fn lockdiscovery_xml(token: &str, details: &LockDetails, root_href: &str) -> String {
    format!(
        r#"{}<D:prop xmlns:D="DAV:"><D:lockdiscovery>{}</D:lockdiscovery></D:prop>"#,
        XML_DECL,
        activelock_xml(token, details, root_href)
    )
}
