//! PROPFIND / PROPPATCH

use super::error::DavError;
use super::handler::{parse_depth, read_body, DavHandler, Depth};
use super::prop;
use super::serve::build;
use super::xml::{
    parse_propfind, parse_proppatch, DavResponse, MultistatusWriter, PropfindRequest, Property,
    Propstat,
};
use crate::storage::{join_path, Obj};
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::response::Builder;
use axum::http::{header, StatusCode};
use axum::response::Response;
use tracing::{debug, warn};

fn multistatus(body: String) -> Result<Response, DavError> {
    build(
        Builder::new()
            .status(StatusCode::MULTI_STATUS)
            .header(header::CONTENT_TYPE, "text/xml; charset=utf-8"),
        Body::from(body),
    )
}

impl DavHandler {
    fn propstats(&self, obj: &Obj, request: &PropfindRequest) -> Vec<Propstat> {
        let store = &self.inner.props;
        let ctx = self.prop_ctx();
        match request {
            PropfindRequest::PropName => {
                let names = prop::propnames(obj, store)
                    .into_iter()
                    .map(Property::empty)
                    .collect();
                vec![Propstat::new(StatusCode::OK, names)]
            }
            PropfindRequest::AllProp { include } => prop::allprop(obj, store, &ctx, include),
            PropfindRequest::Prop(names) => prop::props(obj, store, &ctx, names),
        }
    }

    /// 按深度先序遍历，目录的子项按名称排序
    async fn walk(&self, root: Obj, depth: Depth) -> Vec<Obj> {
        let mut visited = Vec::new();
        // (对象, 剩余可下探的层数；None 表示不限)
        let mut stack = vec![(
            root,
            match depth {
                Depth::Zero => Some(0usize),
                Depth::One => Some(1),
                Depth::Infinity => None,
            },
        )];

        while let Some((obj, remaining)) = stack.pop() {
            let descend = obj.is_dir && remaining != Some(0);
            let path = obj.path.clone();
            visited.push(obj);
            if !descend {
                continue;
            }
            let mut children = match self.inner.storage.list(&path).await {
                Ok(children) => children,
                Err(e) => {
                    warn!("PROPFIND 列目录失败 {}: {}", path, e);
                    continue;
                }
            };
            children.sort_by(|a, b| a.name.cmp(&b.name));
            let next = remaining.map(|n| n - 1);
            for mut child in children.into_iter().rev() {
                child.path = join_path(&path, &child.name);
                stack.push((child, next));
            }
        }
        visited
    }

    pub(super) async fn handle_propfind(&self, parts: &Parts, body: Body) -> Result<Response, DavError> {
        let path = self.resolve_path(parts)?;
        let root = self.inner.storage.resolve(&path).await?;
        let depth = parse_depth(&parts.headers, Depth::Infinity)?;
        let request = parse_propfind(&read_body(body).await?)?;

        let mut writer = MultistatusWriter::new();
        let ctx = self.prop_ctx();
        for obj in self.walk(root, depth).await {
            writer.write(&DavResponse {
                href: ctx.href(&obj.path, obj.is_dir),
                propstats: self.propstats(&obj, &request),
                status: None,
            });
        }
        debug!("PROPFIND {} ({:?}): {} 个资源", path, depth, writer.len());
        multistatus(writer.finish())
    }

    pub(super) async fn handle_proppatch(&self, parts: &Parts, body: Body) -> Result<Response, DavError> {
        let path = self.resolve_path(parts)?;
        let _release = self.confirm_locks(parts, Some(&path), None).await?;
        let obj = self.inner.storage.resolve(&path).await?;
        let patches = parse_proppatch(&read_body(body).await?)?;

        let propstats = prop::patch(&path, &self.inner.props, &patches);
        let mut writer = MultistatusWriter::new();
        writer.write(&DavResponse {
            href: self.prop_ctx().href(&path, obj.is_dir),
            propstats,
            status: None,
        });
        multistatus(writer.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::super::handler::tests::{handler, send, text};
    use axum::http::StatusCode;

    const PROPPATCH: &str = r#"<?xml version="1.0" encoding="utf-8"?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:set><D:prop><Z:color>blue</Z:color></D:prop></D:set>
        </D:propertyupdate>"#;

    #[tokio::test]
    async fn test_propfind_depth_one() {
        let (_dir, h) = handler();
        send(&h, "MKCOL", "/dav/col", &[], "").await;
        send(&h, "PUT", "/dav/col/file.txt", &[], "abc").await;
        send(&h, "MKCOL", "/dav/col/sub", &[], "").await;
        send(&h, "PUT", "/dav/col/sub/deep.txt", &[], "x").await;

        let resp = send(&h, "PROPFIND", "/dav/col", &[("depth", "1")], "").await;
        assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
        let body = text(resp).await;
        assert_eq!(body.matches("<D:response>").count(), 3);
        assert!(body.contains("<D:href>/dav/col/</D:href>"));
        assert!(body.contains("<D:href>/dav/col/file.txt</D:href>"));
        assert!(body.contains("<D:href>/dav/col/sub/</D:href>"));
        assert!(!body.contains("deep.txt"));
        assert!(body.contains("<D:getcontentlength>3</D:getcontentlength>"));
        assert!(body.contains("<D:collection/>"));
    }

    #[tokio::test]
    async fn test_propfind_depth_zero_and_infinity() {
        let (_dir, h) = handler();
        send(&h, "MKCOL", "/dav/a", &[], "").await;
        send(&h, "MKCOL", "/dav/a/b", &[], "").await;
        send(&h, "PUT", "/dav/a/b/c.txt", &[], "c").await;

        let body = text(send(&h, "PROPFIND", "/dav/a", &[("depth", "0")], "").await).await;
        assert_eq!(body.matches("<D:response>").count(), 1);

        let body = text(send(&h, "PROPFIND", "/dav/a", &[], "").await).await;
        assert_eq!(body.matches("<D:response>").count(), 3);
        let a = body.find("/dav/a/</D:href>").unwrap();
        let b = body.find("/dav/a/b/</D:href>").unwrap();
        let c = body.find("/dav/a/b/c.txt</D:href>").unwrap();
        assert!(a < b && b < c);

        let resp = send(&h, "PROPFIND", "/dav/a", &[("depth", "2")], "").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = send(&h, "PROPFIND", "/dav/missing", &[], "").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_propfind_propname_and_named_props() {
        let (_dir, h) = handler();
        send(&h, "PUT", "/dav/f.txt", &[], "hello").await;

        let body = r#"<D:propfind xmlns:D="DAV:"><D:propname/></D:propfind>"#;
        let out = text(send(&h, "PROPFIND", "/dav/f.txt", &[("depth", "0")], body).await).await;
        assert!(out.contains("<D:getetag/>"));
        assert!(out.contains("<D:supportedlock/>"));

        let body = r#"<D:propfind xmlns:D="DAV:" xmlns:Z="urn:z">
            <D:prop><D:getcontentlength/><Z:missing/></D:prop></D:propfind>"#;
        let out = text(send(&h, "PROPFIND", "/dav/f.txt", &[("depth", "0")], body).await).await;
        assert!(out.contains("<D:getcontentlength>5</D:getcontentlength>"));
        assert!(out.contains("HTTP/1.1 404 Not Found"));

        let resp = send(&h, "PROPFIND", "/dav/f.txt", &[], "<D:bogus xmlns:D=\"DAV:\"/>").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_proppatch_then_propfind() {
        let (_dir, h) = handler();
        send(&h, "PUT", "/dav/p.txt", &[], "p").await;

        let resp = send(&h, "PROPPATCH", "/dav/p.txt", &[], PROPPATCH).await;
        assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
        assert!(text(resp).await.contains("HTTP/1.1 200 OK"));

        let body = r#"<D:propfind xmlns:D="DAV:" xmlns:Z="urn:example">
            <D:prop><Z:color/></D:prop></D:propfind>"#;
        let out = text(send(&h, "PROPFIND", "/dav/p.txt", &[("depth", "0")], body).await).await;
        assert!(out.contains("blue"));

        // 死属性随资源移动
        send(&h, "MOVE", "/dav/p.txt", &[("destination", "/dav/q.txt")], "").await;
        let out = text(send(&h, "PROPFIND", "/dav/q.txt", &[("depth", "0")], body).await).await;
        assert!(out.contains("blue"));

        let live = r#"<D:propertyupdate xmlns:D="DAV:">
            <D:set><D:prop><D:getetag>x</D:getetag></D:prop></D:set></D:propertyupdate>"#;
        let out = text(send(&h, "PROPPATCH", "/dav/q.txt", &[], live).await).await;
        assert!(out.contains("HTTP/1.1 403 Forbidden"));
        assert!(out.contains("cannot-modify-protected-property"));

        let resp = send(&h, "PROPPATCH", "/dav/none", &[], PROPPATCH).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_propfind_reports_lockdiscovery() {
        let (_dir, h) = handler();
        send(&h, "PUT", "/dav/l.txt", &[], "l").await;
        let lockinfo = r#"<D:lockinfo xmlns:D="DAV:">
            <D:lockscope><D:exclusive/></D:lockscope><D:locktype><D:write/></D:locktype>
            </D:lockinfo>"#;
        let resp = send(&h, "LOCK", "/dav/l.txt", &[("timeout", "Second-100")], lockinfo).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = r#"<D:propfind xmlns:D="DAV:"><D:prop><D:lockdiscovery/></D:prop></D:propfind>"#;
        let out = text(send(&h, "PROPFIND", "/dav/l.txt", &[("depth", "0")], body).await).await;
        assert!(out.contains("<D:activelock>"));
        assert!(out.contains("<D:lockroot><D:href>/dav/l.txt</D:href></D:lockroot>"));
    }

    #[tokio::test]
    async fn test_echoed_xml_carries_namespaces() {
        let (_dir, h) = handler();
        send(&h, "PUT", "/dav/n.txt", &[], "n").await;
        let patch = r#"<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
            <D:set><D:prop><Z:color><Z:shade>dark</Z:shade></Z:color></D:prop></D:set>
            </D:propertyupdate>"#;
        let resp = send(&h, "PROPPATCH", "/dav/n.txt", &[], patch).await;
        assert_eq!(resp.status(), StatusCode::MULTI_STATUS);

        let body = r#"<D:propfind xmlns:D="DAV:" xmlns:Z="urn:example">
            <D:prop><Z:color/></D:prop></D:propfind>"#;
        let out = text(send(&h, "PROPFIND", "/dav/n.txt", &[("depth", "0")], body).await).await;
        assert!(out.contains(
            r#"<color xmlns="urn:example"><Z:shade xmlns:Z="urn:example">dark</Z:shade></color>"#
        ));

        let lockinfo = r#"<D:lockinfo xmlns:D="DAV:" xmlns:O="urn:owner">
            <D:lockscope><D:exclusive/></D:lockscope><D:locktype><D:write/></D:locktype>
            <D:owner><O:name>Ann</O:name></D:owner>
            </D:lockinfo>"#;
        let resp = send(&h, "LOCK", "/dav/n.txt", &[], lockinfo).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(text(resp).await.contains(r#"<D:owner><O:name xmlns:O="urn:owner">Ann</O:name></D:owner>"#));
    }
}
