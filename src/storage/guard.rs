//! 路径安全守卫
//!
//! 虚拟路径规范化，以及把虚拟路径安全地映射到本地根目录之下

use std::path::{Path, PathBuf};

use super::StorageError;

/// 规范化虚拟路径: 以 `/` 开头，无多余分隔符，`.`/`..` 已折叠，且不会越过根目录
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// 父目录（根目录的父目录是它自己）
pub fn parent_path(path: &str) -> String {
    let clean = clean_path(path);
    match clean.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => clean[..i].to_string(),
    }
}

/// 最后一段名称（根目录为空字符串）
pub fn base_name(path: &str) -> String {
    let clean = clean_path(path);
    clean.rsplit('/').next().unwrap_or_default().to_string()
}

/// 拼接目录与名称
pub fn join_path(dir: &str, name: &str) -> String {
    clean_path(&format!("{}/{}", dir, name))
}

/// 把相对路径限制在 `base` 之下（用户根目录）
pub fn join_jailed(base: &str, path: &str) -> String {
    let base = clean_path(base);
    let rel = clean_path(path);
    if base == "/" {
        rel
    } else if rel == "/" {
        base
    } else {
        format!("{}{}", base, rel)
    }
}

/// 路径安全守卫
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// 创建新的路径守卫
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 把虚拟路径映射为根目录下的本地路径
    pub fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        // 检查是否包含可疑的穿越序列
        if self.contains_traversal(path) {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }

        let clean = clean_path(path);
        let local = self.root.join(clean.trim_start_matches('/'));
        if !local.starts_with(&self.root) {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }
        Ok(local)
    }

    /// 检查路径是否包含穿越序列
    fn contains_traversal(&self, path: &str) -> bool {
        path.split(['/', '\\']).any(|seg| {
            let seg = seg.to_lowercase();
            seg == ".." || seg == "%2e%2e" || seg == "%252e%252e"
        })
    }
}
