//! 内存锁表
//!
//! 每个被锁定路径及其所有祖先各有一个节点：
//! - 节点的 `token` 非空表示该路径本身持有锁；为空的节点只用于计数
//! - `ref_count` 记录自身及所有被锁定后代的数量，归零时节点被删除
//! - 有期限的锁按到期时间放入带索引的小顶堆，提前解锁时可以 O(log n) 移除
//!
//! 所有操作开始前先惰性清理已过期的锁；整张表由一把互斥锁保护。

use super::if_header::Condition;
use crate::storage::clean_path;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// 锁操作错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("资源已被锁定")]
    Locked,
    #[error("锁令牌不存在")]
    NoSuchLock,
    #[error("锁条件确认失败")]
    ConfirmationFailed,
    #[error("锁令牌不作用于该资源")]
    Forbidden,
}

/// 锁描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDetails {
    /// 锁定的路径
    pub root: String,
    /// 有效期，None 表示永不过期
    pub duration: Option<Duration>,
    /// 客户端提供的 `<D:owner>` 原始 XML
    pub owner_xml: String,
    /// true 表示只锁定资源本身
    pub zero_depth: bool,
}

/// 某个资源上生效的锁
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLock {
    pub token: String,
    pub details: LockDetails,
}

#[derive(Debug)]
struct LockNode {
    details: LockDetails,
    token: String,
    ref_count: usize,
    expiry: Option<Instant>,
    /// 在到期堆中的下标
    heap_index: Option<usize>,
    /// 正被某个请求确认持有
    held: bool,
}

#[derive(Debug, Default)]
struct LockTable {
    by_name: HashMap<String, LockNode>,
    by_token: HashMap<String, String>,
    /// 按到期时间排列的小顶堆，元素为节点路径
    heap: Vec<String>,
}

/// 从路径本身一直走到根目录: `/a/b` → `/a/b`, `/a`, `/`
fn ancestors(name: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(name), |n| {
        if *n == "/" {
            return None;
        }
        match n.rfind('/') {
            Some(0) => Some("/"),
            Some(i) => Some(&n[..i]),
            None => None,
        }
    })
}

fn new_token() -> String {
    format!("opaquelocktoken:{}", uuid::Uuid::new_v4())
}

impl LockTable {
    fn expiry_at(&self, i: usize) -> Option<Instant> {
        self.by_name.get(&self.heap[i]).and_then(|n| n.expiry)
    }

    fn heap_swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        for k in [i, j] {
            if let Some(node) = self.by_name.get_mut(&self.heap[k]) {
                node.heap_index = Some(k);
            }
        }
    }

    fn heap_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.expiry_at(i) >= self.expiry_at(parent) {
                break;
            }
            self.heap_swap(i, parent);
            i = parent;
        }
    }

    fn heap_down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut min = left;
            if left + 1 < n && self.expiry_at(left + 1) < self.expiry_at(left) {
                min = left + 1;
            }
            if self.expiry_at(min) >= self.expiry_at(i) {
                break;
            }
            self.heap_swap(i, min);
            i = min;
        }
    }

    fn heap_push(&mut self, name: &str) {
        self.heap.push(name.to_string());
        let i = self.heap.len() - 1;
        if let Some(node) = self.by_name.get_mut(name) {
            node.heap_index = Some(i);
        }
        self.heap_up(i);
    }

    fn heap_remove(&mut self, i: usize) {
        let last = self.heap.len() - 1;
        if i != last {
            self.heap_swap(i, last);
        }
        if let Some(name) = self.heap.pop() {
            if let Some(node) = self.by_name.get_mut(&name) {
                node.heap_index = None;
            }
        }
        if i < self.heap.len() {
            self.heap_down(i);
            self.heap_up(i);
        }
    }

    fn collect_expired(&mut self, now: Instant) {
        while let Some(first) = self.heap.first() {
            match self.by_name.get(first).and_then(|n| n.expiry) {
                Some(expiry) if now >= expiry => {
                    let name = first.clone();
                    debug!("锁已过期: {}", name);
                    self.remove(&name);
                }
                _ => break,
            }
        }
    }

    fn can_create(&self, name: &str, zero_depth: bool) -> bool {
        ancestors(name).enumerate().all(|(i, name0)| {
            let Some(node) = self.by_name.get(name0) else {
                return true;
            };
            if i == 0 {
                if !node.token.is_empty() {
                    // 目标本身已被锁定
                    return false;
                }
                if !zero_depth {
                    // 节点存在说明有后代被锁定
                    return node.ref_count == 0;
                }
                true
            } else {
                // 祖先持有无限深度锁
                node.token.is_empty() || node.details.zero_depth
            }
        })
    }

    fn create(&mut self, now: Instant, mut details: LockDetails) -> Result<String, LockError> {
        self.collect_expired(now);
        details.root = clean_path(&details.root);
        if !self.can_create(&details.root, details.zero_depth) {
            return Err(LockError::Locked);
        }

        for name in ancestors(&details.root) {
            let node = self.by_name.entry(name.to_string()).or_insert_with(|| LockNode {
                details: LockDetails {
                    root: name.to_string(),
                    duration: None,
                    owner_xml: String::new(),
                    zero_depth: false,
                },
                token: String::new(),
                ref_count: 0,
                expiry: None,
                heap_index: None,
                held: false,
            });
            node.ref_count += 1;
        }

        let token = new_token();
        let root = details.root.clone();
        let expiry = details.duration.map(|d| now + d);
        if let Some(node) = self.by_name.get_mut(&root) {
            node.token = token.clone();
            node.details = details;
            node.expiry = expiry;
        }
        self.by_token.insert(token.clone(), root.clone());
        if expiry.is_some() {
            self.heap_push(&root);
        }
        Ok(token)
    }

    fn remove(&mut self, root: &str) {
        let (token, heap_index) = match self.by_name.get_mut(root) {
            Some(node) => (std::mem::take(&mut node.token), node.heap_index),
            None => return,
        };
        if let Some(i) = heap_index {
            self.heap_remove(i);
        }
        self.by_token.remove(&token);

        for name in ancestors(root) {
            let drop_node = match self.by_name.get_mut(name) {
                Some(node) => {
                    node.ref_count -= 1;
                    node.ref_count == 0
                }
                None => false,
            };
            if drop_node {
                self.by_name.remove(name);
            }
        }
    }

    fn node_by_token(&self, token: &str) -> Option<&LockNode> {
        self.by_token.get(token).and_then(|root| self.by_name.get(root))
    }

    fn node_by_token_mut(&mut self, token: &str) -> Option<&mut LockNode> {
        let root = self.by_token.get(token)?;
        self.by_name.get_mut(root)
    }

    /// 找到第一个覆盖 `name` 且未被持有的锁
    fn lookup(&self, name: &str, conditions: &[Condition]) -> Option<String> {
        for cond in conditions {
            if cond.not || cond.token.is_empty() {
                continue;
            }
            let Some(node) = self.node_by_token(&cond.token) else {
                continue;
            };
            if node.held {
                continue;
            }
            let root = &node.details.root;
            if name == root {
                return Some(cond.token.clone());
            }
            if node.details.zero_depth {
                continue;
            }
            if root == "/" || name.starts_with(&format!("{}/", root)) {
                return Some(cond.token.clone());
            }
        }
        None
    }

    fn unlock(&mut self, now: Instant, token: &str) -> Result<(), LockError> {
        self.collect_expired(now);
        let node = self.node_by_token(token).ok_or(LockError::NoSuchLock)?;
        if node.held {
            return Err(LockError::Locked);
        }
        let root = node.details.root.clone();
        self.remove(&root);
        Ok(())
    }
}

/// 内存锁管理器
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    table: Arc<Mutex<LockTable>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 确认请求可以操作 `a` / `b`
    ///
    /// 没有条件时在两个路径上创建临时的零深度锁；有条件时要求每个路径都能找到
    /// 一个覆盖它且未被持有的锁，并在返回的守卫释放前保持持有。
    pub fn confirm(
        &self,
        now: Instant,
        a: Option<&str>,
        b: Option<&str>,
        conditions: &[Condition],
    ) -> Result<LockRelease, LockError> {
        let mut table = self.table.lock();
        table.collect_expired(now);

        let a = a.map(clean_path);
        let b = b.map(clean_path).filter(|b| Some(b) != a.as_ref());

        if conditions.is_empty() {
            let mut temporary = Vec::new();
            for name in [a, b].into_iter().flatten() {
                let details = LockDetails {
                    root: name,
                    duration: None,
                    owner_xml: String::new(),
                    zero_depth: true,
                };
                match table.create(now, details) {
                    Ok(token) => temporary.push(token),
                    Err(e) => {
                        for token in &temporary {
                            let _ = table.unlock(now, token);
                        }
                        return Err(e);
                    }
                }
            }
            return Ok(LockRelease {
                table: Arc::clone(&self.table),
                held: Vec::new(),
                temporary,
            });
        }

        // 列表中的每个令牌都必须指向一个未被持有的锁
        let all_live = conditions
            .iter()
            .filter(|c| !c.not && !c.token.is_empty())
            .all(|c| table.node_by_token(&c.token).is_some_and(|node| !node.held));
        if !all_live {
            return Err(LockError::ConfirmationFailed);
        }

        let mut held = Vec::new();
        for name in [a, b].into_iter().flatten() {
            let token = table
                .lookup(&name, conditions)
                .ok_or(LockError::ConfirmationFailed)?;
            if !held.contains(&token) {
                held.push(token);
            }
        }
        for token in &held {
            if let Some(node) = table.node_by_token_mut(token) {
                node.held = true;
            }
        }
        Ok(LockRelease {
            table: Arc::clone(&self.table),
            held,
            temporary: Vec::new(),
        })
    }

    /// 创建锁，返回新令牌
    pub fn create(&self, now: Instant, details: LockDetails) -> Result<String, LockError> {
        let token = self.table.lock().create(now, details)?;
        debug!("创建锁: {}", token);
        Ok(token)
    }

    /// 刷新锁的有效期
    pub fn refresh(
        &self,
        now: Instant,
        token: &str,
        duration: Option<Duration>,
    ) -> Result<LockDetails, LockError> {
        let mut table = self.table.lock();
        table.collect_expired(now);

        let (root, heap_index) = {
            let node = table.node_by_token(token).ok_or(LockError::NoSuchLock)?;
            if node.held {
                return Err(LockError::Locked);
            }
            (node.details.root.clone(), node.heap_index)
        };
        if let Some(i) = heap_index {
            table.heap_remove(i);
        }

        let expiry = duration.map(|d| now + d);
        let details = match table.by_name.get_mut(&root) {
            Some(node) => {
                node.details.duration = duration;
                node.expiry = expiry;
                node.details.clone()
            }
            None => return Err(LockError::NoSuchLock),
        };
        if expiry.is_some() {
            table.heap_push(&root);
        }
        Ok(details)
    }

    /// 解锁
    pub fn unlock(&self, now: Instant, token: &str) -> Result<(), LockError> {
        self.table.lock().unlock(now, token)?;
        debug!("解锁: {}", token);
        Ok(())
    }

    /// 解锁，且要求锁作用于 `path`（锁根或无限深度锁的后代）
    pub fn unlock_at(&self, now: Instant, token: &str, path: &str) -> Result<(), LockError> {
        let mut table = self.table.lock();
        table.collect_expired(now);
        let path = clean_path(path);
        let node = table.node_by_token(token).ok_or(LockError::NoSuchLock)?;
        let root = &node.details.root;
        let in_scope = *root == path
            || (!node.details.zero_depth
                && (root == "/" || path.starts_with(&format!("{}/", root))));
        if !in_scope {
            return Err(LockError::Forbidden);
        }
        table.unlock(now, token)
    }

    /// 是否可以在 `name` 上创建锁
    pub fn can_create(&self, name: &str, zero_depth: bool) -> bool {
        self.table.lock().can_create(&clean_path(name), zero_depth)
    }

    /// 覆盖 `path` 的所有锁（自身的锁与祖先的无限深度锁）
    pub fn active_locks(&self, now: Instant, path: &str) -> Vec<ActiveLock> {
        let mut table = self.table.lock();
        table.collect_expired(now);
        let path = clean_path(path);
        ancestors(&path)
            .enumerate()
            .filter_map(|(i, name)| table.by_name.get(name).map(|n| (i, n)))
            .filter(|(i, n)| !n.token.is_empty() && (*i == 0 || !n.details.zero_depth))
            .map(|(_, n)| ActiveLock {
                token: n.token.clone(),
                details: n.details.clone(),
            })
            .collect()
    }
}

/// `confirm` 返回的守卫，Drop 时释放持有的锁并删除临时锁
#[must_use = "守卫释放时锁即被释放"]
#[derive(Debug)]
pub struct LockRelease {
    table: Arc<Mutex<LockTable>>,
    held: Vec<String>,
    temporary: Vec<String>,
}

impl LockRelease {
    pub fn release(self) {}
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        for token in &self.held {
            if let Some(node) = table.node_by_token_mut(token) {
                node.held = false;
            }
        }
        let now = Instant::now();
        for token in self.temporary.iter().rev() {
            let _ = table.unlock(now, token);
        }
    }
}
