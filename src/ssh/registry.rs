// 会话注册表
// 会话 ID -> 会话 的映射，是会话生命周期的唯一持有者

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, error};

use super::error::SshError;
use super::session::Session;

/// 会话 ID（进程内单调计数 + 随机 UUID，不会复用）
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 会话注册表
///
/// 锁只在插入、查找、删除期间持有，不跨越任何 I/O
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    counter: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// 生成新的会话 ID
    pub fn next_id(&self) -> SessionId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        SessionId(format!("s{}-{}", n, uuid::Uuid::new_v4().simple()))
    }

    /// 注册会话
    pub fn create(&self, session: Session) -> SessionId {
        let id = session.id().clone();
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(&id) {
            // next_id 不会产生重复，出现即为调用方错误
            error!("[Registry] Refusing to overwrite live session {}", id);
            return id;
        }
        sessions.insert(id.clone(), Arc::new(session));
        debug!("[Registry] Registered session {} ({} live)", id, sessions.len());
        id
    }

    /// 获取会话
    pub fn get(&self, id: &SessionId) -> Result<Arc<Session>, SshError> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| SshError::NotFound(id.to_string()))
    }

    /// 移除会话
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if removed.is_some() {
            debug!("[Registry] Removed session {}", id);
        }
        removed
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// 所有活跃会话 ID 的快照
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
