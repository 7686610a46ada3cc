use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::debug;

use crate::{
    context::ConnectionContext,
    engine::{HandleId, NativeHandle, WeakHandle},
    error::ListenerError,
};

/// 原生句柄到连接上下文的短暂关联。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 协商回调与接受循环之间唯一共享的可变状态；多个并发协商插入、单个接受循环取出，
///   调用方无需额外加锁；
/// - 失败或被客户端放弃的尝试不会再回到 `accept`，条目不能依赖显式删除才能回收。
///
/// ## 逻辑（How）
/// - 条目只持有句柄的 [`WeakHandle`] 租约，不延长句柄寿命；引擎释放句柄后条目即视为过期；
/// - 每登记 [`REAP_INTERVAL`](Self::REAP_INTERVAL) 次执行一次 [`reap_expired`](Self::reap_expired)，
///   因此失败尝试造成的滞留条目数有上界；
/// - `resolve` 基于 `DashMap::remove`，天然是“取出即删除”的单次消费。
///
/// ## 契约（What）
/// - 同一存活句柄重复登记返回 [`ListenerError::DuplicateRegistration`]；
///   同一标识的旧条目若租约已失效，则被新条目覆盖；
/// - 条目从不被监听器之外的任何结构强引用。
pub struct PendingRegistry<C> {
    entries: DashMap<HandleId, PendingEntry<C>>,
    registrations: AtomicU64,
}

struct PendingEntry<C> {
    lease: WeakHandle,
    context: Arc<ConnectionContext<C>>,
}

impl<C> PendingRegistry<C> {
    /// 两次自动回收之间的登记次数。
    pub const REAP_INTERVAL: u64 = 64;

    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            registrations: AtomicU64::new(0),
        }
    }

    /// 以句柄为键登记上下文。
    pub fn register(
        &self,
        handle: &NativeHandle,
        context: Arc<ConnectionContext<C>>,
    ) -> Result<(), ListenerError> {
        let id = handle.id();
        let entry = PendingEntry {
            lease: handle.downgrade(),
            context,
        };
        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().lease.is_alive() {
                    return Err(ListenerError::DuplicateRegistration { handle: id });
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        // 分片锁已在上面的 match 结束时释放，回收需要遍历全部分片。
        let registered = self.registrations.fetch_add(1, Ordering::Relaxed) + 1;
        if registered % Self::REAP_INTERVAL == 0 {
            self.reap_expired();
        }
        Ok(())
    }

    /// 取出并删除句柄对应的上下文。
    pub fn resolve(&self, handle: HandleId) -> Option<Arc<ConnectionContext<C>>> {
        self.entries.remove(&handle).map(|(_, entry)| entry.context)
    }

    /// 删除所有租约已失效的条目，返回删除数量。
    pub fn reap_expired(&self) -> usize {
        let mut reaped = 0;
        self.entries.retain(|_, entry| {
            let alive = entry.lease.is_alive();
            if !alive {
                reaped += 1;
            }
            alive
        });
        if reaped > 0 {
            debug!(reaped, remaining = self.entries.len(), "pending registry reaped");
        }
        reaped
    }

    pub fn contains(&self, handle: HandleId) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<C> Default for PendingRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for PendingRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRegistry")
            .field("pending", &self.entries.len())
            .field("registrations", &self.registrations.load(Ordering::Relaxed))
            .finish()
    }
}
