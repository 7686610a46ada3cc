use parking_lot::Mutex;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Notify;

/// 取消令牌：`accept`、协商回调与引擎关闭共用的取消信号。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 监听器关闭、调用方放弃 `accept`、单次尝试超时，本质都是“停止等待”，
///   统一用同一原语表达，避免在状态机之外再引入临时标志位；
/// - 相比轮询原子位，借助 [`Notify`] 可以在取消发生的瞬间唤醒所有等待者。
///
/// ## 逻辑（How）
/// - `flag` 记录是否已取消，`cancel` 通过 CAS 保证只触发一次；
/// - `children` 保存子令牌的弱引用，父令牌取消时级联取消仍存活的子令牌；
/// - `cancelled()` 先注册 `Notified` 再检查标志位，避免错过并发的 `notify_waiters`。
///
/// ## 契约（What）
/// - `cancel` 返回 `true` 表示本次调用首次触发取消；
/// - `child` 派生的令牌可单独取消，不影响父令牌；
/// - **后置条件**：一旦取消，`is_cancelled` 永远返回 `true`。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<CancellationState>>>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 标记取消并唤醒所有等待者。
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// 派生子令牌：父令牌取消时子令牌随之取消，反之不成立。
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut children = self.inner.children.lock();
        if self.is_cancelled() {
            child.inner.cancel();
        } else {
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        drop(children);
        child
    }

    /// 挂起直到令牌被取消；已取消时立即返回。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl CancellationState {
    fn cancel(&self) -> bool {
        if self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
        true
    }
}
