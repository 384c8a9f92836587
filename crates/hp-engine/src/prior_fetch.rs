//! 既往检查按需加载
//!
//! 每个检查UID同时最多只有一个获取任务，重复请求只追加等待者和请求的抽象序号。
//! 等待者记录发起请求时视口的代数；阶段或协议切换会递增代数，
//! 完成时代数已变化的等待者被丢弃。

use crate::image_matcher::PriorReference;
use crate::store::StudyStore;
use hp_core::{Result, Study};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 等待获取结果的视口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchWaiter {
    pub viewport_index: usize,
    pub generation: u64,
}

/// 获取任务的完成通知
#[derive(Debug)]
pub struct FetchCompletion {
    pub study_instance_uid: String,
    pub result: Result<Study>,
}

/// 已结算的获取任务
#[derive(Debug)]
pub struct SettledFetch {
    pub study_instance_uid: String,
    /// 各视口请求该检查时使用的抽象序号，按请求顺序去重
    pub abstract_prior_values: Vec<i64>,
    pub result: Result<Study>,
    pub waiters: Vec<FetchWaiter>,
}

/// 请求结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRequestOutcome {
    /// 新建了获取任务
    Started,
    /// 已有同一检查的获取任务，追加为等待者
    Coalesced,
    /// 无法获取 (没有运行时，或该检查此前获取失败)
    Unavailable,
}

#[derive(Debug)]
struct PendingFetch {
    abstract_prior_values: Vec<i64>,
    waiters: Vec<FetchWaiter>,
}

/// 既往检查获取跟踪器
pub struct PriorFetchTracker {
    store: Arc<dyn StudyStore>,
    pending: HashMap<String, PendingFetch>,
    failed: HashSet<String>,
    generations: HashMap<usize, u64>,
    sender: mpsc::UnboundedSender<FetchCompletion>,
    receiver: mpsc::UnboundedReceiver<FetchCompletion>,
}

impl PriorFetchTracker {
    pub fn new(store: Arc<dyn StudyStore>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            store,
            pending: HashMap::new(),
            failed: HashSet::new(),
            generations: HashMap::new(),
            sender,
            receiver,
        }
    }

    /// 视口当前代数
    pub fn generation(&self, viewport_index: usize) -> u64 {
        self.generations.get(&viewport_index).copied().unwrap_or(0)
    }

    /// 递增所有视口的代数，使已登记的等待者失效
    pub fn invalidate_all(&mut self) {
        for generation in self.generations.values_mut() {
            *generation += 1;
        }
    }

    /// 等待者是否仍然有效
    pub fn is_current(&self, waiter: &FetchWaiter) -> bool {
        self.generation(waiter.viewport_index) == waiter.generation
    }

    /// 请求获取视口引用的既往检查
    pub fn request(&mut self, reference: &PriorReference, viewport_index: usize) -> FetchRequestOutcome {
        let uid = reference.study.study_instance_uid.clone();
        let generation = *self.generations.entry(viewport_index).or_insert(0);
        let waiter = FetchWaiter {
            viewport_index,
            generation,
        };

        if let Some(pending) = self.pending.get_mut(&uid) {
            if !pending.waiters.contains(&waiter) {
                pending.waiters.push(waiter);
            }
            if !pending.abstract_prior_values.contains(&reference.abstract_prior_value) {
                pending.abstract_prior_values.push(reference.abstract_prior_value);
            }
            debug!(
                "Coalesced fetch of prior study {} (abstract prior value {}) for viewport {}",
                uid, reference.abstract_prior_value, viewport_index
            );
            return FetchRequestOutcome::Coalesced;
        }

        if self.failed.contains(&uid) {
            return FetchRequestOutcome::Unavailable;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available, skipping fetch of prior study {}", uid);
                return FetchRequestOutcome::Unavailable;
            }
        };

        info!(
            "Fetching prior study {} (abstract prior value {}) for viewport {}",
            uid, reference.abstract_prior_value, viewport_index
        );

        let store = Arc::clone(&self.store);
        let sender = self.sender.clone();
        let task_uid = uid.clone();
        handle.spawn(async move {
            let result = store.fetch_study_metadata(&task_uid).await;
            let completion = FetchCompletion {
                study_instance_uid: task_uid,
                result,
            };
            if sender.send(completion).is_err() {
                debug!("Prior fetch finished after tracker was dropped");
            }
        });

        self.pending.insert(
            uid,
            PendingFetch {
                abstract_prior_values: vec![reference.abstract_prior_value],
                waiters: vec![waiter],
            },
        );
        FetchRequestOutcome::Started
    }

    /// 取出一个已完成的获取任务 (不等待)
    pub fn try_next_completion(&mut self) -> Option<SettledFetch> {
        let completion = self.receiver.try_recv().ok()?;
        Some(self.settle(completion))
    }

    /// 等待下一个获取任务完成，没有待完成任务时返回 `None`
    pub async fn next_completion(&mut self) -> Option<SettledFetch> {
        if self.pending.is_empty() {
            return None;
        }
        let completion = self.receiver.recv().await?;
        Some(self.settle(completion))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, study_instance_uid: &str) -> bool {
        self.pending.contains_key(study_instance_uid)
    }

    fn settle(&mut self, completion: FetchCompletion) -> SettledFetch {
        let (abstract_prior_values, waiters) = self
            .pending
            .remove(&completion.study_instance_uid)
            .map(|pending| (pending.abstract_prior_values, pending.waiters))
            .unwrap_or_default();

        if completion.result.is_err() {
            self.failed.insert(completion.study_instance_uid.clone());
        }

        SettledFetch {
            study_instance_uid: completion.study_instance_uid,
            abstract_prior_values,
            result: completion.result,
            waiters,
        }
    }
}

impl std::fmt::Debug for PriorFetchTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorFetchTracker")
            .field("pending", &self.pending)
            .field("failed", &self.failed)
            .field("generations", &self.generations)
            .finish()
    }
}
