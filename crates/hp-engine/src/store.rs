//! 协议与检查数据来源
//!
//! 协议存储只需同步查询；检查存储除同步的既往检查查询外，还支持异步获取完整元数据。

use crate::protocol::Protocol;
use async_trait::async_trait;
use chrono::NaiveDate;
use hp_core::{HpError, Result, Study, StudySummary};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// 协议存储
pub trait ProtocolStore: Send + Sync {
    /// 所有协议，按存储顺序
    fn all(&self) -> Vec<Protocol>;

    fn find(&self, protocol_id: &str) -> Option<Protocol> {
        self.all().into_iter().find(|protocol| protocol.id == protocol_id)
    }
}

/// 检查存储
#[async_trait]
pub trait StudyStore: Send + Sync {
    /// 患者在指定日期之前的检查，最近的在前
    fn prior_studies(&self, patient_id: &str, before: NaiveDate) -> Vec<StudySummary>;

    /// 获取检查的完整元数据 (含系列与实例)
    async fn fetch_study_metadata(&self, study_instance_uid: &str) -> Result<Study>;
}

/// 内存协议存储
#[derive(Debug, Clone, Default)]
pub struct InMemoryProtocolStore {
    protocols: Vec<Protocol>,
}

impl InMemoryProtocolStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从JSON协议数组加载，每个协议都经过验证
    pub fn from_json(json: &str) -> Result<Self> {
        let protocols: Vec<Protocol> = serde_json::from_str(json)?;
        let mut store = Self::new();
        for protocol in protocols {
            protocol.validate()?;
            store.insert(protocol);
        }
        debug!("Loaded {} protocol(s) from JSON", store.len());
        Ok(store)
    }

    /// 插入协议，已存在同id协议时替换
    pub fn insert(&mut self, protocol: Protocol) {
        match self.protocols.iter_mut().find(|p| p.id == protocol.id) {
            Some(existing) => *existing = protocol,
            None => self.protocols.push(protocol),
        }
    }

    pub fn remove(&mut self, protocol_id: &str) -> Option<Protocol> {
        let index = self.protocols.iter().position(|p| p.id == protocol_id)?;
        Some(self.protocols.remove(index))
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

impl ProtocolStore for InMemoryProtocolStore {
    fn all(&self) -> Vec<Protocol> {
        self.protocols.clone()
    }

    fn find(&self, protocol_id: &str) -> Option<Protocol> {
        self.protocols.iter().find(|p| p.id == protocol_id).cloned()
    }
}

/// 内存检查存储
#[derive(Debug, Default)]
pub struct InMemoryStudyStore {
    studies: HashMap<String, Study>,
    fetch_delay: Option<Duration>,
    fetch_count: AtomicUsize,
}

impl InMemoryStudyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟网络延迟
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn insert(&mut self, study: Study) {
        self.studies.insert(study.study_instance_uid.clone(), study);
    }

    pub fn with_study(mut self, study: Study) -> Self {
        self.insert(study);
        self
    }

    /// 已执行的元数据获取次数
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StudyStore for InMemoryStudyStore {
    fn prior_studies(&self, patient_id: &str, before: NaiveDate) -> Vec<StudySummary> {
        let mut priors: Vec<StudySummary> = self
            .studies
            .values()
            .filter(|study| study.patient_id == patient_id && study.study_date < before)
            .map(Study::summary)
            .collect();

        // 同日检查按UID排序，保证顺序确定
        priors.sort_by(|a, b| {
            b.study_date
                .cmp(&a.study_date)
                .then_with(|| a.study_instance_uid.cmp(&b.study_instance_uid))
        });
        priors
    }

    async fn fetch_study_metadata(&self, study_instance_uid: &str) -> Result<Study> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }

        self.studies
            .get(study_instance_uid)
            .cloned()
            .ok_or_else(|| HpError::Fetch(format!("Study {} not available", study_instance_uid)))
    }
}
