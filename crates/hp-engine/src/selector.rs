//! 协议选择器
//!
//! 将所有协议的匹配规则 (外加合成的既往检查数量规则) 应用于主检查，按得分排序；
//! 没有协议得分大于0时回退到默认协议。

use crate::protocol::Protocol;
use crate::settings::EngineSettings;
use crate::store::{ProtocolStore, StudyStore};
use hp_core::{HpError, Result, Study, StudySummary};
use hp_matching::{Constraint, Rule, RuleMatcher};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// 合成的既往检查数量属性
pub const NUMBER_OF_PRIORS_REFERENCED: &str = "numberOfPriorsReferenced";
/// 既往检查的抽象序号属性
pub const ABSTRACT_PRIOR_VALUE: &str = "abstractPriorValue";
/// 既往检查与当前检查的相对时间 (天)
pub const RELATIVE_TIME: &str = "relativeTime";

/// 协议匹配结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMatch {
    pub score: f64,
    pub protocol: Protocol,
}

/// 已匹配协议条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedProtocol {
    pub protocol: Protocol,
    pub score: f64,
    pub selected: bool,
}

/// 已匹配协议集合，供界面列出候选协议
#[derive(Debug, Clone, Default)]
pub struct MatchedProtocols {
    entries: Vec<MatchedProtocol>,
}

impl MatchedProtocols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 加入协议，已存在时保留较高得分
    pub fn upsert(&mut self, protocol: &Protocol, score: f64) {
        match self.entries.iter_mut().find(|e| e.protocol.id == protocol.id) {
            Some(entry) => {
                if score > entry.score {
                    entry.score = score;
                }
            }
            None => self.entries.push(MatchedProtocol {
                protocol: protocol.clone(),
                score,
                selected: false,
            }),
        }
    }

    /// 得分最高的协议，同分时先加入者优先
    pub fn best(&self) -> Option<&MatchedProtocol> {
        let mut best: Option<&MatchedProtocol> = None;
        for entry in &self.entries {
            if best.map_or(true, |b| entry.score > b.score) {
                best = Some(entry);
            }
        }
        best
    }

    /// 将指定协议标记为选中，其余全部取消
    pub fn select(&mut self, protocol_id: &str) -> bool {
        let mut found = false;
        for entry in &mut self.entries {
            entry.selected = entry.protocol.id == protocol_id;
            found |= entry.selected;
        }
        found
    }

    pub fn selected(&self) -> Option<&MatchedProtocol> {
        self.entries.iter().find(|e| e.selected)
    }

    pub fn entries(&self) -> &[MatchedProtocol] {
        &self.entries
    }

    pub fn get(&self, protocol_id: &str) -> Option<&MatchedProtocol> {
        self.entries.iter().find(|e| e.protocol.id == protocol_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 协议选择器
pub struct ProtocolSelector {
    protocols: Arc<dyn ProtocolStore>,
    studies: Arc<dyn StudyStore>,
    matcher: RuleMatcher,
    settings: EngineSettings,
    matched: MatchedProtocols,
}

impl ProtocolSelector {
    pub fn new(
        protocols: Arc<dyn ProtocolStore>,
        studies: Arc<dyn StudyStore>,
        matcher: RuleMatcher,
        settings: EngineSettings,
    ) -> Self {
        Self {
            protocols,
            studies,
            matcher,
            settings,
            matched: MatchedProtocols::new(),
        }
    }

    /// 患者在该检查之前的检查数量
    pub fn number_of_available_priors(&self, study: &Study) -> usize {
        self.studies
            .prior_studies(&study.patient_id, study.study_date)
            .len()
    }

    /// 合成的既往检查数量规则
    pub fn prior_count_rule(&self, protocol: &Protocol) -> Rule {
        let rule = Rule::new(
            NUMBER_OF_PRIORS_REFERENCED,
            Constraint::greater_than_or_equal_to(protocol.number_of_priors_referenced as f64),
        );
        if self.settings.prior_rule_required {
            rule.required()
        } else {
            rule
        }
    }

    /// 对单个检查匹配所有协议
    ///
    /// 返回得分大于0的协议，按得分降序；同分保持存储顺序。
    /// 没有任何匹配时返回得分为1的默认协议。
    pub fn find_match_by_study(&self, study: &Study) -> Result<Vec<ProtocolMatch>> {
        let mut attributes = study.attributes();
        attributes.insert(NUMBER_OF_PRIORS_REFERENCED, self.number_of_available_priors(study));

        let mut matched = Vec::new();
        for protocol in self.protocols.all() {
            if protocol.protocol_matching_rules.is_empty() {
                continue;
            }

            // 合成规则只用于本次评估，不写回协议
            let mut rules = protocol.protocol_matching_rules.clone();
            rules.push(self.prior_count_rule(&protocol));

            let result = self.matcher.match_attributes(&attributes, &rules);
            debug!(
                "Protocol {} scored {} for study {}",
                protocol.id, result.score, study.study_instance_uid
            );

            if result.is_positive() {
                matched.push(ProtocolMatch {
                    score: result.score,
                    protocol,
                });
            }
        }

        if matched.is_empty() {
            let protocol = self.default_protocol()?;
            debug!(
                "No protocol matched study {}, falling back to {}",
                study.study_instance_uid, protocol.id
            );
            return Ok(vec![ProtocolMatch { score: 1.0, protocol }]);
        }

        sort_by_score(&mut matched, |m| m.score);
        Ok(matched)
    }

    /// 重新计算已匹配协议集合 (先清空再填充)
    pub fn update_matches(&mut self, studies: &[Study]) -> Result<()> {
        self.matched.clear();

        for study in studies {
            for matched in self.find_match_by_study(study)? {
                self.matched.upsert(&matched.protocol, matched.score);
            }
        }

        info!(
            "Matched {} protocol(s) across {} study(ies)",
            self.matched.len(),
            studies.len()
        );
        Ok(())
    }

    /// 最佳匹配协议
    ///
    /// 会刷新已匹配协议集合。没有可用检查时直接返回默认协议。
    pub fn get_best_match(&mut self, studies: &[Study]) -> Result<Protocol> {
        self.update_matches(studies)?;

        match self.matched.best() {
            Some(best) => Ok(best.protocol.clone()),
            None => {
                let protocol = self.default_protocol()?;
                self.matched.upsert(&protocol, 1.0);
                Ok(protocol)
            }
        }
    }

    /// 查找与协议相关的既往检查
    ///
    /// 既往检查按时间从近到远编号 1..n，最早的一个编号为 -1，
    /// 并附加相对时间 (天)；只保留得分大于0的检查，按得分降序。
    pub fn find_related_studies(&self, protocol: &Protocol, study: &Study) -> Vec<StudySummary> {
        if protocol.protocol_matching_rules.is_empty() {
            return Vec::new();
        }

        let priors = self.studies.prior_studies(&study.patient_id, study.study_date);
        let last_index = priors.len().saturating_sub(1);

        let mut related: Vec<(f64, StudySummary)> = Vec::new();
        for (index, mut prior) in priors.into_iter().enumerate() {
            let abstract_prior_value = if index == last_index { -1 } else { index as i64 + 1 };
            let relative_days = (study.study_date - prior.study_date).num_days();
            prior.extra.insert(ABSTRACT_PRIOR_VALUE, abstract_prior_value);
            prior.extra.insert(RELATIVE_TIME, relative_days);

            let result = self
                .matcher
                .match_attributes(&prior.attributes(), &protocol.protocol_matching_rules);
            if result.is_positive() {
                related.push((result.score, prior));
            }
        }

        sort_by_score(&mut related, |(score, _)| *score);
        related.into_iter().map(|(_, prior)| prior).collect()
    }

    pub fn matched(&self) -> &MatchedProtocols {
        &self.matched
    }

    pub fn matched_mut(&mut self) -> &mut MatchedProtocols {
        &mut self.matched
    }

    pub fn protocol_store(&self) -> &Arc<dyn ProtocolStore> {
        &self.protocols
    }

    fn default_protocol(&self) -> Result<Protocol> {
        self.protocols
            .find(&self.settings.default_protocol_id)
            .ok_or_else(|| {
                HpError::NotFound(format!(
                    "Default protocol {} not found",
                    self.settings.default_protocol_id
                ))
            })
    }
}

/// 按得分降序的稳定排序
fn sort_by_score<T>(items: &mut [T], score: impl Fn(&T) -> f64) {
    items.sort_by(|a, b| score(b).partial_cmp(&score(a)).unwrap_or(Ordering::Equal));
}
