//! 图像匹配器
//!
//! 对单个视口按 检查 -> 系列 -> 实例 三级逐层收窄，选出最佳图像。
//! 检查级和系列级同分时后出现者替换当前最佳；实例级按三级得分之和排序，
//! 同分时保留先出现者。

use crate::protocol::Viewport;
use crate::selector::ABSTRACT_PRIOR_VALUE;
use crate::store::StudyStore;
use hp_core::{Series, Study, StudySummary};
use hp_matching::{MatchDetails, MatchResult, Rule, RuleMatcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 单个候选图像的匹配信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetails {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub current_image_id_index: usize,
    /// 实例、系列、检查三级得分之和
    pub matching_score: f64,
    pub match_details: MatchDetails,
}

/// 视口的图像匹配结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMatchDetails {
    pub best_match: Option<ImageDetails>,
    /// 被评估的实例，用于诊断
    ///
    /// 只包含逐层收窄后选中检查中选中系列的图像实例，其他检查和系列不在其中。
    pub matching_scores: Vec<ImageDetails>,
}

/// 视口引用但尚未加载的既往检查
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorReference {
    pub abstract_prior_value: i64,
    pub study: StudySummary,
}

/// 已加载检查上标记的抽象序号
pub fn tagged_prior_value(study: &Study) -> Option<i64> {
    study.extra.get(ABSTRACT_PRIOR_VALUE)?.as_i64()
}

/// 按抽象序号定位既往检查
///
/// `priors` 按日期从近到远排列。-1 表示最早的既往检查，N >= 1 表示第N近的检查；
/// 0 表示当前检查，其余值无对应。
pub fn resolve_prior(priors: &[StudySummary], abstract_prior_value: i64) -> Option<&StudySummary> {
    match abstract_prior_value {
        -1 => priors.last(),
        n if n >= 1 => priors.get((n - 1) as usize),
        _ => None,
    }
}

/// 图像匹配器
#[derive(Debug, Clone, Default)]
pub struct ImageMatcher {
    matcher: RuleMatcher,
}

impl ImageMatcher {
    pub fn new(matcher: RuleMatcher) -> Self {
        Self { matcher }
    }

    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    /// 在已加载检查中为视口选择最佳图像
    ///
    /// 只使用当前已加载的检查；引用的既往检查由 [`ImageMatcher::prior_requests`] 单独给出。
    pub fn match_images(&self, viewport: &Viewport, studies: &[Study]) -> ImageMatchDetails {
        let mut details = ImageMatchDetails::default();

        let Some((study, study_result)) = self.best_candidate(
            studies.iter().filter(|study| study.series_list.iter().any(Series::has_images)),
            &viewport.study_matching_rules,
            Study::attributes,
        ) else {
            debug!("No study candidate for viewport");
            return details;
        };

        let Some((series, series_result)) = self.best_candidate(
            study.series_list.iter().filter(|series| series.has_images()),
            &viewport.series_matching_rules,
            Series::attributes,
        ) else {
            debug!("No series candidate in study {}", study.study_instance_uid);
            return details;
        };

        let mut best_score = 0.0;
        for (index, instance) in series.instances.iter().enumerate() {
            if !instance.is_image() {
                continue;
            }

            let instance_result = self
                .matcher
                .match_attributes(&instance.attributes(index), &viewport.image_matching_rules);

            let mut match_details = instance_result.details.clone();
            match_details.merge(&series_result.details);
            match_details.merge(&study_result.details);

            let image = ImageDetails {
                study_instance_uid: study.study_instance_uid.clone(),
                series_instance_uid: series.series_instance_uid.clone(),
                sop_instance_uid: instance.sop_instance_uid.clone(),
                current_image_id_index: index,
                matching_score: instance_result.score + series_result.score + study_result.score,
                match_details,
            };

            if details.best_match.is_none() || image.matching_score > best_score {
                best_score = image.matching_score;
                details.best_match = Some(image.clone());
            }
            details.matching_scores.push(image);
        }

        details
    }

    /// 视口检查规则引用、但 `loaded` 中没有以该抽象序号标记的既往检查
    ///
    /// `loaded` 的第一个元素为当前检查。同一检查可能以不同序号被多次引用，
    /// 每个序号各需一个标记副本。
    pub fn prior_requests(
        &self,
        viewport: &Viewport,
        loaded: &[Study],
        store: &dyn StudyStore,
    ) -> Vec<PriorReference> {
        let Some(primary) = loaded.first() else {
            return Vec::new();
        };

        let mut priors: Option<Vec<StudySummary>> = None;
        let mut requests: Vec<PriorReference> = Vec::new();

        for rule in &viewport.study_matching_rules {
            if rule.attribute != ABSTRACT_PRIOR_VALUE {
                continue;
            }

            let Some(abstract_prior_value) = rule.constraint.integer_operand() else {
                warn!(
                    "Ignoring {} rule with non-integer constraint {}",
                    ABSTRACT_PRIOR_VALUE,
                    rule.constraint.validator_name()
                );
                continue;
            };

            if abstract_prior_value == 0 {
                continue;
            }

            let priors = priors.get_or_insert_with(|| {
                store.prior_studies(&primary.patient_id, primary.study_date)
            });

            let Some(prior) = resolve_prior(priors, abstract_prior_value) else {
                debug!(
                    "No prior study for {} = {} (patient {})",
                    ABSTRACT_PRIOR_VALUE, abstract_prior_value, primary.patient_id
                );
                continue;
            };

            let uid = &prior.study_instance_uid;
            let already_known = loaded.iter().any(|s| {
                &s.study_instance_uid == uid && tagged_prior_value(s) == Some(abstract_prior_value)
            }) || requests.iter().any(|r| {
                &r.study.study_instance_uid == uid && r.abstract_prior_value == abstract_prior_value
            });
            if !already_known {
                requests.push(PriorReference {
                    abstract_prior_value,
                    study: prior.clone(),
                });
            }
        }

        requests
    }

    /// 在候选集中选择得分不低于当前最佳的最后一个
    ///
    /// 规则非空时得分为0的候选直接跳过。
    fn best_candidate<'a, T: 'a>(
        &self,
        candidates: impl Iterator<Item = &'a T>,
        rules: &[Rule],
        attributes: impl Fn(&T) -> hp_core::AttributeBag,
    ) -> Option<(&'a T, MatchResult)> {
        let mut best: Option<(&'a T, MatchResult)> = None;

        for candidate in candidates {
            let result = self.matcher.match_attributes(&attributes(candidate), rules);
            if !rules.is_empty() && !result.is_positive() {
                continue;
            }

            if best.as_ref().map_or(true, |(_, current)| result.score >= current.score) {
                best = Some((candidate, result));
            }
        }

        best
    }
}
