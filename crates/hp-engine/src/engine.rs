//! 挂片协议引擎
//!
//! 持有当前协议和阶段序号，协调协议选择器与图像匹配器计算视口分配，
//! 并把结果交给布局管理器。

use crate::{
    image_matcher::{tagged_prior_value, ImageMatchDetails, ImageMatcher, PriorReference},
    layout::{LayoutManager, LayoutSnapshot, ViewportData},
    prior_fetch::{PriorFetchTracker, SettledFetch},
    protocol::{Protocol, Stage, Viewport},
    selector::{MatchedProtocols, ProtocolSelector, ABSTRACT_PRIOR_VALUE},
    settings::EngineSettings,
    store::{ProtocolStore, StudyStore},
};
use hp_core::{Result, Study};
use hp_matching::{CustomAttributeRegistry, RuleMatcher};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 引擎状态
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub active_protocol: Option<Protocol>,
    pub active_stage_index: usize,
    /// 已加载的检查，第一个为当前检查；按需加载的既往检查追加在后
    pub loaded_studies: Vec<Study>,
    /// 编辑过程中新增的阶段
    pub new_stage_ids: HashSet<Uuid>,
}

/// 挂片协议引擎
///
/// 每个阅片会话创建一个，由会话层持有。
pub struct ProtocolEngine<L: LayoutManager> {
    settings: EngineSettings,
    selector: ProtocolSelector,
    image_matcher: ImageMatcher,
    study_store: Arc<dyn StudyStore>,
    fetches: PriorFetchTracker,
    layout_manager: L,
    state: EngineState,
    match_details: Vec<ImageMatchDetails>,
}

impl<L: LayoutManager> ProtocolEngine<L> {
    /// 创建引擎并切换到最佳匹配协议
    pub fn new(
        settings: EngineSettings,
        protocols: Arc<dyn ProtocolStore>,
        study_store: Arc<dyn StudyStore>,
        custom_attributes: Arc<CustomAttributeRegistry>,
        layout_manager: L,
        mut studies: Vec<Study>,
    ) -> Result<Self> {
        let matcher = RuleMatcher::with_registry(custom_attributes);

        if let Some(primary) = studies.first_mut() {
            primary.set_attribute(ABSTRACT_PRIOR_VALUE, 0);
        }

        let mut engine = Self {
            selector: ProtocolSelector::new(
                protocols,
                Arc::clone(&study_store),
                matcher.clone(),
                settings.clone(),
            ),
            image_matcher: ImageMatcher::new(matcher),
            fetches: PriorFetchTracker::new(Arc::clone(&study_store)),
            study_store,
            settings,
            layout_manager,
            state: EngineState {
                loaded_studies: studies,
                ..EngineState::default()
            },
            match_details: Vec::new(),
        };

        engine.reset()?;
        Ok(engine)
    }

    /// 重新匹配并切换到最佳协议
    pub fn reset(&mut self) -> Result<()> {
        let protocol = self.selector.get_best_match(&self.state.loaded_studies)?;
        self.set_hanging_protocol(protocol, true);
        Ok(())
    }

    /// 切换当前协议，回到第一个阶段
    pub fn set_hanging_protocol(&mut self, protocol: Protocol, update_viewports: bool) {
        info!("Setting hanging protocol {} ({})", protocol.id, protocol.name);

        self.state.new_stage_ids.clear();
        if !self.selector.matched_mut().select(&protocol.id) {
            debug!("Protocol {} is not among the matched protocols", protocol.id);
        }
        self.state.active_protocol = Some(protocol);
        self.state.active_stage_index = 0;
        self.fetches.invalidate_all();

        if update_viewports {
            self.update_viewports(None);
        }
    }

    /// 切换到指定阶段，超出范围时忽略
    pub fn set_current_protocol_stage(&mut self, stage_index: usize) {
        let Some(count) = self.num_protocol_stages() else {
            debug!("No active protocol stages, ignoring stage change");
            return;
        };

        if stage_index >= count {
            debug!("Stage index {} out of range (0..{})", stage_index, count);
            return;
        }

        info!("Switching to protocol stage {}", stage_index);
        self.state.active_stage_index = stage_index;
        self.fetches.invalidate_all();
        self.update_viewports(None);
    }

    pub fn next_protocol_stage(&mut self) {
        self.set_current_protocol_stage(self.state.active_stage_index + 1);
    }

    pub fn previous_protocol_stage(&mut self) {
        match self.state.active_stage_index.checked_sub(1) {
            Some(stage_index) => self.set_current_protocol_stage(stage_index),
            None => debug!("Already at the first protocol stage"),
        }
    }

    /// 当前协议的阶段数，没有协议或没有阶段时返回 `None`
    pub fn num_protocol_stages(&self) -> Option<usize> {
        self.state
            .active_protocol
            .as_ref()
            .map(Protocol::stage_count)
            .filter(|count| *count > 0)
    }

    pub fn current_stage(&self) -> Option<&Stage> {
        self.state
            .active_protocol
            .as_ref()?
            .stages
            .get(self.state.active_stage_index)
    }

    /// 重新计算当前阶段的视口
    ///
    /// 不指定视口时整体刷新布局，否则只重新渲染该视口。
    /// 阶段缺少布局结构或视口时不做任何事。
    pub fn update_viewports(&mut self, viewport_index: Option<usize>) {
        let (layout_template_name, layout_props, viewports) = {
            let Some(protocol) = self.state.active_protocol.as_ref() else {
                return;
            };

            let Some(stage) = protocol.stages.get(self.state.active_stage_index) else {
                warn!(
                    "Protocol {} has no stage {} ({} stage(s))",
                    protocol.id,
                    self.state.active_stage_index,
                    protocol.stages.len()
                );
                return;
            };

            let Some(structure) = stage.viewport_structure.as_ref() else {
                warn!("Stage {} has no viewport structure", stage.id);
                return;
            };

            if stage.viewports.is_empty() {
                warn!("Stage {} has no viewports", stage.id);
                return;
            }

            let Some(template) = structure.layout_template_name() else {
                warn!("Unknown layout type {} in stage {}", structure.layout_type, stage.id);
                return;
            };

            (template.to_string(), structure.properties, stage.viewports.clone())
        };

        let mut match_details = Vec::with_capacity(viewports.len());
        let mut viewport_data = Vec::with_capacity(viewports.len());

        for (index, viewport) in viewports.iter().enumerate() {
            let details = self.match_images(index, viewport);
            let best = details.best_match.as_ref();

            viewport_data.push(ViewportData {
                viewport_index: index,
                viewport_settings: viewport.viewport_settings.clone(),
                tool_settings: viewport.tool_settings.clone(),
                layout_props,
                study_instance_uid: best.map(|b| b.study_instance_uid.clone()),
                series_instance_uid: best.map(|b| b.series_instance_uid.clone()),
                sop_instance_uid: best.map(|b| b.sop_instance_uid.clone()),
                current_image_id_index: best.map(|b| b.current_image_id_index),
            });
            match_details.push(details);
        }

        self.match_details = match_details;

        let snapshot = LayoutSnapshot {
            layout_template_name,
            layout_props,
            viewport_data,
        };

        match viewport_index {
            None => self.layout_manager.update_viewports(&snapshot),
            Some(index) => match snapshot.viewport_data.get(index) {
                Some(data) => self.layout_manager.rerender_viewport_with_new_series(index, data),
                None => debug!("Viewport {} not in current stage", index),
            },
        }
    }

    /// 为视口匹配图像，并为引用但未加载的既往检查发起获取
    ///
    /// 返回值只反映当前已加载的检查。
    pub fn match_images(&mut self, viewport_index: usize, viewport: &Viewport) -> ImageMatchDetails {
        if self.settings.lazy_prior_fetch {
            let requests = self.image_matcher.prior_requests(
                viewport,
                &self.state.loaded_studies,
                self.study_store.as_ref(),
            );
            for reference in &requests {
                if !self.load_tagged_copy(reference) {
                    self.fetches.request(reference, viewport_index);
                }
            }
        }

        self.image_matcher
            .match_images(viewport, &self.state.loaded_studies)
    }

    /// 处理所有已完成的既往检查获取 (不等待)，返回处理的数量
    pub fn apply_completed_fetches(&mut self) -> usize {
        let mut applied = 0;
        while let Some(settled) = self.fetches.try_next_completion() {
            self.apply_completion(settled);
            applied += 1;
        }
        applied
    }

    /// 等待所有进行中的既往检查获取完成并处理
    ///
    /// 处理完成时可能引发新的获取，一并等待。
    pub async fn wait_for_pending_priors(&mut self) -> usize {
        let mut applied = 0;
        while let Some(settled) = self.fetches.next_completion().await {
            self.apply_completion(settled);
            applied += 1;
        }
        applied
    }

    pub fn has_pending_fetches(&self) -> bool {
        self.fetches.has_pending()
    }

    /// 检查已以其他序号加载时，直接追加以该序号标记的副本
    fn load_tagged_copy(&mut self, reference: &PriorReference) -> bool {
        let Some(loaded) = self
            .state
            .loaded_studies
            .iter()
            .find(|study| study.study_instance_uid == reference.study.study_instance_uid)
        else {
            return false;
        };

        let study = loaded.clone();
        self.push_tagged(study, reference.abstract_prior_value);
        true
    }

    /// 追加以抽象序号标记的检查，同一检查同一序号只保留一份
    fn push_tagged(&mut self, mut study: Study, abstract_prior_value: i64) {
        let exists = self.state.loaded_studies.iter().any(|loaded| {
            loaded.study_instance_uid == study.study_instance_uid
                && tagged_prior_value(loaded) == Some(abstract_prior_value)
        });
        if exists {
            debug!(
                "Prior study {} already loaded as abstract prior {}",
                study.study_instance_uid, abstract_prior_value
            );
            return;
        }

        info!(
            "Loaded prior study {} as abstract prior {}",
            study.study_instance_uid, abstract_prior_value
        );
        study.set_attribute(ABSTRACT_PRIOR_VALUE, abstract_prior_value);
        self.state.loaded_studies.push(study);
    }

    fn apply_completion(&mut self, settled: SettledFetch) {
        let SettledFetch {
            study_instance_uid,
            abstract_prior_values,
            result,
            waiters,
        } = settled;

        let study = match result {
            Ok(study) => study,
            Err(err) => {
                warn!("Failed to fetch prior study {}: {}", study_instance_uid, err);
                return;
            }
        };

        for abstract_prior_value in abstract_prior_values {
            self.push_tagged(study.clone(), abstract_prior_value);
        }

        let mut refresh: Vec<usize> = Vec::new();
        for waiter in waiters {
            if !self.fetches.is_current(&waiter) {
                debug!(
                    "Discarding stale update of viewport {} for prior study {}",
                    waiter.viewport_index, study_instance_uid
                );
                continue;
            }
            if !refresh.contains(&waiter.viewport_index) {
                refresh.push(waiter.viewport_index);
            }
        }

        for viewport_index in refresh {
            self.update_viewports(Some(viewport_index));
        }
    }

    /// 复制当前阶段追加到末尾并切换过去，返回新阶段id
    pub fn add_stage_clone(&mut self) -> Option<Uuid> {
        let clone = self.current_stage()?.create_clone();
        let stage_id = clone.id;

        let protocol = self.state.active_protocol.as_mut()?;
        protocol.add_stage(clone);
        let last = protocol.stage_count() - 1;

        self.state.new_stage_ids.insert(stage_id);
        self.set_current_protocol_stage(last);
        Some(stage_id)
    }

    /// 删除阶段
    ///
    /// 协议只剩一个阶段时不删除。删除当前阶段时切换到前一个阶段。
    pub fn remove_stage(&mut self, stage_id: Uuid) -> bool {
        let Some(protocol) = self.state.active_protocol.as_mut() else {
            return false;
        };
        if protocol.stage_count() <= 1 {
            debug!("Refusing to remove the only stage of protocol {}", protocol.id);
            return false;
        }

        let Some((removed_index, _)) = protocol.remove_stage(stage_id) else {
            return false;
        };
        self.state.new_stage_ids.remove(&stage_id);

        let active = self.state.active_stage_index;
        if removed_index == active {
            self.set_current_protocol_stage(removed_index.saturating_sub(1));
        } else if removed_index < active {
            self.state.active_stage_index = active - 1;
        }
        true
    }

    /// 移动阶段，当前显示的阶段保持不变
    pub fn move_stage(&mut self, old_index: usize, new_index: usize) -> bool {
        let current_id = self.current_stage().map(|stage| stage.id);
        let Some(protocol) = self.state.active_protocol.as_mut() else {
            return false;
        };
        if !protocol.move_stage(old_index, new_index) {
            return false;
        }

        if let Some(index) = current_id.and_then(|id| protocol.stage_index(id)) {
            self.state.active_stage_index = index;
        }
        true
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn active_protocol(&self) -> Option<&Protocol> {
        self.state.active_protocol.as_ref()
    }

    pub fn active_stage_index(&self) -> usize {
        self.state.active_stage_index
    }

    pub fn loaded_studies(&self) -> &[Study] {
        &self.state.loaded_studies
    }

    pub fn new_stage_ids(&self) -> &HashSet<Uuid> {
        &self.state.new_stage_ids
    }

    pub fn matched_protocols(&self) -> &MatchedProtocols {
        self.selector.matched()
    }

    /// 最近一次计算的各视口匹配明细
    pub fn match_details(&self) -> &[ImageMatchDetails] {
        &self.match_details
    }

    pub fn selector(&self) -> &ProtocolSelector {
        &self.selector
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn layout_manager(&self) -> &L {
        &self.layout_manager
    }

    pub fn layout_manager_mut(&mut self) -> &mut L {
        &mut self.layout_manager
    }
}
