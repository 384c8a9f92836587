//! 布局管理器接口
//!
//! 引擎每次重新计算后把布局模板、布局属性和各视口数据交给布局管理器。

use crate::protocol::{LayoutProps, SettingsMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 单个视口的布局数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportData {
    pub viewport_index: usize,
    pub viewport_settings: SettingsMap,
    pub tool_settings: SettingsMap,
    #[serde(flatten)]
    pub layout_props: LayoutProps,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_instance_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_instance_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sop_instance_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_image_id_index: Option<usize>,
}

impl ViewportData {
    /// 是否已分配图像
    pub fn has_image(&self) -> bool {
        self.sop_instance_uid.is_some()
    }
}

/// 一次完整的布局计算结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSnapshot {
    pub layout_template_name: String,
    pub layout_props: LayoutProps,
    pub viewport_data: Vec<ViewportData>,
}

impl LayoutSnapshot {
    /// 系列是否显示在任一视口中，指定 `viewport_index` 时只检查该视口
    pub fn is_series_active(&self, series_instance_uid: &str, viewport_index: Option<usize>) -> bool {
        self.viewport_data
            .iter()
            .filter(|data| viewport_index.map_or(true, |index| data.viewport_index == index))
            .any(|data| data.series_instance_uid.as_deref() == Some(series_instance_uid))
    }
}

/// 布局管理器
pub trait LayoutManager {
    /// 整体刷新所有视口
    fn update_viewports(&mut self, snapshot: &LayoutSnapshot);

    /// 只重新渲染一个视口
    fn rerender_viewport_with_new_series(&mut self, viewport_index: usize, data: &ViewportData);
}

/// 布局事件
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutEvent {
    Updated(LayoutSnapshot),
    Rerendered { viewport_index: usize, data: ViewportData },
}

/// 记录所有调用的布局管理器
#[derive(Debug, Clone, Default)]
pub struct RecordingLayoutManager {
    events: Vec<LayoutEvent>,
    current: Option<LayoutSnapshot>,
}

impl RecordingLayoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[LayoutEvent] {
        &self.events
    }

    /// 当前显示的布局
    pub fn current(&self) -> Option<&LayoutSnapshot> {
        self.current.as_ref()
    }

    pub fn update_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, LayoutEvent::Updated(_)))
            .count()
    }

    pub fn rerender_count(&self) -> usize {
        self.events.len() - self.update_count()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl LayoutManager for RecordingLayoutManager {
    fn update_viewports(&mut self, snapshot: &LayoutSnapshot) {
        debug!(
            "Layout {} with {} viewport(s)",
            snapshot.layout_template_name,
            snapshot.viewport_data.len()
        );
        self.current = Some(snapshot.clone());
        self.events.push(LayoutEvent::Updated(snapshot.clone()));
    }

    fn rerender_viewport_with_new_series(&mut self, viewport_index: usize, data: &ViewportData) {
        debug!("Rerender viewport {}", viewport_index);
        if let Some(slot) = self
            .current
            .as_mut()
            .and_then(|current| current.viewport_data.get_mut(viewport_index))
        {
            *slot = data.clone();
        }
        self.events.push(LayoutEvent::Rerendered {
            viewport_index,
            data: data.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(index: usize, series: Option<&str>) -> ViewportData {
        ViewportData {
            viewport_index: index,
            viewport_settings: SettingsMap::new(),
            tool_settings: SettingsMap::new(),
            layout_props: LayoutProps { rows: 1, columns: 2 },
            study_instance_uid: series.map(|_| "1".to_string()),
            series_instance_uid: series.map(str::to_string),
            sop_instance_uid: series.map(|s| format!("{}.1", s)),
            current_image_id_index: series.map(|_| 0),
        }
    }

    fn snapshot() -> LayoutSnapshot {
        LayoutSnapshot {
            layout_template_name: "gridLayout".to_string(),
            layout_props: LayoutProps { rows: 1, columns: 2 },
            viewport_data: vec![data(0, Some("1.1")), data(1, None)],
        }
    }

    #[test]
    fn test_is_series_active() {
        let snapshot = snapshot();
        assert!(snapshot.is_series_active("1.1", None));
        assert!(snapshot.is_series_active("1.1", Some(0)));
        assert!(!snapshot.is_series_active("1.1", Some(1)));
        assert!(!snapshot.is_series_active("2.1", None));
    }

    #[test]
    fn test_recording_layout_manager() {
        let mut manager = RecordingLayoutManager::new();
        manager.update_viewports(&snapshot());
        manager.rerender_viewport_with_new_series(1, &data(1, Some("2.1")));

        assert_eq!(manager.update_count(), 1);
        assert_eq!(manager.rerender_count(), 1);
        let current = manager.current().unwrap();
        assert!(current.is_series_active("2.1", Some(1)));
        assert!(current.viewport_data[1].has_image());
    }

    #[test]
    fn test_viewport_data_json_shape() {
        let value = serde_json::to_value(data(0, Some("1.1"))).unwrap();
        assert_eq!(value["viewportIndex"], 0);
        assert_eq!(value["rows"], 1);
        assert_eq!(value["seriesInstanceUid"], "1.1");

        let empty = serde_json::to_value(data(1, None)).unwrap();
        assert!(empty.get("sopInstanceUid").is_none());
    }
}
