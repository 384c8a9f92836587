//! 自定义属性注册表
//!
//! 当被匹配的属性集合中缺少某个属性时，由注册的回调根据整个属性集合计算该值。

use hp_core::{AttributeBag, AttributeValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 自定义属性计算回调，返回 `None` 表示无法计算
pub type AttributeResolver = Arc<dyn Fn(&AttributeBag) -> Option<AttributeValue> + Send + Sync>;

/// 已注册的自定义属性
#[derive(Clone)]
pub struct CustomAttribute {
    pub id: String,
    pub name: String,
    resolver: AttributeResolver,
}

impl CustomAttribute {
    pub fn resolve(&self, attributes: &AttributeBag) -> Option<AttributeValue> {
        (self.resolver)(attributes)
    }
}

impl fmt::Debug for CustomAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomAttribute")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// 自定义属性注册表
///
/// 同一id重复注册时覆盖，不支持删除。
#[derive(Debug, Clone, Default)]
pub struct CustomAttributeRegistry {
    attributes: HashMap<String, CustomAttribute>,
    order: Vec<String>,
}

impl CustomAttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册自定义属性
    pub fn register<F>(&mut self, attribute_id: &str, display_name: &str, resolver: F)
    where
        F: Fn(&AttributeBag) -> Option<AttributeValue> + Send + Sync + 'static,
    {
        let attribute = CustomAttribute {
            id: attribute_id.to_string(),
            name: display_name.to_string(),
            resolver: Arc::new(resolver),
        };

        if self.attributes.insert(attribute_id.to_string(), attribute).is_none() {
            self.order.push(attribute_id.to_string());
        }
        tracing::debug!("Registered custom attribute {}", attribute_id);
    }

    pub fn get(&self, attribute_id: &str) -> Option<&CustomAttribute> {
        self.attributes.get(attribute_id)
    }

    pub fn contains(&self, attribute_id: &str) -> bool {
        self.attributes.contains_key(attribute_id)
    }

    /// 按注册顺序列出自定义属性
    pub fn entries(&self) -> Vec<&CustomAttribute> {
        self.order
            .iter()
            .filter_map(|id| self.attributes.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}
