//! 挂片协议引擎演示程序
//!
//! 为一位有基线和随访检查的患者选择病灶追踪协议，
//! 并展示按需加载既往检查后视口的更新。

use chrono::NaiveDate;
use hanging_protocols::admin::{init_logging, ConfigManager};
use hanging_protocols::core::{Instance, Series, Study};
use hanging_protocols::engine::presets::{
    default_protocol, lesion_tracker_baseline_protocol, lesion_tracker_followup_protocol,
    register_lesion_tracker_attributes,
};
use hanging_protocols::engine::{
    InMemoryProtocolStore, InMemoryStudyStore, LayoutEvent, Protocol, ProtocolEngine,
    RecordingLayoutManager, Stage, Timepoint, TimepointRegistry, TimepointType, Viewport,
    ViewportStructure, ABSTRACT_PRIOR_VALUE,
};
use hanging_protocols::matching::{Constraint, CustomAttributeRegistry, Rule};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigManager::from_defaults()?;
    let settings = config.get_config().await;
    init_logging(&settings.logging)?;

    println!("🚀 挂片协议引擎演示\n");

    // 1. 检查数据
    let baseline = ct_study("1.2.840.1", date(2022, 3, 1), "CT CHEST ABDOMEN");
    let followup = ct_study("1.2.840.2", date(2024, 3, 1), "CT CHEST ABDOMEN");
    let study_store = Arc::new(
        InMemoryStudyStore::new()
            .with_fetch_delay(Duration::from_millis(50))
            .with_study(baseline.clone())
            .with_study(followup.clone()),
    );
    println!("✅ 创建了 2 个示例检查");

    // 2. 时间点与自定义属性
    let mut timepoints = TimepointRegistry::new();
    timepoints.insert(
        Timepoint::new("tp-1", "PAT-001", TimepointType::Baseline, baseline.study_date)
            .with_study(&baseline.study_instance_uid),
    );
    timepoints.insert(
        Timepoint::new("tp-2", "PAT-001", TimepointType::Followup, followup.study_date)
            .with_study(&followup.study_instance_uid),
    );
    let timepoints = Arc::new(timepoints);
    let related = timepoints.related_studies("tp-2")?;
    println!("✅ 随访时间点关联检查: {}", related.study_instance_uids.join(", "));

    let mut custom_attributes = CustomAttributeRegistry::new();
    register_lesion_tracker_attributes(&mut custom_attributes, Arc::clone(&timepoints));

    // 3. 协议
    let mut protocols = InMemoryProtocolStore::new();
    protocols.insert(default_protocol());
    protocols.insert(lesion_tracker_baseline_protocol());
    protocols.insert(lesion_tracker_followup_protocol());
    protocols.insert(prior_comparison_protocol());
    println!("✅ 注册了 {} 个协议", protocols.len());

    // 4. 以随访检查为当前检查启动引擎
    let mut engine = ProtocolEngine::new(
        settings.engine_settings(),
        Arc::new(protocols),
        study_store.clone(),
        Arc::new(custom_attributes),
        RecordingLayoutManager::new(),
        vec![followup],
    )?;

    println!("\n📊 匹配到的协议:");
    for matched in engine.matched_protocols().entries() {
        println!(
            "   {} {} (得分 {})",
            if matched.selected { "▶" } else { " " },
            matched.protocol.name,
            matched.score
        );
    }
    print_layout(&engine);

    // 5. 切换到需要既往检查的协议
    if let Some(protocol) = engine.selector().protocol_store().find("priorComparison") {
        engine.set_hanging_protocol(protocol, true);
        println!("\n🔄 切换到协议 priorComparison");
        print_layout(&engine);

        let applied = engine.wait_for_pending_priors().await;
        info!("Applied {} prior fetch(es)", applied);
        println!("\n📥 已加载 {} 个既往检查 (获取次数 {})", applied, study_store.fetch_count());

        for event in engine.layout_manager().events() {
            if let LayoutEvent::Rerendered { viewport_index, data } = event {
                println!(
                    "   视口 {} 更新为检查 {}",
                    viewport_index,
                    data.study_instance_uid.as_deref().unwrap_or("-")
                );
            }
        }
        print_layout(&engine);
    }

    // 6. 阶段导航
    engine.next_protocol_stage();
    println!("\n⏭  当前阶段: {}", engine.active_stage_index());

    Ok(())
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

fn ct_study(uid: &str, study_date: NaiveDate, description: &str) -> Study {
    let mut study = Study::new(uid, "PAT-001", study_date)
        .with_description(description)
        .with_series(
            Series::new(&format!("{}.1", uid), "CT")
                .with_description("Lung 1mm")
                .with_instance(Instance::image(&format!("{}.1.1", uid), 512, 512)),
        )
        .with_series(
            Series::new(&format!("{}.2", uid), "CT")
                .with_description("Body Abdomen 5mm")
                .with_instance(Instance::image(&format!("{}.2.1", uid), 512, 512))
                .with_instance(Instance::image(&format!("{}.2.2", uid), 512, 512)),
        );
    study.patient_name = Some("DOE^JANE".to_string());
    study
}

/// 当前检查与最近一次既往检查并排比较
fn prior_comparison_protocol() -> Protocol {
    let viewport = |abstract_prior_value: i64| Viewport {
        study_matching_rules: vec![
            Rule::new(ABSTRACT_PRIOR_VALUE, Constraint::equals(abstract_prior_value)).required(),
        ],
        series_matching_rules: vec![Rule::new("seriesDescription", Constraint::contains("Body"))],
        ..Viewport::default()
    };

    let mut protocol = Protocol::new("Prior Comparison").with_id("priorComparison");
    protocol.number_of_priors_referenced = 1;
    protocol.add_protocol_matching_rule(Rule::new("studyDescription", Constraint::contains("CT")));
    protocol.add_stage(
        Stage::new(ViewportStructure::grid(1, 2), "oneByTwo")
            .with_viewport(viewport(0))
            .with_viewport(viewport(1)),
    );
    protocol
}

fn print_layout(engine: &ProtocolEngine<RecordingLayoutManager>) {
    let Some(layout) = engine.layout_manager().current() else {
        println!("   (无布局)");
        return;
    };

    println!(
        "\n🖼  布局 {} ({}x{})",
        layout.layout_template_name, layout.layout_props.rows, layout.layout_props.columns
    );
    for data in &layout.viewport_data {
        println!(
            "   视口 {}: 检查 {} 系列 {} 图像 {}",
            data.viewport_index,
            data.study_instance_uid.as_deref().unwrap_or("-"),
            data.series_instance_uid.as_deref().unwrap_or("-"),
            data.sop_instance_uid.as_deref().unwrap_or("-"),
        );
    }
}
