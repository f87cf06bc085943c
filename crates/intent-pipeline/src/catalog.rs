//! Intent catalog: intent definitions plus the `(domain, action, modifier)`
//! composition table, keyed by factory.

use std::collections::HashMap;

use serde::Deserialize;

use intent_protocol::{ActionType, Domain, IntentDefinition, QueryModifier, RiskLevel, SlotType};

use crate::error::{PipelineError, PipelineResult};

/// Read-only lookup of intents and compositions for a factory.
pub trait IntentCatalog: Send + Sync {
    /// All intents visible to the factory (factory overrides win over defaults).
    fn intents(&self, factory_id: &str) -> Vec<IntentDefinition>;

    fn get(&self, factory_id: &str, intent_code: &str) -> Option<IntentDefinition>;

    /// Composition table lookup. `None` means no entry for this exact key.
    fn compose(
        &self,
        factory_id: &str,
        domain: Domain,
        action: ActionType,
        modifier: Option<QueryModifier>,
    ) -> Option<String>;
}

type CompositionKey = (Domain, ActionType, Option<QueryModifier>);

/// One row of the composition table as written in a catalog file.
#[derive(Debug, Clone, Deserialize)]
pub struct CompositionEntry {
    pub domain: Domain,
    pub action: ActionType,
    #[serde(default)]
    pub modifier: Option<QueryModifier>,
    pub intent_code: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    intents: Vec<IntentDefinition>,
    #[serde(default)]
    compositions: Vec<CompositionEntry>,
}

/// Catalog held in memory; shared defaults plus per-factory additions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    defaults: Vec<IntentDefinition>,
    per_factory: HashMap<String, Vec<IntentDefinition>>,
    compositions: HashMap<CompositionKey, String>,
}

impl InMemoryCatalog {
    pub fn new(intents: Vec<IntentDefinition>, compositions: Vec<CompositionEntry>) -> Self {
        let mut catalog = Self {
            defaults: intents,
            ..Self::default()
        };
        for entry in compositions {
            catalog.add_composition(entry);
        }
        catalog
    }

    /// Parse a TOML catalog with `[[intents]]` and `[[compositions]]` tables.
    /// Every composition must point at a defined intent.
    pub fn from_toml(contents: &str) -> PipelineResult<Self> {
        let file: CatalogFile =
            toml::from_str(contents).map_err(|e| PipelineError::Config(e.to_string()))?;
        for entry in &file.compositions {
            if !file.intents.iter().any(|i| i.intent_code == entry.intent_code) {
                return Err(PipelineError::Config(format!(
                    "composition ({}, {}) points at undefined intent {}",
                    entry.domain, entry.action, entry.intent_code
                )));
            }
        }
        Ok(Self::new(file.intents, file.compositions))
    }

    pub fn add_composition(&mut self, entry: CompositionEntry) {
        self.compositions
            .insert((entry.domain, entry.action, entry.modifier), entry.intent_code);
    }

    /// Register factory-specific intents; same-code entries shadow the defaults.
    pub fn with_factory_intents(
        mut self,
        factory_id: impl Into<String>,
        intents: Vec<IntentDefinition>,
    ) -> Self {
        self.per_factory.entry(factory_id.into()).or_default().extend(intents);
        self
    }

    /// General-purpose catalog covering every business domain.
    pub fn factory_defaults() -> Self {
        Self::new(default_intents(), default_compositions())
    }
}

impl IntentCatalog for InMemoryCatalog {
    fn intents(&self, factory_id: &str) -> Vec<IntentDefinition> {
        let own = self.per_factory.get(factory_id);
        let mut out: Vec<IntentDefinition> = self
            .defaults
            .iter()
            .filter(|d| !own.is_some_and(|o| o.iter().any(|i| i.intent_code == d.intent_code)))
            .cloned()
            .collect();
        if let Some(own) = own {
            out.extend(own.iter().cloned());
        }
        out
    }

    fn get(&self, factory_id: &str, intent_code: &str) -> Option<IntentDefinition> {
        self.per_factory
            .get(factory_id)
            .and_then(|own| own.iter().find(|i| i.intent_code == intent_code))
            .or_else(|| self.defaults.iter().find(|i| i.intent_code == intent_code))
            .cloned()
    }

    fn compose(
        &self,
        _factory_id: &str,
        domain: Domain,
        action: ActionType,
        modifier: Option<QueryModifier>,
    ) -> Option<String> {
        self.compositions.get(&(domain, action, modifier)).cloned()
    }
}

// ── Defaults ──────────────────────────────────────────────────

struct Def {
    code: &'static str,
    name: &'static str,
    domain: Domain,
    action: ActionType,
    required: &'static [SlotType],
    keywords: &'static [&'static str],
    examples: &'static [&'static str],
    risk: RiskLevel,
    bound: bool,
    entity: &'static str,
}

impl From<&Def> for IntentDefinition {
    fn from(d: &Def) -> Self {
        IntentDefinition {
            intent_code: d.code.into(),
            name: d.name.into(),
            domain: d.domain,
            action: d.action,
            required_slots: d.required.to_vec(),
            keywords: d.keywords.iter().map(|s| s.to_string()).collect(),
            examples: d.examples.iter().map(|s| s.to_string()).collect(),
            risk_level: d.risk,
            executor_bound: d.bound,
            entity_type: Some(d.entity.into()),
        }
    }
}

const DEFAULT_INTENTS: &[Def] = &[
    Def {
        code: "MATERIAL_BATCH_QUERY",
        name: "原料批次查询",
        domain: Domain::Material,
        action: ActionType::Query,
        required: &[],
        keywords: &["入库", "库存", "原料", "物料"],
        examples: &["最近7天带鱼入库多少", "查一下库存", "原料批次有哪些"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "material_batch",
    },
    Def {
        code: "MATERIAL_EXPIRING_QUERY",
        name: "临期原料查询",
        domain: Domain::Material,
        action: ActionType::Query,
        required: &[SlotType::TimeRange],
        keywords: &["过期", "临期", "保质期"],
        examples: &["未来3天要过期的原料", "哪些物料快过期了"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "material_batch",
    },
    Def {
        code: "MATERIAL_BATCH_CREATE",
        name: "原料入库登记",
        domain: Domain::Material,
        action: ActionType::Create,
        required: &[SlotType::MaterialId, SlotType::Number],
        keywords: &["入库登记", "新增批次"],
        examples: &["登记一批原料入库", "新增原料批次"],
        risk: RiskLevel::Medium,
        bound: true,
        entity: "material_batch",
    },
    Def {
        code: "MATERIAL_BATCH_UPDATE",
        name: "原料批次修改",
        domain: Domain::Material,
        action: ActionType::Update,
        required: &[SlotType::BatchId],
        keywords: &["修改批次"],
        examples: &["把批次MB-20240301的数量改成200"],
        risk: RiskLevel::Medium,
        bound: true,
        entity: "material_batch",
    },
    Def {
        code: "MATERIAL_BATCH_DISPOSE",
        name: "原料批次报废",
        domain: Domain::Material,
        action: ActionType::Delete,
        required: &[SlotType::BatchId],
        keywords: &["报废", "销毁"],
        examples: &["报废批次MB-20240301", "销毁过期原料"],
        risk: RiskLevel::High,
        bound: true,
        entity: "material_batch",
    },
    Def {
        code: "SHIPMENT_QUERY",
        name: "出货查询",
        domain: Domain::Shipment,
        action: ActionType::Query,
        required: &[],
        keywords: &["出货", "发货", "出库"],
        examples: &["今天发了多少货", "订单SO20240012发货了吗"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "shipment",
    },
    Def {
        code: "SHIPMENT_PERIOD_COMPARISON",
        name: "出货同比环比",
        domain: Domain::Shipment,
        action: ActionType::Query,
        required: &[SlotType::TimeRange],
        keywords: &["出货同比", "发货环比"],
        examples: &["本月出货量环比", "今年发货同比增长多少"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "shipment",
    },
    Def {
        code: "SHIPMENT_CREATE",
        name: "创建出货单",
        domain: Domain::Shipment,
        action: ActionType::Create,
        required: &[SlotType::CustomerId],
        keywords: &["创建出货单", "安排发货"],
        examples: &["给客户CUS-001安排发货"],
        risk: RiskLevel::Medium,
        bound: true,
        entity: "shipment",
    },
    Def {
        code: "ATTENDANCE_QUERY",
        name: "考勤查询",
        domain: Domain::Attendance,
        action: ActionType::Query,
        required: &[SlotType::TimeRange],
        keywords: &["考勤", "打卡", "出勤"],
        examples: &["员工张三的考勤", "今天谁没打卡"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "attendance",
    },
    Def {
        code: "ATTENDANCE_RANKING",
        name: "出勤排名",
        domain: Domain::Attendance,
        action: ActionType::Query,
        required: &[],
        keywords: &["出勤排名"],
        examples: &["本月出勤率倒数3名的员工", "出勤最多的员工"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "attendance",
    },
    Def {
        code: "ATTENDANCE_STATS",
        name: "考勤统计",
        domain: Domain::Attendance,
        action: ActionType::Query,
        required: &[SlotType::TimeRange],
        keywords: &["考勤统计"],
        examples: &["上个月平均出勤率", "本周迟到次数"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "attendance",
    },
    Def {
        code: "EQUIPMENT_STATUS_QUERY",
        name: "设备状态查询",
        domain: Domain::Equipment,
        action: ActionType::Query,
        required: &[],
        keywords: &["设备", "机台", "停机"],
        examples: &["设备EQ-001现在什么状态", "哪些设备停机了"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "equipment",
    },
    Def {
        code: "EQUIPMENT_STATUS_UPDATE",
        name: "设备状态变更",
        domain: Domain::Equipment,
        action: ActionType::Update,
        required: &[SlotType::DeviceId, SlotType::Status],
        keywords: &["设备状态改"],
        examples: &["把设备EQ-001改成维修中"],
        risk: RiskLevel::High,
        bound: true,
        entity: "equipment",
    },
    Def {
        code: "QUALITY_INSPECTION_QUERY",
        name: "质检记录查询",
        domain: Domain::Quality,
        action: ActionType::Query,
        required: &[],
        keywords: &["质检", "合格率", "不合格"],
        examples: &["昨天的质检结果", "不合格的批次有哪些"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "quality_inspection",
    },
    Def {
        code: "QUALITY_STATS",
        name: "质量统计分析",
        domain: Domain::Quality,
        action: ActionType::Query,
        required: &[SlotType::TimeRange],
        keywords: &["质量分析", "不良率"],
        examples: &["本月平均合格率", "各车间不良率趋势"],
        risk: RiskLevel::Low,
        bound: false,
        entity: "quality_inspection",
    },
    Def {
        code: "QUALITY_INSPECTION_CREATE",
        name: "新建质检单",
        domain: Domain::Quality,
        action: ActionType::Create,
        required: &[SlotType::BatchId],
        keywords: &["新建质检", "提交质检"],
        examples: &["给批次MB-20240301提交质检"],
        risk: RiskLevel::Medium,
        bound: true,
        entity: "quality_inspection",
    },
    Def {
        code: "PROCESSING_PLAN_QUERY",
        name: "生产计划查询",
        domain: Domain::Processing,
        action: ActionType::Query,
        required: &[],
        keywords: &["生产计划", "排产", "加工"],
        examples: &["明天的生产计划", "二车间排产情况"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "production_plan",
    },
    Def {
        code: "PROCESSING_PLAN_CREATE",
        name: "创建生产计划",
        domain: Domain::Processing,
        action: ActionType::Create,
        required: &[SlotType::ProductId, SlotType::Number],
        keywords: &["创建生产计划", "新建排产"],
        examples: &["创建一个生产计划，产品PRD-001生产500件"],
        risk: RiskLevel::Medium,
        bound: true,
        entity: "production_plan",
    },
    Def {
        code: "ALERT_QUERY",
        name: "告警查询",
        domain: Domain::Alert,
        action: ActionType::Query,
        required: &[],
        keywords: &["告警", "报警", "预警"],
        examples: &["今天有哪些告警", "最近的报警"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "alert",
    },
    Def {
        code: "ALERT_ACKNOWLEDGE",
        name: "告警确认处理",
        domain: Domain::Alert,
        action: ActionType::Update,
        required: &[],
        keywords: &["处理告警", "确认告警"],
        examples: &["把这条告警标记为已处理"],
        risk: RiskLevel::Medium,
        bound: true,
        entity: "alert",
    },
    Def {
        code: "SUPPLIER_QUERY",
        name: "供应商查询",
        domain: Domain::Supplier,
        action: ActionType::Query,
        required: &[],
        keywords: &["供应商", "供货"],
        examples: &["供应商SUP-001的资料", "带鱼是哪家供应商供货的"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "supplier",
    },
    Def {
        code: "SUPPLIER_RANKING",
        name: "供应商排名",
        domain: Domain::Supplier,
        action: ActionType::Query,
        required: &[],
        keywords: &["供应商排名"],
        examples: &["交付率最高的供应商"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "supplier",
    },
    Def {
        code: "CUSTOMER_QUERY",
        name: "客户查询",
        domain: Domain::Customer,
        action: ActionType::Query,
        required: &[],
        keywords: &["客户"],
        examples: &["客户CUS-001的信息", "有哪些客户"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "customer",
    },
    Def {
        code: "CUSTOMER_RANKING",
        name: "客户排名",
        domain: Domain::Customer,
        action: ActionType::Query,
        required: &[],
        keywords: &["客户排名"],
        examples: &["销量最高的客户是谁", "销售额前5名的客户"],
        risk: RiskLevel::Low,
        bound: true,
        entity: "customer",
    },
];

fn default_intents() -> Vec<IntentDefinition> {
    DEFAULT_INTENTS.iter().map(IntentDefinition::from).collect()
}

fn default_compositions() -> Vec<CompositionEntry> {
    use ActionType::*;
    use Domain::*;
    use QueryModifier as M;

    let rows: &[(Domain, ActionType, Option<QueryModifier>, &str)] = &[
        (Material, Query, None, "MATERIAL_BATCH_QUERY"),
        (Material, Query, Some(M::Future), "MATERIAL_EXPIRING_QUERY"),
        (Material, Create, None, "MATERIAL_BATCH_CREATE"),
        (Material, Update, None, "MATERIAL_BATCH_UPDATE"),
        (Material, Delete, None, "MATERIAL_BATCH_DISPOSE"),
        (Shipment, Query, None, "SHIPMENT_QUERY"),
        (Shipment, Query, Some(M::Yoy), "SHIPMENT_PERIOD_COMPARISON"),
        (Shipment, Query, Some(M::Mom), "SHIPMENT_PERIOD_COMPARISON"),
        (Shipment, Query, Some(M::Qoq), "SHIPMENT_PERIOD_COMPARISON"),
        (Shipment, Create, None, "SHIPMENT_CREATE"),
        (Attendance, Query, None, "ATTENDANCE_QUERY"),
        (Attendance, Query, Some(M::Ranking), "ATTENDANCE_RANKING"),
        (Attendance, Query, Some(M::Stats), "ATTENDANCE_STATS"),
        (Attendance, Query, Some(M::Aggregation), "ATTENDANCE_STATS"),
        (Equipment, Query, None, "EQUIPMENT_STATUS_QUERY"),
        (Equipment, Update, None, "EQUIPMENT_STATUS_UPDATE"),
        (Quality, Query, None, "QUALITY_INSPECTION_QUERY"),
        (Quality, Query, Some(M::Stats), "QUALITY_STATS"),
        (Quality, Query, Some(M::Aggregation), "QUALITY_STATS"),
        (Quality, Create, None, "QUALITY_INSPECTION_CREATE"),
        (Processing, Query, None, "PROCESSING_PLAN_QUERY"),
        (Processing, Create, None, "PROCESSING_PLAN_CREATE"),
        (Alert, Query, None, "ALERT_QUERY"),
        (Alert, Update, None, "ALERT_ACKNOWLEDGE"),
        (Supplier, Query, None, "SUPPLIER_QUERY"),
        (Supplier, Query, Some(M::Ranking), "SUPPLIER_RANKING"),
        (Customer, Query, None, "CUSTOMER_QUERY"),
        (Customer, Query, Some(M::Ranking), "CUSTOMER_RANKING"),
    ];

    rows.iter()
        .map(|(domain, action, modifier, code)| CompositionEntry {
            domain: *domain,
            action: *action,
            modifier: *modifier,
            intent_code: code.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_compose_every_domain_query() {
        let catalog = InMemoryCatalog::factory_defaults();
        for domain in [
            Domain::Material,
            Domain::Shipment,
            Domain::Attendance,
            Domain::Equipment,
            Domain::Quality,
            Domain::Processing,
            Domain::Alert,
            Domain::Supplier,
            Domain::Customer,
        ] {
            let code = catalog.compose("f1", domain, ActionType::Query, None);
            let code = code.unwrap_or_else(|| panic!("no query composition for {domain}"));
            assert!(catalog.get("f1", &code).is_some(), "{code} not defined");
        }
    }

    #[test]
    fn modifier_compositions_resolve() {
        let catalog = InMemoryCatalog::factory_defaults();
        assert_eq!(
            catalog
                .compose("f1", Domain::Customer, ActionType::Query, Some(QueryModifier::Ranking))
                .as_deref(),
            Some("CUSTOMER_RANKING")
        );
        assert!(catalog
            .compose("f1", Domain::Alert, ActionType::Query, Some(QueryModifier::Ranking))
            .is_none());
    }

    #[test]
    fn dispose_is_high_risk_delete() {
        let catalog = InMemoryCatalog::factory_defaults();
        let dispose = catalog.get("f1", "MATERIAL_BATCH_DISPOSE").unwrap();
        assert!(dispose.is_high_risk());
        assert!(dispose.is_mutating());
        assert_eq!(dispose.required_slots, vec![SlotType::BatchId]);
    }

    #[test]
    fn factory_intents_shadow_defaults() {
        let mut custom = InMemoryCatalog::factory_defaults().get("f1", "ALERT_QUERY").unwrap();
        custom.name = "报警记录".into();
        let catalog =
            InMemoryCatalog::factory_defaults().with_factory_intents("f2", vec![custom]);

        assert_eq!(catalog.get("f2", "ALERT_QUERY").unwrap().name, "报警记录");
        assert_eq!(catalog.get("f1", "ALERT_QUERY").unwrap().name, "告警查询");
        let f2 = catalog.intents("f2");
        assert_eq!(f2.iter().filter(|i| i.intent_code == "ALERT_QUERY").count(), 1);
    }

    #[test]
    fn toml_catalog_round() {
        let toml = r#"
[[intents]]
intent_code = "WAGE_QUERY"
name = "工资查询"
domain = "ATTENDANCE"
action = "QUERY"
required_slots = ["TIME_RANGE"]
keywords = ["工资"]

[[compositions]]
domain = "ATTENDANCE"
action = "QUERY"
intent_code = "WAGE_QUERY"
"#;
        let catalog = InMemoryCatalog::from_toml(toml).unwrap();
        let wage = catalog.get("any", "WAGE_QUERY").unwrap();
        assert!(wage.executor_bound);
        assert_eq!(wage.risk_level, RiskLevel::Low);
        assert_eq!(
            catalog
                .compose("any", Domain::Attendance, ActionType::Query, None)
                .as_deref(),
            Some("WAGE_QUERY")
        );
    }

    #[test]
    fn toml_catalog_rejects_dangling_composition() {
        let toml = r#"
[[compositions]]
domain = "ALERT"
action = "QUERY"
intent_code = "MISSING"
"#;
        assert!(matches!(
            InMemoryCatalog::from_toml(toml),
            Err(PipelineError::Config(_))
        ));
    }
}
