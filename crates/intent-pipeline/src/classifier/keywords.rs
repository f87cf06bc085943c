//! Immutable keyword configuration for the two-stage classifier.
//!
//! Built once (defaults or TOML) and shared behind `Arc`; nothing mutates
//! these tables after construction.

use serde::Deserialize;

use intent_protocol::Domain;

/// Domain dictionaries in priority order: the first domain with a hit wins.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainKeywords {
    pub domains: Vec<DomainEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainEntry {
    pub domain: Domain,
    pub keywords: Vec<String>,
}

impl DomainKeywords {
    /// Every domain whose dictionary matches `text`, in priority order.
    pub fn matches(&self, text: &str) -> Vec<Domain> {
        self.domains
            .iter()
            .filter(|e| e.keywords.iter().any(|k| text.contains(k.as_str())))
            .map(|e| e.domain)
            .collect()
    }

    /// True when `text` contains any keyword of any domain.
    pub fn any_match(&self, text: &str) -> bool {
        self.domains
            .iter()
            .any(|e| e.keywords.iter().any(|k| text.contains(k.as_str())))
    }

    pub fn keywords_for(&self, domain: Domain) -> &[String] {
        self.domains
            .iter()
            .find(|e| e.domain == domain)
            .map(|e| e.keywords.as_slice())
            .unwrap_or(&[])
    }
}

impl Default for DomainKeywords {
    fn default() -> Self {
        let table: &[(Domain, &[&str])] = &[
            (
                Domain::Material,
                &["原料", "原材料", "物料", "材料", "入库", "库存", "批次", "食材"],
            ),
            (
                Domain::Shipment,
                &["出货", "发货", "出库", "物流", "运单", "配送", "订单"],
            ),
            (
                Domain::Attendance,
                &["考勤", "打卡", "出勤", "请假", "迟到", "早退", "缺勤", "加班", "排班"],
            ),
            (
                Domain::Equipment,
                &["设备", "机台", "机器", "停机", "维修", "保养", "稼动", "故障"],
            ),
            (
                Domain::Quality,
                &["质检", "质量", "合格", "不良", "次品", "检验", "良品"],
            ),
            (
                Domain::Processing,
                &["生产计划", "排产", "加工", "生产", "工单", "产量", "产线", "报工"],
            ),
            (Domain::Alert, &["告警", "报警", "预警", "异常"]),
            (Domain::Supplier, &["供应商", "供货", "采购"]),
            (Domain::Customer, &["客户", "买家", "顾客"]),
        ];
        Self {
            domains: table
                .iter()
                .map(|(domain, words)| DomainEntry {
                    domain: *domain,
                    keywords: words.iter().map(|w| w.to_string()).collect(),
                })
                .collect(),
        }
    }
}

/// Word lists for the stage-2 action cascade.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRules {
    pub question_patterns: Vec<String>,
    pub status_nouns: Vec<String>,
    pub time_words: Vec<String>,
    pub deletion_verbs: Vec<String>,
    pub creation_verbs: Vec<String>,
    pub mutation_verbs: Vec<String>,
    /// Verbs that, leading a sentence with no time context, read as a command.
    pub imperative_verbs: Vec<String>,
    pub negation_markers: Vec<String>,
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Default for ActionRules {
    fn default() -> Self {
        Self {
            question_patterns: owned(&[
                "多少", "几", "吗", "什么", "哪些", "哪个", "哪家", "哪里", "是谁", "怎么样", "如何",
                "有没有", "是否", "查询", "查看", "查一下", "查", "看看", "看一下", "显示", "列出",
                "统计", "多久", "？", "?",
            ]),
            status_nouns: owned(&["状态", "进度", "情况", "记录", "明细", "列表", "详情", "报表"]),
            time_words: owned(&["今天", "昨天", "本周", "本月", "上个月", "最近", "去年", "今年"]),
            deletion_verbs: owned(&["删除", "作废", "报废", "销毁", "移除"]),
            creation_verbs: owned(&[
                "创建", "新建", "新增", "添加", "登记", "录入", "安排", "下单", "提交", "开一个", "建一个",
            ]),
            mutation_verbs: owned(&[
                "修改", "更新", "更改", "改成", "改为", "调整", "变更", "设置为", "标记", "启用", "停用",
            ]),
            imperative_verbs: owned(&["入库", "出库", "发货", "打卡", "排产", "报工", "派工", "领料"]),
            negation_markers: owned(&["不要", "别", "没有", "难道", "不用", "不需要", "不必"]),
        }
    }
}

impl ActionRules {
    pub fn first_hit<'a>(words: &'a [String], text: &str) -> Option<&'a str> {
        words.iter().find(|w| text.contains(w.as_str())).map(String::as_str)
    }
}
