//! Entity identifiers, dictionary slots (metric, department, status) and person names.

use regex::Regex;
use std::sync::LazyLock;

use intent_protocol::SlotType;

use crate::span::{Candidate, scan_dictionary, sort_candidates};

// ── Entity IDs ────────────────────────────────────────────────

// Direct forms: a known prefix followed by digits. The leading group stands in
// for a word boundary, since `\b` does not separate Han characters from ASCII.
const DIRECT_ID_PATTERNS: &[(SlotType, &str)] = &[
    (
        SlotType::BatchId,
        r"(?i)(?:^|[^a-z0-9])((?:MB|PB|BATCH|LOT)-?[0-9]{4,}(?:-[0-9]+)?)",
    ),
    (
        SlotType::OrderId,
        r"(?i)(?:^|[^a-z0-9])((?:SO|PO|ORD|WO)-?[0-9]{4,}(?:-[0-9]+)?)",
    ),
    (SlotType::DeviceId, r"(?i)(?:^|[^a-z0-9])((?:EQ|DEV|EQP)-?[0-9]{3,})"),
    (SlotType::EmployeeId, r"(?i)(?:^|[^a-z0-9])((?:EMP|STAFF)-?[0-9]{3,})"),
    (SlotType::CustomerId, r"(?i)(?:^|[^a-z0-9])((?:CUS|CUST)-?[0-9]{3,})"),
    (SlotType::ProductId, r"(?i)(?:^|[^a-z0-9])((?:PRD|PROD|SKU)-?[0-9]{3,})"),
    (SlotType::SupplierId, r"(?i)(?:^|[^a-z0-9])((?:SUP|SUPP|VEN)-?[0-9]{3,})"),
    (SlotType::MaterialId, r"(?i)(?:^|[^a-z0-9])((?:MAT|RM)-?[0-9]{3,})"),
];

// Context forms: a Chinese label followed by a bare code ("批次20240301", "工号 1024").
const CONTEXT_ID_PATTERNS: &[(SlotType, &str)] = &[
    (SlotType::BatchId, r"(?:批次|批号)\s*(?:号)?\s*[:：]?\s*([A-Za-z0-9][A-Za-z0-9-]{3,})"),
    (SlotType::OrderId, r"(?:订单|工单)\s*(?:号)?\s*[:：]?\s*([A-Za-z0-9][A-Za-z0-9-]{3,})"),
    (SlotType::DeviceId, r"(?:设备|机台)\s*(?:编号|号)?\s*[:：]?\s*([A-Za-z0-9][A-Za-z0-9-]*)"),
    (SlotType::EmployeeId, r"(?:工号|员工编号)\s*[:：]?\s*([A-Za-z0-9]{3,})"),
    (SlotType::CustomerId, r"客户\s*(?:编号|编码)\s*[:：]?\s*([A-Za-z0-9-]{3,})"),
    (SlotType::ProductId, r"(?:产品|物料号)\s*(?:编号|编码)\s*[:：]?\s*([A-Za-z0-9-]{3,})"),
    (SlotType::SupplierId, r"供应商\s*(?:编号|编码)\s*[:：]?\s*([A-Za-z0-9-]{3,})"),
    (SlotType::MaterialId, r"(?:物料|原料|材料)\s*(?:编号|编码)\s*[:：]?\s*([A-Za-z0-9-]{3,})"),
];

static DIRECT_IDS: LazyLock<Vec<(SlotType, Regex)>> = LazyLock::new(|| compile(DIRECT_ID_PATTERNS));
static CONTEXT_IDS: LazyLock<Vec<(SlotType, Regex)>> = LazyLock::new(|| compile(CONTEXT_ID_PATTERNS));

fn compile(patterns: &[(SlotType, &str)]) -> Vec<(SlotType, Regex)> {
    patterns
        .iter()
        .map(|(t, p)| (*t, Regex::new(p).unwrap()))
        .collect()
}

/// Entity ID candidates of every ID type. Values are uppercased.
pub fn entity_candidates(text: &str) -> Vec<Candidate<SlotType>> {
    let mut out = Vec::new();
    for (patterns, confidence) in [(&*DIRECT_IDS, 0.95), (&*CONTEXT_IDS, 0.85)] {
        for (slot_type, re) in patterns {
            for caps in re.captures_iter(text) {
                let Some(m) = caps.get(1) else { continue };
                // Context codes must carry at least one digit ("设备状态" is not an ID).
                if !m.as_str().bytes().any(|b| b.is_ascii_digit()) {
                    continue;
                }
                out.push(Candidate::new(
                    m.start(),
                    m.end(),
                    m.as_str(),
                    m.as_str().to_uppercase(),
                    confidence,
                    *slot_type,
                ));
            }
        }
    }
    sort_candidates(&mut out);
    out
}

// ── Dictionaries ──────────────────────────────────────────────

/// Surface form → canonical metric name.
const METRICS: &[(&str, &str)] = &[
    ("产量", "产量"),
    ("销量", "销量"),
    ("销售额", "销售额"),
    ("营收", "销售额"),
    ("合格率", "合格率"),
    ("良品率", "合格率"),
    ("良率", "合格率"),
    ("不良率", "不良率"),
    ("次品率", "不良率"),
    ("出勤率", "出勤率"),
    ("库存量", "库存量"),
    ("库存", "库存量"),
    ("入库量", "入库量"),
    ("出库量", "出库量"),
    ("发货量", "发货量"),
    ("能耗", "能耗"),
    ("稼动率", "设备利用率"),
    ("利用率", "设备利用率"),
    ("OEE", "OEE"),
    ("故障率", "故障率"),
    ("停机时长", "停机时长"),
    ("成本", "成本"),
    ("利润", "利润"),
    ("准时交付率", "准时交付率"),
    ("交付率", "准时交付率"),
    ("工时", "工时"),
    ("加班时长", "加班时长"),
    ("损耗率", "损耗率"),
];

const DEPARTMENTS: &[(&str, &str)] = &[
    ("生产部", "生产部"),
    ("质检部", "质检部"),
    ("质量部", "质检部"),
    ("品管部", "质检部"),
    ("仓储部", "仓储部"),
    ("仓库", "仓储部"),
    ("采购部", "采购部"),
    ("销售部", "销售部"),
    ("财务部", "财务部"),
    ("人事部", "人事部"),
    ("人力资源部", "人事部"),
    ("设备部", "设备部"),
    ("物流部", "物流部"),
    ("研发部", "研发部"),
];

static RE_WORKSHOP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[0-9]+|[一二三四五六七八九十]+|[A-Za-z])号?(?:车间|产线|生产线|班组)").unwrap()
});

/// Surface form → status code handed to executors.
const STATUSES: &[(&str, &str)] = &[
    ("待处理", "PENDING"),
    ("未处理", "PENDING"),
    ("处理中", "IN_PROGRESS"),
    ("进行中", "IN_PROGRESS"),
    ("已完成", "COMPLETED"),
    ("已取消", "CANCELLED"),
    ("已过期", "EXPIRED"),
    ("即将过期", "EXPIRING"),
    ("快过期", "EXPIRING"),
    ("不合格", "UNQUALIFIED"),
    ("合格", "QUALIFIED"),
    ("待检", "PENDING_INSPECTION"),
    ("已入库", "STOCKED_IN"),
    ("已出库", "STOCKED_OUT"),
    ("已发货", "SHIPPED"),
    ("未发货", "NOT_SHIPPED"),
    ("在途", "IN_TRANSIT"),
    ("运行中", "RUNNING"),
    ("停机", "STOPPED"),
    ("维修中", "UNDER_REPAIR"),
    ("故障", "FAULT"),
    ("异常", "ABNORMAL"),
    ("缺勤", "ABSENT"),
    ("迟到", "LATE"),
];

/// Metric mentions, canonicalized.
pub fn metric_candidates(text: &str) -> Vec<Candidate<()>> {
    mapped_dictionary(text, METRICS, 0.9)
}

/// Department names from the dictionary plus numbered workshops / lines ("二车间").
pub fn department_candidates(text: &str) -> Vec<Candidate<()>> {
    let mut out = mapped_dictionary(text, DEPARTMENTS, 0.9);
    for m in RE_WORKSHOP.find_iter(text) {
        out.push(Candidate::new(m.start(), m.end(), m.as_str(), m.as_str(), 0.85, ()));
    }
    sort_candidates(&mut out);
    out
}

pub fn status_candidates(text: &str) -> Vec<Candidate<()>> {
    mapped_dictionary(text, STATUSES, 0.85)
}

fn mapped_dictionary(text: &str, table: &[(&str, &str)], confidence: f64) -> Vec<Candidate<()>> {
    let words: Vec<&str> = table.iter().map(|(w, _)| *w).collect();
    let mut out: Vec<Candidate<()>> = scan_dictionary(text, &words)
        .into_iter()
        .filter_map(|(start, end, word)| {
            let canonical = table.iter().find(|(w, _)| *w == word)?.1;
            Some(Candidate::new(start, end, word, canonical, confidence, ()))
        })
        .collect();
    sort_candidates(&mut out);
    out
}

// ── Person names ──────────────────────────────────────────────

const SURNAMES: &str = "王李张刘陈杨黄赵吴周徐孙马朱胡郭何高林罗郑梁谢宋唐许韩冯邓曹彭曾肖田董袁潘于蒋蔡余杜叶程苏魏吕丁任沈姚卢姜崔钟谭陆汪范金石廖贾夏韦付方白邹孟熊秦邱江尹薛闫段雷侯龙史陶黎贺顾毛郝龚邵万钱严覃武戴莫孔向汤";

// Han characters that cannot continue a given name in practice.
const NAME_STOP: &str = "的了是在和与及把被给对从到吗呢吧啊这那个考勤请查看本上下近最今昨有没多少几和跟";

static RE_TITLED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"([{SURNAMES}](?:师傅|经理|主管|组长|班长|工程师|总监|老师))")).unwrap()
});

static RE_ROLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:员工|工人|操作员|负责人|质检员|司机|同事|业务员)\s*([{SURNAMES}][\p{{Han}}--[{NAME_STOP}]]{{1,2}})"
    ))
    .unwrap()
});

static RE_POSSESSIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"([{SURNAMES}][\p{{Han}}--[{NAME_STOP}]]{{1,2}})的(?:考勤|出勤|工时|排班|绩效|请假|加班|产量)"
    ))
    .unwrap()
});

pub fn person_candidates(text: &str) -> Vec<Candidate<()>> {
    let mut out = Vec::new();
    for (re, confidence) in [
        (&*RE_ROLE_NAME, 0.8),
        (&*RE_POSSESSIVE_NAME, 0.75),
        (&*RE_TITLED_NAME, 0.7),
    ] {
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                out.push(Candidate::new(m.start(), m.end(), m.as_str(), m.as_str(), confidence, ()));
            }
        }
    }
    sort_candidates(&mut out);
    out
}

// ── Bare numbers ──────────────────────────────────────────────

static RE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+(?:\.[0-9]+)?").unwrap());

pub fn number_candidates(text: &str) -> Vec<Candidate<()>> {
    RE_NUMBER
        .find_iter(text)
        .map(|m| Candidate::new(m.start(), m.end(), m.as_str(), m.as_str(), 0.6, ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_batch_id_after_han() {
        let c = entity_candidates("处理批次MB-20240301的报废").remove(0);
        assert_eq!(c.payload, SlotType::BatchId);
        assert_eq!(c.value, "MB-20240301");
    }

    #[test]
    fn lowercase_ids_are_uppercased() {
        let c = entity_candidates("查一下 so20240012 的状态").remove(0);
        assert_eq!(c.payload, SlotType::OrderId);
        assert_eq!(c.value, "SO20240012");
        assert_eq!(c.matched_text, "so20240012");
    }

    #[test]
    fn context_forms() {
        let c = entity_candidates("工号 1024 的打卡记录").remove(0);
        assert_eq!(c.payload, SlotType::EmployeeId);
        assert_eq!(c.value, "1024");

        let c = entity_candidates("设备3号停机了").remove(0);
        assert_eq!(c.payload, SlotType::DeviceId);
        assert_eq!(c.value, "3");
    }

    #[test]
    fn label_without_code_is_not_an_id() {
        assert!(entity_candidates("设备状态怎么样").is_empty());
        assert!(entity_candidates("订单情况").is_empty());
    }

    #[test]
    fn metric_synonyms_canonicalize() {
        let c = metric_candidates("上个月的良品率").remove(0);
        assert_eq!(c.value, "合格率");
        assert_eq!(c.matched_text, "良品率");
    }

    #[test]
    fn workshop_is_department() {
        let c = department_candidates("二车间今天的产量").remove(0);
        assert_eq!(c.value, "二车间");
        assert!(department_candidates("合格率最低的车间").is_empty());
    }

    #[test]
    fn status_prefers_longest() {
        let c = status_candidates("不合格的批次").remove(0);
        assert_eq!(c.value, "UNQUALIFIED");
    }

    #[test]
    fn person_names() {
        assert_eq!(person_candidates("员工张三考勤")[0].value, "张三");
        assert_eq!(person_candidates("李明的考勤记录")[0].value, "李明");
        assert_eq!(person_candidates("让王师傅看看")[0].value, "王师傅");
        assert!(person_candidates("今天的产量").is_empty());
    }

    #[test]
    fn numbers() {
        let n = number_candidates("还剩12.5吨");
        assert_eq!(n[0].value, "12.5");
    }
}
