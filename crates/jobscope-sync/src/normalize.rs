//! Raw card → [`JobRecord`]: text cleanup plus derived attributes.
//!
//! Everything here is a pure function of the raw record. The collected timestamp is the
//! extraction time, so normalizing the same raw record twice yields identical output.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use jobscope_core::{
    ContractType, ExperienceLevel, JobRecord, RawJobRecord, RemoteType, Salary,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAX_DESCRIPTION_CHARS: usize = 5000;
/// Salary figures below this are read as thousands ("45 - 55 €" means 45k-55k).
const KILO_THRESHOLD: f64 = 200.0;
const MAX_REQUIREMENTS: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("raw record is missing `{0}`")]
    MissingField(&'static str),
    #[error("malformed raw record: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// text cleanup

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

const ENTITIES: [(&str, &str); 7] = [
    ("&nbsp;", " "),
    ("&amp;", "&"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
];

/// Strips markup remnants, decodes the common entities, collapses whitespace and caps length.
pub fn clean_text(text: &str) -> String {
    let mut cleaned = TAG_RE.replace_all(text, " ").into_owned();
    for (entity, replacement) in ENTITIES {
        cleaned = cleaned.replace(entity, replacement);
    }
    let collapsed = SPACE_RE.replace_all(cleaned.trim(), " ");
    collapsed.chars().take(MAX_DESCRIPTION_CHARS).collect()
}

fn identity_fragment(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Title + company signature used for cross-source collapse.
pub fn signature(title: &str, company: &str) -> String {
    format!("{}\u{1f}{}", identity_fragment(title), identity_fragment(company))
}

pub fn fingerprint(title: &str, company: &str, source_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature(title, company).as_bytes());
    hasher.update([0x1f]);
    hasher.update(source_id.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// technologies

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechCategory {
    Language,
    Framework,
    Database,
    Cloud,
    Tool,
}

/// Canonical name, category and the spellings that count as a mention.
const TECHNOLOGIES: &[(&str, TechCategory, &[&str])] = &[
    ("python", TechCategory::Language, &["python"]),
    ("javascript", TechCategory::Language, &["javascript", "js"]),
    ("typescript", TechCategory::Language, &["typescript"]),
    ("java", TechCategory::Language, &["java"]),
    ("kotlin", TechCategory::Language, &["kotlin"]),
    ("scala", TechCategory::Language, &["scala"]),
    ("go", TechCategory::Language, &["golang", "go"]),
    ("rust", TechCategory::Language, &["rust"]),
    ("c++", TechCategory::Language, &["c++"]),
    ("c#", TechCategory::Language, &["c#", ".net", "dotnet"]),
    ("php", TechCategory::Language, &["php"]),
    ("ruby", TechCategory::Language, &["ruby"]),
    ("swift", TechCategory::Language, &["swift"]),
    ("sql", TechCategory::Language, &["sql"]),
    ("react", TechCategory::Framework, &["react", "reactjs", "react.js"]),
    ("vue", TechCategory::Framework, &["vuejs", "vue.js", "vue 3"]),
    ("angular", TechCategory::Framework, &["angular"]),
    ("node.js", TechCategory::Framework, &["node.js", "nodejs", "node"]),
    ("django", TechCategory::Framework, &["django"]),
    ("flask", TechCategory::Framework, &["flask"]),
    ("fastapi", TechCategory::Framework, &["fastapi"]),
    ("spring", TechCategory::Framework, &["spring", "spring boot"]),
    ("symfony", TechCategory::Framework, &["symfony"]),
    ("laravel", TechCategory::Framework, &["laravel"]),
    ("pandas", TechCategory::Framework, &["pandas"]),
    ("numpy", TechCategory::Framework, &["numpy"]),
    ("scikit-learn", TechCategory::Framework, &["scikit-learn", "sklearn"]),
    ("tensorflow", TechCategory::Framework, &["tensorflow"]),
    ("pytorch", TechCategory::Framework, &["pytorch"]),
    ("transformers", TechCategory::Framework, &["transformers", "hugging face"]),
    ("spark", TechCategory::Framework, &["spark", "pyspark"]),
    ("postgresql", TechCategory::Database, &["postgresql", "postgres"]),
    ("mysql", TechCategory::Database, &["mysql"]),
    ("mongodb", TechCategory::Database, &["mongodb", "mongo"]),
    ("redis", TechCategory::Database, &["redis"]),
    ("elasticsearch", TechCategory::Database, &["elasticsearch"]),
    ("snowflake", TechCategory::Database, &["snowflake"]),
    ("bigquery", TechCategory::Database, &["bigquery"]),
    ("aws", TechCategory::Cloud, &["aws", "amazon web services"]),
    ("azure", TechCategory::Cloud, &["azure"]),
    ("gcp", TechCategory::Cloud, &["gcp", "google cloud"]),
    ("docker", TechCategory::Tool, &["docker"]),
    ("kubernetes", TechCategory::Tool, &["kubernetes", "k8s"]),
    ("terraform", TechCategory::Tool, &["terraform"]),
    ("ansible", TechCategory::Tool, &["ansible"]),
    ("jenkins", TechCategory::Tool, &["jenkins"]),
    ("gitlab", TechCategory::Tool, &["gitlab", "gitlab ci"]),
    ("git", TechCategory::Tool, &["git"]),
    ("airflow", TechCategory::Tool, &["airflow"]),
    ("dbt", TechCategory::Tool, &["dbt"]),
    ("kafka", TechCategory::Tool, &["kafka"]),
    ("tableau", TechCategory::Tool, &["tableau"]),
    ("power bi", TechCategory::Tool, &["power bi", "powerbi"]),
    ("jira", TechCategory::Tool, &["jira"]),
    ("figma", TechCategory::Tool, &["figma"]),
];

struct TechMatcher {
    name: &'static str,
    pattern: Regex,
}

/// Whole-token, case-insensitive. `+` and `#` count as token characters, so "c" never
/// matches inside "c++"; a preceding `.` keeps "node.js" from also reading as "js".
static TECH_MATCHERS: LazyLock<Vec<TechMatcher>> = LazyLock::new(|| {
    TECHNOLOGIES
        .iter()
        .map(|(name, _, spellings)| {
            let alternatives = spellings
                .iter()
                .map(|s| regex::escape(s))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(
                r"(?i)(?:^|[^\p{{L}}\p{{N}}+#.])(?:{alternatives})(?:$|[^\p{{L}}\p{{N}}+#])"
            );
            TechMatcher {
                name,
                pattern: Regex::new(&pattern).expect("valid regex"),
            }
        })
        .collect()
});

pub fn extract_technologies(text: &str) -> BTreeSet<String> {
    TECH_MATCHERS
        .iter()
        .filter(|m| m.pattern.is_match(text))
        .map(|m| m.name.to_string())
        .collect()
}

pub fn technology_category(name: &str) -> Option<TechCategory> {
    TECHNOLOGIES
        .iter()
        .find(|(canonical, _, _)| *canonical == name)
        .map(|(_, category, _)| *category)
}

// ---------------------------------------------------------------------------
// salary

const NUM: &str = r"\d{1,3}(?:[ \x{a0}\x{202f}.]\d{3})+|\d+(?:[.,]\d+)?";
const SEP: &str = r"\s*(?:-|–|à|to)\s*";

struct SalaryPattern {
    pattern: Regex,
    currency: &'static str,
    /// Every figure in the match is in thousands.
    kilo: bool,
}

static SALARY_PATTERNS: LazyLock<Vec<SalaryPattern>> = LazyLock::new(|| {
    let build = |pattern: String, currency, kilo| SalaryPattern {
        pattern: Regex::new(&pattern).expect("valid regex"),
        currency,
        kilo,
    };
    vec![
        // 45k€ - 55k€, 55K à 70K €
        build(format!(r"(?i)({NUM})\s*k\s*€?{SEP}({NUM})\s*k"), "EUR", true),
        // 55 000 € - 70 000 €, 45000 - 55000 euros
        build(format!(r"(?i)({NUM})\s*€?{SEP}({NUM})\s*(?:€|euros?\b|eur\b)"), "EUR", false),
        // $90k - $120k
        build(format!(r"(?i)\$\s*({NUM})\s*(k)?{SEP}\$?\s*({NUM})\s*(k)?"), "USD", false),
        // Salaire : 50k
        build(
            format!(r"(?i)(?:salaire|rémunération|package|salary)\s*:?\s*({NUM})\s*(k)?"),
            "EUR",
            false,
        ),
        // 50k€
        build(format!(r"(?i)({NUM})\s*k€"), "EUR", true),
    ]
});

fn parse_amount(raw: &str) -> Option<f64> {
    let compact = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}'))
        .collect::<String>();
    // "55.000" is a grouped thousand, "45.5" and "45,5" are decimals.
    let grouped = compact.len() > 4
        && compact
            .rsplit_once('.')
            .is_some_and(|(_, tail)| tail.len() == 3 && !compact.contains(','));
    let normalized = if grouped {
        compact.replace('.', "")
    } else {
        compact.replace(',', ".")
    };
    normalized.parse::<f64>().ok()
}

fn scale(value: f64, kilo: bool) -> Option<u32> {
    let scaled = if kilo || value < KILO_THRESHOLD {
        value * 1000.0
    } else {
        value
    };
    if scaled <= 0.0 || scaled > f64::from(u32::MAX) {
        return None;
    }
    Some(scaled.round() as u32)
}

/// Ordered patterns, first match wins. Unparseable text with a dedicated salary field is
/// kept verbatim.
pub fn extract_salary(salary_text: Option<&str>, description: &str) -> Option<Salary> {
    let hint = salary_text.map(str::trim).filter(|s| !s.is_empty());
    let haystacks = hint.into_iter().chain(std::iter::once(description));
    for text in haystacks {
        if let Some(salary) = match_salary(text) {
            return Some(salary);
        }
    }
    hint.map(|text| Salary::Text {
        text: text.to_string(),
    })
}

fn match_salary(text: &str) -> Option<Salary> {
    for SalaryPattern {
        pattern,
        currency,
        kilo,
    } in SALARY_PATTERNS.iter()
    {
        let Some(caps) = pattern.captures(text) else {
            continue;
        };
        let kilo = *kilo
            || caps
                .iter()
                .skip(1)
                .flatten()
                .any(|m| m.as_str().eq_ignore_ascii_case("k"));
        let figures = caps
            .iter()
            .skip(1)
            .flatten()
            .filter(|m| !m.as_str().eq_ignore_ascii_case("k"))
            .filter_map(|m| parse_amount(m.as_str()))
            .filter_map(|v| scale(v, kilo))
            .collect::<Vec<_>>();
        let (min, max) = match figures.as_slice() {
            [single] => (*single, *single),
            [a, b, ..] => ((*a).min(*b), (*a).max(*b)),
            [] => continue,
        };
        return Some(Salary::Range {
            min,
            max,
            currency: currency.to_string(),
        });
    }
    None
}

// ---------------------------------------------------------------------------
// remote work

const REMOTE_FAMILIES: &[(RemoteType, &[(&str, f64)])] = &[
    (
        RemoteType::FullRemote,
        &[
            ("full remote", 3.0),
            ("fully remote", 3.0),
            ("100% remote", 3.0),
            ("100 % remote", 3.0),
            ("remote only", 3.0),
            ("télétravail complet", 3.0),
            ("télétravail total", 3.0),
            ("100% télétravail", 3.0),
            ("entièrement à distance", 3.0),
            ("remote first", 2.0),
            ("depuis chez vous", 2.0),
            ("anywhere", 1.0),
        ],
    ),
    (
        RemoteType::Hybrid,
        &[
            ("hybride", 3.0),
            ("hybrid", 3.0),
            ("télétravail partiel", 3.0),
            ("partiellement remote", 3.0),
            ("jours de télétravail", 2.0),
            ("télétravail possible", 2.0),
            ("remote friendly", 2.0),
            ("flex office", 1.0),
            ("2-3 jours", 1.0),
            ("télétravail", 1.0),
            ("teletravail", 1.0),
        ],
    ),
    (
        RemoteType::OnSite,
        &[
            ("présentiel", 3.0),
            ("sur site", 3.0),
            ("on-site", 3.0),
            ("onsite", 3.0),
            ("bureau obligatoire", 3.0),
            ("pas de télétravail", 3.0),
            ("in office", 2.0),
        ],
    ),
];

/// Weighted keyword families. Confidence combines how dominant the winning family is with
/// how much evidence it has (saturating at one strong keyword). Families tied at the top
/// read as mixed signals, i.e. hybrid.
pub fn classify_remote(text: &str) -> (RemoteType, f64) {
    let lowered = text.to_lowercase();
    let scores = REMOTE_FAMILIES
        .iter()
        .map(|(kind, keywords)| {
            let score = keywords
                .iter()
                .filter(|(keyword, _)| lowered.contains(keyword))
                .map(|(_, weight)| weight)
                .sum::<f64>();
            (*kind, score)
        })
        .collect::<Vec<_>>();

    let total = scores.iter().map(|(_, s)| s).sum::<f64>();
    let best = scores.iter().map(|(_, s)| *s).fold(0.0, f64::max);
    if best <= 0.0 {
        return (RemoteType::Unknown, 0.0);
    }
    let leaders = scores
        .iter()
        .filter(|(_, s)| (*s - best).abs() < f64::EPSILON)
        .map(|(kind, _)| *kind)
        .collect::<Vec<_>>();
    let kind = match leaders.as_slice() {
        [only] => *only,
        _ => RemoteType::Hybrid,
    };
    let confidence = (best / total) * (best / 3.0).min(1.0);
    (kind, (confidence * 100.0).round() / 100.0)
}

// ---------------------------------------------------------------------------
// experience level

static EXPERIENCE_PATTERNS: LazyLock<Vec<(ExperienceLevel, Vec<Regex>)>> = LazyLock::new(|| {
    let compile = |patterns: &[&str]| {
        patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).expect("valid regex"))
            .collect::<Vec<_>>()
    };
    vec![
        (
            ExperienceLevel::Junior,
            compile(&[
                r"\bjunior\b",
                r"\bdébutante?s?\b",
                r"\bstage\b|\bstagiaire\b|\binternship\b",
                r"\balternance\b|\bapprenti",
                r"\bentry[- ]level\b|\bgraduate\b",
                r"\b0\s*(?:-|à)\s*2\s*ans\b",
                r"première expérience",
            ]),
        ),
        (
            ExperienceLevel::Mid,
            compile(&[
                r"\bconfirmée?s?\b",
                r"\bmid[- ]?level\b",
                r"\bexperienced\b",
                r"\b[2-4]\s*(?:-|à)\s*[3-5]\s*ans\b",
                r"\b[2-4]\s*\+?\s*(?:ans|years)\b",
            ]),
        ),
        (
            ExperienceLevel::Senior,
            compile(&[
                r"\bsenior\b",
                r"\bexpert\b",
                r"\bprincipal\b",
                r"\barchitecte?\b",
                r"\bexpérimentée?s?\b",
                r"\b(?:[5-9]|1\d)\s*\+?\s*(?:ans|years)\b",
            ]),
        ),
        (
            ExperienceLevel::Lead,
            compile(&[
                r"\blead\b",
                r"\bhead of\b",
                r"\bmanager\b",
                r"\bchef\b",
                r"\bdirect(?:eur|rice|or)\b",
                r"\bresponsable\b",
            ]),
        ),
    ]
});

/// Max-score voting; a match in the title counts double. Ties and no evidence → mid.
pub fn classify_experience(title: &str, description: &str) -> ExperienceLevel {
    let scored = EXPERIENCE_PATTERNS
        .iter()
        .map(|(level, patterns)| {
            let score = patterns
                .iter()
                .map(|p| 2 * usize::from(p.is_match(title)) + usize::from(p.is_match(description)))
                .sum::<usize>();
            (*level, score)
        })
        .collect::<Vec<_>>();

    let best = scored.iter().map(|(_, s)| *s).max().unwrap_or(0);
    if best == 0 {
        return ExperienceLevel::Mid;
    }
    let mut leaders = scored.iter().filter(|(_, s)| *s == best);
    match (leaders.next(), leaders.next()) {
        (Some((level, _)), None) => *level,
        _ => ExperienceLevel::Mid,
    }
}

// ---------------------------------------------------------------------------
// contract type

static CONTRACT_PATTERNS: LazyLock<Vec<(ContractType, Regex)>> = LazyLock::new(|| {
    [
        (ContractType::Internship, r"\bstage\b|\bstagiaire\b|\binternship\b|\bintern\b"),
        (ContractType::Apprenticeship, r"\balternance\b|\bapprenti|\bcontrat pro\b"),
        (
            ContractType::Freelance,
            r"\bfreelance\b|\bindépendant\b|\bportage salarial\b|\btjm\b|\bcontractor\b",
        ),
        (
            ContractType::FixedTerm,
            r"\bcdd\b|durée déterminée|\bfixed[- ]term\b|\btemporary\b|\bintérim\b",
        ),
        (ContractType::Permanent, r"\bcdi\b|durée indéterminée|\bpermanent\b"),
    ]
    .into_iter()
    .map(|(kind, pattern)| {
        (
            kind,
            Regex::new(&format!("(?i){pattern}")).expect("valid regex"),
        )
    })
    .collect()
});

fn match_contract(text: &str) -> Option<ContractType> {
    CONTRACT_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map(|(kind, _)| *kind)
}

/// The card's own contract field wins, then the posting text, then CDI.
pub fn detect_contract(hint: Option<&str>, title: &str, description: &str) -> ContractType {
    hint.and_then(|h| ContractType::from_label(h).or_else(|| match_contract(h)))
        .or_else(|| match_contract(title))
        .or_else(|| match_contract(description))
        .unwrap_or(ContractType::Permanent)
}

// ---------------------------------------------------------------------------
// requirements, benefits, quality

static REQUIREMENTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:compétences|skills|requis|required|must have|profil recherché|vous maîtrisez|experience with|technologies|outils|stack)\s*:?\s*([^.\n]+)",
    )
    .expect("valid regex")
});
static REQUIREMENT_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,;•]|\s-\s|\bet\b|\band\b").expect("valid regex"));

pub fn extract_requirements(description: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut requirements = Vec::new();
    for caps in REQUIREMENTS_RE.captures_iter(description) {
        let Some(section) = caps.get(1) else {
            continue;
        };
        for fragment in REQUIREMENT_SPLIT_RE.split(section.as_str()) {
            let fragment = fragment.trim();
            let len = fragment.chars().count();
            if !(3..50).contains(&len) {
                continue;
            }
            if seen.insert(fragment.to_lowercase()) {
                requirements.push(fragment.to_string());
            }
            if requirements.len() == MAX_REQUIREMENTS {
                return requirements;
            }
        }
    }
    requirements
}

const BENEFITS: &[&str] = &[
    "mutuelle",
    "tickets restaurant",
    "ticket restaurant",
    "carte swile",
    "intéressement",
    "participation",
    "stock options",
    "bspce",
    "budget formation",
    "rtt",
    "remboursement transport",
    "horaires flexibles",
];

pub fn mentions_benefits(text: &str) -> bool {
    let lowered = text.to_lowercase();
    BENEFITS.iter().any(|b| lowered.contains(b))
}

/// 0-10 completeness score of a normalized posting.
pub fn quality_score(record: &JobRecord) -> f64 {
    let mut score = 0.0;
    if record.description.chars().count() > 200 {
        score += 2.0;
    }
    if record.salary.is_some() {
        score += 1.5;
    }
    if !record.technologies.is_empty() {
        score += 1.0;
    }
    if record.requirements.len() > 3 {
        score += 1.0;
    }
    if record.remote_confidence > 0.5 {
        score += 0.5;
    }
    if record.location.chars().count() > 5 {
        score += 0.5;
    }
    if mentions_benefits(&record.description) {
        score += 0.5;
    }
    f64::min(score, 10.0)
}

// ---------------------------------------------------------------------------

fn required(value: Option<&str>, field: &'static str) -> Result<String, NormalizationError> {
    let cleaned = clean_text(value.unwrap_or_default());
    if cleaned.is_empty() {
        return Err(NormalizationError::MissingField(field));
    }
    Ok(cleaned)
}

fn checked_url(url: Option<&str>) -> Result<Option<String>, NormalizationError> {
    let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    let absolute = url.starts_with("https://") || url.starts_with("http://");
    if !absolute || url.contains(char::is_whitespace) {
        return Err(NormalizationError::Malformed(format!(
            "url {url}: not an absolute http(s) link"
        )));
    }
    Ok(Some(url.to_string()))
}

pub fn normalize(raw: &RawJobRecord) -> Result<JobRecord, NormalizationError> {
    let title = required(raw.title.as_deref(), "title")?;
    let company = required(raw.company.as_deref(), "company")?;
    let location = clean_text(raw.location.as_deref().unwrap_or_default());
    let description_raw = raw.description.clone().unwrap_or_default();
    let description = clean_text(&description_raw);
    let url = checked_url(raw.url.as_deref())?;

    let technologies = extract_technologies(&format!("{title} {description}"));
    let requirements = extract_requirements(&description);
    let salary = extract_salary(raw.salary_text.as_deref(), &description);
    let (remote_type, remote_confidence) =
        classify_remote(&format!("{title} {location} {description}"));
    let experience_level = classify_experience(&title, &description);
    let contract_type = detect_contract(raw.contract_hint.as_deref(), &title, &description);

    let mut record = JobRecord {
        fingerprint: fingerprint(&title, &company, &raw.source_id),
        title,
        company,
        location,
        description_raw,
        description,
        technologies,
        requirements,
        salary,
        remote_type,
        remote_confidence,
        experience_level,
        contract_type,
        quality_score: 0.0,
        source_id: raw.source_id.clone(),
        url,
        search_term: raw.search_term.clone(),
        collected_at: raw.extracted_at,
        active: true,
    };
    record.quality_score = quality_score(&record);
    Ok(record)
}
